//! corekv server entry point.
//!
//! Parses the configuration, initializes logging, and runs the accept
//! loop until a shutdown signal arrives.

use corekv::config::Config;
use corekv::server::{listen_and_serve, ServerStats};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!(version = corekv::VERSION, address = %config.address, "starting corekv");

    let stats = Arc::new(ServerStats::new());

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
        info!("shutdown signal received, stopping server");
    };

    tokio::select! {
        result = listen_and_serve(config, Arc::clone(&stats)) => result?,
        _ = shutdown => {}
    }

    info!(
        connections = stats.connections_accepted.load(std::sync::atomic::Ordering::Relaxed),
        "server shutdown complete"
    );
    Ok(())
}
