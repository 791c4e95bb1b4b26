//! TCP accept loop and per-connection handling.
//!
//! The server binds one listener and spawns a task per client. Each task
//! feeds the client's byte stream through the RESP decoder and writes
//! every decoded value straight back re-encoded: a wire-level echo that
//! exercises the codec end to end while the command engine that will sit
//! between decode and encode lives elsewhere.
//!
//! `max_conn` is enforced with a semaphore around the accept loop, and
//! `timeout` bounds how long a connection may sit idle between payloads.

use crate::config::Config;
use crate::protocol::{parse_stream, ParseError, RespValue};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, error, info};

/// Counters shared by every connection task.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being served.
    pub active_connections: AtomicU64,
    /// Total payloads decoded and answered.
    pub payloads_processed: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn payload_processed(&self) {
        self.payloads_processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serves clients on `listener` until the task is cancelled.
pub async fn run(listener: TcpListener, config: Config, stats: Arc<ServerStats>) {
    let limiter = Arc::new(Semaphore::new(config.max_conn));

    loop {
        let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
            return;
        };
        match listener.accept().await {
            Ok((stream, addr)) => {
                stats.connection_opened();
                debug!(%addr, "accepted connection");

                let stats = Arc::clone(&stats);
                let idle = config.timeout;
                tokio::spawn(async move {
                    handle_connection(stream, addr, idle, &stats).await;
                    stats.connection_closed();
                    debug!(%addr, "connection closed");
                    drop(permit);
                });
            }
            Err(err) => {
                error!(%err, "failed to accept connection");
            }
        }
    }
}

/// Echoes decoded payloads back to one client until it disconnects, goes
/// idle past the timeout, or the stream errors.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    idle: std::time::Duration,
    stats: &ServerStats,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut payloads = parse_stream(read_half);
    let mut out = Vec::with_capacity(4 * 1024);

    loop {
        let payload = match time::timeout(idle, payloads.recv()).await {
            Err(_) => {
                debug!(%addr, "idle timeout, closing connection");
                return;
            }
            Ok(None) => return,
            Ok(Some(payload)) => payload,
        };

        let reply = match payload {
            Ok(reply) => reply,
            Err(ParseError::Protocol(msg)) => {
                debug!(%addr, %msg, "protocol error");
                RespValue::error(format!("ERR {msg}"))
            }
            Err(ParseError::Eof) => return,
            Err(ParseError::Io(err)) => {
                debug!(%addr, %err, "read error");
                return;
            }
        };

        stats.payload_processed();
        out.clear();
        reply.serialize_into(&mut out);
        if let Err(err) = write_half.write_all(&out).await {
            debug!(%addr, %err, "write error");
            return;
        }
    }
}

/// Binds `config.address` and runs the accept loop.
pub async fn listen_and_serve(config: Config, stats: Arc<ServerStats>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.address).await?;
    info!(address = %config.address, max_conn = config.max_conn, "listening");
    run(listener, config, stats).await;
    Ok(())
}
