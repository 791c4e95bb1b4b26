//! # corekv - Concurrent Storage Core for a Redis-Compatible Server
//!
//! corekv is the storage substrate and wire format of an in-memory,
//! Redis-compatible key-value server: the pieces that hold data, keep it
//! safe under parallel access, and speak RESP on the wire. Command
//! dispatch, expiry, persistence, and replication are the business of the
//! engine built on top and are not part of this crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           corekv                             │
//! │                                                              │
//! │  ┌──────────┐   payloads   ┌───────────────────────────────┐ │
//! │  │   RESP   │─────────────>│      (command engine,         │ │
//! │  │ decoder  │              │        not in crate)          │ │
//! │  └──────────┘              └──────┬──────────────┬─────────┘ │
//! │                                   │ lock stripes │ get/put   │
//! │                                   ▼              ▼           │
//! │                            ┌───────────┐  ┌─────────────┐    │
//! │                            │ LockTable │  │ ShardedMap  │    │
//! │                            └───────────┘  │  QuickList  │    │
//! │                                           │   values    │    │
//! │                                           └─────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The sharded map and the lock table hash keys identically, so a key's
//! shard and its lock stripe coincide when both are built with the same
//! size. That is what makes multi-key commands safe: lock the stripes in
//! ascending order, touch the shards, release in descending order.
//!
//! ## Module Overview
//!
//! - [`storage`]: the sharded map, striped lock table, and paged list
//! - [`protocol`]: RESP reply types, encoders, and the streaming decoder
//! - [`config`]: the settings surface the server loop consumes
//! - [`server`]: TCP accept loop wiring the decoder to the wire

pub mod config;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export the main types for convenience
pub use config::Config;
pub use protocol::{parse_all, parse_one, parse_stream, ParseError, Payload, RespValue};
pub use server::{listen_and_serve, ServerStats};
pub use storage::{fnv1a_32, LockTable, QuickList, ShardedMap};

/// Version of corekv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
