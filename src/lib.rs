//! # gateway-shard
//!
//! A resumable, heartbeat-driven gateway shard client speaking a JSON
//! control protocol over WebSocket.
//!
//! A shard is one unit of horizontal partitioning: the gateway distributes
//! event streams across shards identified by `[shard_index, shard_count]`.
//! This crate implements the session state machine for one shard:
//!
//! - **Handshake**: dial, require `Hello`, negotiate the heartbeat interval
//! - **Session**: identify when no session is persisted, resume otherwise
//! - **Liveness**: heartbeat on a timer, watchdog on missing ACKs
//! - **Persistence**: the dispatch sequence number and session id go to a
//!   pluggable [`SessionStore`] so a restart resumes where it left off
//! - **Reconnects**: close codes are classified, and only the known-terminal
//!   set ends the shard
//!
//! Outbound frames are bounded by a `(120, 60s)` send limiter; identifies
//! additionally pass a shared identify limiter so a fleet of shards stays
//! inside its identify bucket.
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard::{Identify, MemoryStore, Shard, ShardConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ShardConfig::builder(Identify::new(token, [0, 1]), MemoryStore::new())
//!     .gateway_url("wss://gateway.example.com")
//!     .build()?;
//!
//! let shard = Shard::new(config);
//! shard.open(CancellationToken::new()).await?;
//! ```
//!
//! Metrics are published through the process-wide [`metrics`] facade; logs
//! go through [`tracing`].

mod compression;
mod config;
mod connection;
mod error;
mod limiter;
pub mod metrics;
mod packet;
mod session;
mod shard;

pub use compression::Compression;
pub use config::{ConfigError, PacketCallback, ShardConfig, ShardConfigBuilder};
pub use connection::Connection;
pub use error::Error;
pub use limiter::RateLimiter;
pub use packet::{
    close_code, ConnectionProperties, Hello, Identify, OpCode, Ready, ReceivePacket, Resume,
    Resumed, SendPacket, EVENT_READY, EVENT_RESUMED,
};
pub use session::{BoxError, MemoryStore, SessionStore};
pub use shard::Shard;

/// Result type for gateway-shard operations.
pub type Result<T> = std::result::Result<T, Error>;
