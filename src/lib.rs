//! # blaze-client
//!
//! Async client for the Blaze binary RPC protocol spoken by game backends.
//!
//! The client keeps one TLS connection to the server, multiplexes
//! concurrent requests over it by correlation id, sends heartbeats while
//! idle and reconnects with exponential backoff when the link drops.
//! On top of that sit a per-account pool of authenticated connections, a
//! two-tier TTL cache for secondary player data, and a batch orchestrator
//! that assembles enriched player lists.
//!
//! ## Architecture
//!
//! - **Wire** ([`protocol`], [`codec`]): 16-byte header + MessagePack body
//! - **Link** ([`transport`], [`writer`], [`connection`]): TLS stream, one
//!   writer task, one reader task, one keepalive task per connection
//! - **Reuse** ([`pool`], [`cache`]): authenticated connections per account,
//!   TTL caches with background purge
//! - **Queries** ([`query`]): primary request plus cached, bounded-concurrency
//!   secondary lookups
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use blaze_client::{CacheTier, ConnectionPool, Orchestrator, PlayerListOptions, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), accounts()));
//!     let caches = Arc::new(CacheTier::default());
//!     caches.init();
//!
//!     let orchestrator = Orchestrator::new(ACCOUNT, pool.clone(), caches.clone(), stats());
//!     let list = orchestrator
//!         .player_list(&[7_219_438_201], PlayerListOptions::default().with_groups())
//!         .await;
//!     println!("{list:?}");
//!
//!     pool.close_all().await;
//!     caches.shutdown().await;
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod connection;
pub mod control;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod query;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod testing;

pub use cache::{CacheConfig, CacheStats, CacheTier, TtlCache};
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, ConnectionStatus, ReconnectPolicy,
};
pub use control::Session;
pub use error::{BlazeError, Result};
pub use pool::{ConnectionPool, PoolConfig};
pub use protocol::{Packet, PacketKind};
pub use provider::{AccountProvider, BoxFuture, StatsProvider};
pub use query::{
    GameRoster, Orchestrator, PlayerEntry, PlayerList, PlayerListOptions, QueryConfig,
    QueryFailure,
};
pub use transport::{Connector, TlsConnector};
