//! Session pool with round-robin dispatch and rotation, retired-session scavenger, and stream relay.
//!
//! The accept loop owns a [`SessionPool`] and a [`Dispatcher`]; each accepted
//! connection is assigned a slot, the slot's session is validated (rotating it
//! if closed or expired), and a [`relay`] task carries the bytes. Displaced
//! sessions travel to the [`Scavenger`], which closes them once no stream is
//! using them any more.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tunnel_pool::{relay, Dispatcher, PoolConfig, SessionPool, Stats, scavenger_channel};
//! use tunnel_session::{SessionConfig, SessionFactory, TcpDialer};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let stats = Arc::new(Stats::default());
//! let factory = SessionFactory::new(TcpDialer::new(), SessionConfig::default());
//! let (retire_tx, scavenger) = scavenger_channel(stats.clone());
//! tokio::spawn(scavenger.run());
//!
//! let mut pool = SessionPool::initialize(factory, PoolConfig::default(), retire_tx, stats.clone()).await?;
//! let mut dispatcher = Dispatcher::new(pool.len());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:12948").await?;
//! loop {
//!     let (conn, _) = listener.accept().await?;
//!     let session = pool.acquire(dispatcher.next_slot()).await;
//!     tokio::spawn(relay(conn, session, stats.clone()));
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod pool;
pub mod relay;
pub mod scavenger;
pub mod stats;

#[cfg(test)]
mod testing;

// Re-export main types
pub use error::PoolError;
pub use pool::{Dispatcher, PoolConfig, PoolSlot, SessionPool};
pub use relay::{relay, Direction, RelayOutcome};
pub use scavenger::{
    scavenger_channel, RetireSender, RetiredSession, Scavenger, MAX_SCAVENGE_AGE,
    RETIRE_QUEUE_CAPACITY, SCAVENGE_PERIOD,
};
pub use stats::{Stats, StatsSnapshot};
