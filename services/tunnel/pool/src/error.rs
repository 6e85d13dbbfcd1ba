//! Pool error types.

use thiserror::Error;
use tunnel_session::SessionError;

/// Errors raised while building the session pool
#[derive(Error, Debug)]
pub enum PoolError {
    /// A pool needs at least one slot
    #[error("connection count must be at least 1")]
    NoSlots,

    /// A slot could not get its first session
    #[error("slot {slot}: initial session failed: {source}")]
    InitialSession {
        /// Slot index
        slot: usize,
        /// Underlying failure
        #[source]
        source: SessionError,
    },
}
