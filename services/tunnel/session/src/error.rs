//! Session error types.

use std::io;
use thiserror::Error;

/// Errors raised while creating or using a multiplexed session
#[derive(Error, Debug)]
pub enum SessionError {
    /// The transport could not be dialed
    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),

    /// A logical stream could not be opened
    #[error("open stream failed: {0}")]
    OpenStream(String),

    /// The session is already closed
    #[error("session closed")]
    Closed,
}
