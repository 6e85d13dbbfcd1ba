//! Wire framing error types.

use std::io;
use thiserror::Error;

/// Compression framing errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Compressor rejected the chunk
    #[error("compress failed: {0}")]
    Compress(#[source] io::Error),

    /// Frame body is not a valid compressed chunk
    #[error("decompress failed: {0}")]
    Decompress(#[source] io::Error),

    /// Connection ended in the middle of a frame
    #[error("truncated frame")]
    Truncated,
}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Truncated => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
