//! Compression framing and the compressing stream decorator for tunnel connections.
//!
//! This crate sits between a raw transport connection and the stream
//! multiplexer. Every write is compressed into one self-delimiting frame and
//! pushed to the transport immediately; reads decode frames lazily.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | zstd frame           | compressed chunk (<=64KiB) |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compress;
pub mod error;
pub mod frame;

// Re-export main types
pub use compress::CompressionStream;
pub use error::WireError;
pub use frame::{
    encode_frame, FrameDecoder, DEFAULT_LEVEL, FRAME_HEADER_SIZE, HARD_MAX_FRAME_SIZE,
    MAX_CHUNK_SIZE,
};
