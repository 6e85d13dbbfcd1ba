//! Length-prefixed compressed frames.
//!
//! One frame carries one compressed chunk of at most [`MAX_CHUNK_SIZE`]
//! plaintext bytes.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest plaintext chunk placed in a single frame (64 KiB)
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Hard limit on the compressed body of a frame
pub const HARD_MAX_FRAME_SIZE: usize = 2 * MAX_CHUNK_SIZE;

/// Size of the length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default zstd level; low levels keep per-write latency small
pub const DEFAULT_LEVEL: i32 = 1;

/// Compress `payload` and append it to `out` as one frame.
pub fn encode_frame(payload: &[u8], level: i32, out: &mut BytesMut) -> Result<(), WireError> {
    if payload.len() > MAX_CHUNK_SIZE {
        return Err(WireError::Size(payload.len()));
    }

    let compressed = zstd::bulk::compress(payload, level).map_err(WireError::Compress)?;
    if compressed.len() > HARD_MAX_FRAME_SIZE {
        return Err(WireError::Size(compressed.len()));
    }

    out.reserve(FRAME_HEADER_SIZE + compressed.len());
    out.put_u32(compressed.len() as u32);
    out.put_slice(&compressed);
    Ok(())
}

/// Frame decoder for parsing incoming compressed frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: HARD_MAX_FRAME_SIZE,
        }
    }

    /// Decode one frame from `buf`, returning the decompressed chunk.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }

        if buf.len() < FRAME_HEADER_SIZE + frame_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(frame_len);

        let chunk = zstd::bulk::decompress(&body, MAX_CHUNK_SIZE).map_err(WireError::Decompress)?;
        Ok(Some(Bytes::from(chunk)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut encoded = BytesMut::new();
        encode_frame(b"hello tunnel", DEFAULT_LEVEL, &mut encoded).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), encoded.len() - 1);

        partial.extend_from_slice(&encoded[encoded.len() - 1..]);
        let chunk = decoder.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello tunnel");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut encoded = BytesMut::new();
        encode_frame(b"first", DEFAULT_LEVEL, &mut encoded).unwrap();
        encode_frame(b"second", DEFAULT_LEVEL, &mut encoded).unwrap();

        let mut decoder = FrameDecoder::new();
        assert_eq!(&decoder.decode(&mut encoded).unwrap().unwrap()[..], b"first");
        assert_eq!(&decoder.decode(&mut encoded).unwrap().unwrap()[..], b"second");
        assert!(decoder.decode(&mut encoded).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((HARD_MAX_FRAME_SIZE + 1) as u32);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(_))));
    }

    #[test]
    fn test_garbage_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(&[1, 2, 3, 4, 5]);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Decompress(_))));
    }

    #[test]
    fn test_chunk_larger_than_limit_rejected() {
        let payload = vec![0u8; MAX_CHUNK_SIZE + 1];
        let mut out = BytesMut::new();
        assert!(matches!(
            encode_frame(&payload, DEFAULT_LEVEL, &mut out),
            Err(WireError::Size(_))
        ));
        assert!(out.is_empty());
    }
}
