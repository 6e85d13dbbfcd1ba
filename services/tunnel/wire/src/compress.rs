//! Compressing stream decorator.
//!
//! [`CompressionStream`] presents the same `AsyncRead + AsyncWrite` contract as
//! the connection it wraps. Each `poll_write` call turns the accepted bytes into
//! one frame and pushes it to the underlying connection right away, so nothing
//! is buffered across calls waiting for more data.
//!
//! If the underlying connection is not ready, the write still reports the
//! bytes as accepted and the frame stays queued. The queue is drained before
//! the next write, flush or shutdown makes progress, so a caller that needs
//! the data on the wire must `flush`.

use crate::frame::{encode_frame, FrameDecoder, DEFAULT_LEVEL, MAX_CHUNK_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Scratch size for reads from the underlying connection
const READ_CHUNK: usize = 16 * 1024;

/// Byte stream that compresses writes and decompresses reads
#[derive(Debug)]
pub struct CompressionStream<S> {
    inner: S,
    level: i32,
    decoder: FrameDecoder,
    /// Raw bytes read from `inner` not yet decoded
    read_buf: BytesMut,
    /// Decompressed bytes not yet handed to the caller
    decoded: Bytes,
    scratch: Box<[u8]>,
    read_eof: bool,
    /// Encoded frames not yet written to `inner`
    write_buf: BytesMut,
}

impl<S> CompressionStream<S> {
    /// Wrap a connection with the default compression level
    pub fn new(inner: S) -> Self {
        Self::with_level(inner, DEFAULT_LEVEL)
    }

    /// Wrap a connection with an explicit zstd level
    pub fn with_level(inner: S, level: i32) -> Self {
        Self {
            inner,
            level,
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            decoded: Bytes::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            read_eof: false,
            write_buf: BytesMut::new(),
        }
    }

    /// Get a reference to the underlying connection
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap the underlying connection, dropping any queued frames
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> CompressionStream<S> {
    /// Push every encoded frame into the underlying connection
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CompressionStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.decoded.is_empty() {
                let n = buf.remaining().min(this.decoded.len());
                buf.put_slice(&this.decoded[..n]);
                this.decoded.advance(n);
                return Poll::Ready(Ok(()));
            }

            // Empty chunks are skipped so they never read as EOF
            if let Some(chunk) = this.decoder.decode(&mut this.read_buf)? {
                this.decoded = chunk;
                continue;
            }

            if this.read_eof {
                if this.read_buf.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(crate::WireError::Truncated.into()));
            }

            let mut scratch = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch))?;
            let filled = scratch.filled();
            if filled.is_empty() {
                this.read_eof = true;
            } else {
                this.read_buf.extend_from_slice(filled);
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CompressionStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Frames from the previous call go out before new data is accepted
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_CHUNK_SIZE);
        encode_frame(&buf[..n], this.level, &mut this.write_buf)?;

        // Flush right away. A pending write keeps the frame queued and the
        // registered waker drives it on the next call.
        if let Poll::Ready(result) = this.poll_drain(cx) {
            result?;
            if let Poll::Ready(Err(e)) = Pin::new(&mut this.inner).poll_flush(cx) {
                return Poll::Ready(Err(e));
            }
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn roundtrip(payload: Vec<u8>) -> Vec<u8> {
        let (a, b) = duplex(8 * 1024);
        let mut writer = CompressionStream::new(a);
        let mut reader = CompressionStream::new(b);

        let expected = payload.clone();
        let write_task = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        write_task.await.unwrap();

        assert_eq!(received.len(), expected.len());
        received
    }

    #[tokio::test]
    async fn test_roundtrip_empty() {
        assert!(roundtrip(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_roundtrip_single_byte() {
        assert_eq!(roundtrip(vec![0x7f]).await, vec![0x7f]);
    }

    #[tokio::test]
    async fn test_roundtrip_larger_than_chunk() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
        assert_eq!(roundtrip(payload.clone()).await, payload);
    }

    #[tokio::test]
    async fn test_each_write_reaches_peer_without_flush() {
        let (a, b) = duplex(64 * 1024);
        let mut writer = CompressionStream::new(a);
        let mut reader = CompressionStream::new(b);

        writer.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_compressible_data_shrinks_on_wire() {
        let (a, mut raw) = duplex(256 * 1024);
        let mut writer = CompressionStream::new(a);

        writer.write_all(&vec![0u8; MAX_CHUNK_SIZE]).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert!(!wire.is_empty());
        assert!(wire.len() < MAX_CHUNK_SIZE / 10);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_invalid_data() {
        let (mut raw, b) = duplex(1024);
        let mut reader = CompressionStream::new(b);

        raw.write_all(&[0, 0, 0, 5, 1, 2, 3, 4, 5]).await.unwrap();
        drop(raw);

        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let (mut raw, b) = duplex(1024);
        let mut reader = CompressionStream::new(b);

        raw.write_all(&[0, 0, 0, 9, 1, 2]).await.unwrap();
        drop(raw);

        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    /// Writer that accepts nothing while `stalled` is set
    struct StallingWriter {
        written: Vec<u8>,
        stalled: Arc<AtomicBool>,
    }

    impl AsyncWrite for StallingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.stalled.load(Ordering::SeqCst) {
                return Poll::Pending;
            }
            self.get_mut().written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_stalled_write_stays_queued_until_flush() {
        let stalled = Arc::new(AtomicBool::new(true));
        let mut stream = CompressionStream::new(StallingWriter {
            written: Vec::new(),
            stalled: stalled.clone(),
        });

        let n = std::future::poll_fn(|cx| Pin::new(&mut stream).poll_write(cx, b"hello"))
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert!(stream.get_ref().written.is_empty());

        stalled.store(false, Ordering::SeqCst);
        stream.flush().await.unwrap();

        let mut wire = BytesMut::from(&stream.into_inner().written[..]);
        let frame = FrameDecoder::new().decode(&mut wire).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(wire.is_empty());
    }
}
