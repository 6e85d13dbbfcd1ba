//! Multiplexed sessions.
//!
//! [`TransportSession`] is the capability the pool and relay depend on: open a
//! logical stream, report how many are open, report liveness, close. The
//! multiplexing protocol itself is yamux, driven by a background task per
//! session.

use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_yamux::{Config as YamuxConfig, Control, Session as YamuxDriver};
use tracing::debug;

use crate::error::SessionError;
use crate::transport::AsyncStream;

/// A logical stream opened on a session
pub type BoxedStream = Box<dyn AsyncStream>;

/// Session handle shared between the pool, relays and the scavenger
pub type SharedSession = Arc<dyn TransportSession>;

/// A multiplexed session over one transport connection
#[async_trait]
pub trait TransportSession: Send + Sync + fmt::Debug {
    /// Open a new logical stream
    async fn open_stream(&self) -> Result<BoxedStream, SessionError>;
    /// Whether the session has terminated
    fn is_closed(&self) -> bool;
    /// Number of logical streams currently open
    fn num_streams(&self) -> usize;
    /// Close the session and every stream on it
    async fn close(&self);
}

/// Smallest per-stream window yamux accepts (256 KiB)
const MIN_STREAM_WINDOW: u32 = 256 * 1024;

/// Multiplexer configuration
#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Upper bound on a stream's receive window in bytes
    pub max_stream_window: u32,
}

impl MuxConfig {
    /// Bound the receive window by the socket buffer size
    pub fn from_sock_buf(sock_buf: usize) -> Self {
        let window = u32::try_from(sock_buf).unwrap_or(u32::MAX);
        Self {
            max_stream_window: window.max(MIN_STREAM_WINDOW),
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_sock_buf(4 * 1024 * 1024)
    }
}

/// Liveness and stream count shared with the driver task and open streams
#[derive(Debug, Default)]
struct SessionState {
    streams: AtomicUsize,
    closed: AtomicBool,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Client side of a yamux session
pub struct YamuxSession {
    id: u64,
    control: Control,
    state: Arc<SessionState>,
}

impl YamuxSession {
    /// Start a client session over `io` and spawn its driver task
    pub fn client<T>(io: T, config: &MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let yamux_config = YamuxConfig {
            max_stream_window_size: config.max_stream_window,
            ..YamuxConfig::default()
        };

        let driver = YamuxDriver::new_client(io, yamux_config);
        let control = driver.control();
        let state = Arc::new(SessionState::default());

        let driver_state = state.clone();
        tokio::spawn(async move {
            futures::pin_mut!(driver);
            while let Some(inbound) = driver.next().await {
                match inbound {
                    // The remote end never opens streams toward the client
                    Ok(stream) => drop(stream),
                    Err(e) => {
                        debug!("Session {} driver stopped: {:?}", id, e);
                        break;
                    }
                }
            }
            driver_state.closed.store(true, Ordering::SeqCst);
            debug!("Session {} terminated", id);
        });

        Self { id, control, state }
    }

    /// Identifier used in logs
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for YamuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YamuxSession")
            .field("id", &self.id)
            .field("streams", &self.state.streams.load(Ordering::Relaxed))
            .field("closed", &self.state.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> Result<BoxedStream, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let mut control = self.control.clone();
        let handle = control
            .open_stream()
            .await
            .map_err(|e| SessionError::OpenStream(format!("{:?}", e)))?;

        Ok(Box::new(CountedStream::new(handle, self.state.clone())))
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn num_streams(&self) -> usize {
        self.state.streams.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let mut control = self.control.clone();
        control.close().await;
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Stream wrapper that keeps its session's open-stream count current
pub struct CountedStream<S> {
    inner: S,
    state: Arc<SessionState>,
}

impl<S> CountedStream<S> {
    fn new(inner: S, state: Arc<SessionState>) -> Self {
        state.streams.fetch_add(1, Ordering::SeqCst);
        Self { inner, state }
    }
}

impl<S> Drop for CountedStream<S> {
    fn drop(&mut self) {
        self.state.streams.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
