//! In-memory sessions and sources for unit tests.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tunnel_session::{BoxedStream, SessionError, SessionSource, SharedSession, TransportSession};

/// Session whose liveness and stream count are set by the test
pub(crate) struct MockSession {
    id: usize,
    closed: AtomicBool,
    streams: AtomicUsize,
    close_calls: AtomicUsize,
    fail_open: AtomicBool,
    peers: Option<mpsc::UnboundedSender<DuplexStream>>,
}

impl MockSession {
    pub(crate) fn new(id: usize) -> Arc<Self> {
        Arc::new(Self::build(id, None))
    }

    /// Session whose opened streams hand their remote end to the receiver
    pub(crate) fn with_peers(id: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::build(id, Some(tx))), rx)
    }

    fn build(id: usize, peers: Option<mpsc::UnboundedSender<DuplexStream>>) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            streams: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            peers,
        }
    }

    pub(crate) fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub(crate) fn set_streams(&self, streams: usize) {
        self.streams.store(streams, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockSession({})", self.id)
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn open_stream(&self) -> Result<BoxedStream, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SessionError::OpenStream("refused".to_string()));
        }
        let (local, remote) = duplex(64 * 1024);
        if let Some(peers) = &self.peers {
            let _ = peers.send(remote);
        }
        Ok(Box::new(local))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn num_streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Source that numbers its sessions from 1 and can fail one attempt
#[derive(Default)]
pub(crate) struct MockSource {
    attempts: AtomicUsize,
    fail_at: Option<usize>,
    created: Mutex<Vec<Arc<MockSession>>>,
}

impl MockSource {
    /// Fail the zero-based attempt `attempt`, succeed on every other one
    pub(crate) fn failing_at(attempt: usize) -> Self {
        Self {
            fail_at: Some(attempt),
            ..Self::default()
        }
    }

    pub(crate) fn created(&self) -> Vec<Arc<MockSession>> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionSource for MockSource {
    async fn create(&self) -> Result<SharedSession, SessionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(attempt) {
            return Err(SessionError::Dial(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }

        let mut created = self.created.lock().unwrap();
        let session = MockSession::new(created.len() + 1);
        created.push(session.clone());
        Ok(session)
    }
}
