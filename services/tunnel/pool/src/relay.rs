//! Relay between an accepted local connection and one logical stream.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use tunnel_session::SharedSession;

use crate::stats::Stats;

/// Copy buffer per direction
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Direction of a copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Local connection into the stream
    LocalToRemote,
    /// Stream into the local connection
    RemoteToLocal,
}

/// How a relay ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// No stream could be opened; the local connection was closed
    OpenFailed,
    /// Both ends were closed after `first` finished
    Finished {
        /// Direction that ended first
        first: Direction,
        /// Bytes copied local to remote
        sent: u64,
        /// Bytes copied remote to local
        received: u64,
    },
}

/// Carry `local` over a new stream on `session` until either side ends.
///
/// The session handle is held until the relay returns so the session stays
/// alive while in use, even after the pool has rotated it out.
pub async fn relay<L>(local: L, session: SharedSession, stats: Arc<Stats>) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
{
    let stream = match session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            stats.record_stream_failure();
            warn!("Failed to open stream on {:?}: {}", session, e);
            return RelayOutcome::OpenFailed;
        }
    };
    stats.relay_started();
    debug!("Stream opened on {:?} ({} open)", session, session.num_streams());

    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(stream);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let first = tokio::select! {
        result = pump(&mut local_rd, &mut remote_wr, &sent) => {
            log_end(Direction::LocalToRemote, result);
            Direction::LocalToRemote
        }
        result = pump(&mut remote_rd, &mut local_wr, &received) => {
            log_end(Direction::RemoteToLocal, result);
            Direction::RemoteToLocal
        }
    };

    // Dropping both halves of each side closes it
    drop((local_rd, local_wr, remote_rd, remote_wr));

    let sent = sent.load(Ordering::Relaxed);
    let received = received.load(Ordering::Relaxed);
    stats.relay_finished(sent, received);
    debug!(
        "Stream closed on {:?}: {:?} ended first, {} bytes out, {} bytes in",
        session, first, sent, received
    );

    RelayOutcome::Finished {
        first,
        sent,
        received,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn log_end(direction: Direction, result: io::Result<()>) {
    match result {
        Ok(()) => debug!("{:?} reached EOF", direction),
        Err(e) => debug!("{:?} failed: {}", direction, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSession;
    use tokio::io::duplex;
    use tunnel_session::TransportSession;

    #[tokio::test]
    async fn test_relay_both_directions_local_closes() {
        let stats = Arc::new(Stats::default());
        let (session, mut peers) = MockSession::with_peers(1);
        let (mut client, relay_side) = duplex(64 * 1024);

        let handle = tokio::spawn(relay(relay_side, session.clone(), stats.clone()));
        let mut remote = peers.recv().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome,
            RelayOutcome::Finished {
                first: Direction::LocalToRemote,
                sent: 4,
                received: 5,
            }
        );

        // The stream was closed along with the local side
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.streams_opened, 1);
        assert_eq!(snapshot.active_relays, 0);
        assert_eq!(snapshot.bytes_sent, 4);
        assert_eq!(snapshot.bytes_received, 5);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_relay_remote_close_closes_local() {
        let stats = Arc::new(Stats::default());
        let (session, mut peers) = MockSession::with_peers(1);
        let (mut client, relay_side) = duplex(64 * 1024);

        let handle = tokio::spawn(relay(relay_side, session, stats));
        let remote = peers.recv().await.unwrap();
        drop(remote);

        let outcome = handle.await.unwrap();
        assert!(matches!(
            outcome,
            RelayOutcome::Finished {
                first: Direction::RemoteToLocal,
                ..
            }
        ));

        // The local side sees EOF although it never closed its own half
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_open_failure_closes_local() {
        let stats = Arc::new(Stats::default());
        let session = MockSession::new(1);
        session.set_fail_open(true);
        let (mut client, relay_side) = duplex(1024);

        let outcome = relay(relay_side, session.clone(), stats.clone()).await;
        assert_eq!(outcome, RelayOutcome::OpenFailed);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(stats.snapshot().stream_failures, 1);
        assert_eq!(session.close_calls(), 0);
    }
}
