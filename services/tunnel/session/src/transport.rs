//! Transport connections and dialers.
//!
//! The reliable transport is an external collaborator. This module defines the
//! seam the rest of the client talks to ([`TransportDialer`] producing tunable
//! [`TransportConn`]s) and ships a plain TCP implementation of it.

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::protect::{NoopProtector, SocketProtector};

/// Any bidirectional byte stream that can move between tasks
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Retransmission and congestion parameters of the transport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoDelayConfig {
    /// Immediate-ack / no-delay flag (0 or 1)
    pub nodelay: u32,
    /// Internal update interval in milliseconds
    pub interval: u32,
    /// Fast retransmission trigger count (0 disables)
    pub resend: u32,
    /// Congestion window disable flag (1 disables)
    pub no_congestion: u32,
}

impl NoDelayConfig {
    /// Build from the four tuning integers
    pub fn new(nodelay: u32, interval: u32, resend: u32, no_congestion: u32) -> Self {
        Self {
            nodelay,
            interval,
            resend,
            no_congestion,
        }
    }
}

/// Erasure-coding shard counts passed to the dialer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FecConfig {
    /// Data shards per group
    pub data_shards: u32,
    /// Parity shards per group
    pub parity_shards: u32,
}

/// A dialed transport connection with its tuning knobs
pub trait TransportConn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Enable stream framing mode
    fn set_stream_mode(&mut self, enabled: bool);
    /// Set retransmission and congestion parameters
    fn set_no_delay(&mut self, params: NoDelayConfig);
    /// Set send and receive window sizes, in packets
    fn set_window_size(&mut self, send: u32, recv: u32);
    /// Set the maximum transmission unit; returns false if rejected
    fn set_mtu(&mut self, mtu: u32) -> bool;
    /// Flush acknowledgements immediately on receive
    fn set_ack_no_delay(&mut self, enabled: bool);
    /// Set the keep-alive interval; zero disables keep-alive
    fn set_keep_alive(&mut self, interval: Duration);
    /// Mark outgoing packets with a DSCP code point
    fn set_dscp(&mut self, dscp: u8) -> io::Result<()>;
    /// Set the OS receive buffer size
    fn set_read_buffer(&mut self, bytes: usize) -> io::Result<()>;
    /// Set the OS send buffer size
    fn set_write_buffer(&mut self, bytes: usize) -> io::Result<()>;
}

/// Dials the remote end of the tunnel
#[async_trait]
pub trait TransportDialer: Send + Sync {
    /// Open a new transport connection to `remote`
    async fn dial(&self, remote: &str, fec: FecConfig) -> io::Result<Box<dyn TransportConn>>;
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Parameters the TCP transport accepts but has no socket option for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArqParams {
    /// Stream framing mode
    pub stream_mode: bool,
    /// Retransmission parameters
    pub no_delay: NoDelayConfig,
    /// Send and receive windows
    pub window: (u32, u32),
    /// Maximum transmission unit
    pub mtu: u32,
}

/// TCP-backed transport connection
#[derive(Debug)]
pub struct TcpConn {
    stream: TcpStream,
    arq: ArqParams,
}

impl TcpConn {
    /// Wrap a connected TCP stream
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            arq: ArqParams::default(),
        }
    }

    /// Parameters recorded without a TCP equivalent
    pub fn arq_params(&self) -> &ArqParams {
        &self.arq
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl TransportConn for TcpConn {
    fn set_stream_mode(&mut self, enabled: bool) {
        self.arq.stream_mode = enabled;
    }

    fn set_no_delay(&mut self, params: NoDelayConfig) {
        self.arq.no_delay = params;
    }

    fn set_window_size(&mut self, send: u32, recv: u32) {
        self.arq.window = (send, recv);
    }

    fn set_mtu(&mut self, mtu: u32) -> bool {
        self.arq.mtu = mtu;
        true
    }

    fn set_ack_no_delay(&mut self, enabled: bool) {
        if let Err(e) = self.stream.set_nodelay(enabled) {
            warn!("TCP_NODELAY: {}", e);
        }
    }

    fn set_keep_alive(&mut self, interval: Duration) {
        let sock = SockRef::from(&self.stream);
        let result = if interval.is_zero() {
            sock.set_keepalive(false)
        } else {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))
        };
        if let Err(e) = result {
            warn!("SO_KEEPALIVE: {}", e);
        }
    }

    fn set_dscp(&mut self, dscp: u8) -> io::Result<()> {
        match self.stream.peer_addr()? {
            SocketAddr::V4(_) => SockRef::from(&self.stream).set_tos(u32::from(dscp) << 2),
            SocketAddr::V6(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "DSCP marking is only applied to IPv4 transports",
            )),
        }
    }

    fn set_read_buffer(&mut self, bytes: usize) -> io::Result<()> {
        SockRef::from(&self.stream).set_recv_buffer_size(bytes)
    }

    fn set_write_buffer(&mut self, bytes: usize) -> io::Result<()> {
        SockRef::from(&self.stream).set_send_buffer_size(bytes)
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Dialer for the TCP transport
#[derive(Clone)]
pub struct TcpDialer {
    protector: Arc<dyn SocketProtector>,
}

impl TcpDialer {
    /// Create a dialer that leaves sockets unprotected
    pub fn new() -> Self {
        Self::with_protector(Arc::new(NoopProtector))
    }

    /// Create a dialer that runs `protector` on every socket before connecting
    pub fn with_protector(protector: Arc<dyn SocketProtector>) -> Self {
        Self { protector }
    }

    async fn protect(&self, socket: &TcpSocket) {
        #[cfg(unix)]
        let raw = std::os::fd::AsRawFd::as_raw_fd(socket);
        #[cfg(windows)]
        let raw = std::os::windows::io::AsRawSocket::as_raw_socket(socket);

        // The hand-off blocks on a local socket for up to its timeouts
        let protector = self.protector.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || protector.protect(raw)).await {
            warn!("Socket protection task failed: {}", e);
        }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportDialer for TcpDialer {
    async fn dial(&self, remote: &str, fec: FecConfig) -> io::Result<Box<dyn TransportConn>> {
        let addr = lookup_host(remote).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", remote),
            )
        })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.protect(&socket).await;

        let stream = socket.connect(addr).await?;
        debug!(
            "Dialed {} ({} data / {} parity shards not used by TCP)",
            addr, fec.data_shards, fec.parity_shards
        );
        Ok(Box::new(TcpConn::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::RawSocket;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Records every handle it is asked to protect
    #[derive(Default)]
    struct RecordingProtector {
        seen: Mutex<Vec<RawSocket>>,
    }

    impl SocketProtector for RecordingProtector {
        fn protect(&self, fd: RawSocket) {
            self.seen.lock().unwrap().push(fd);
        }
    }

    #[tokio::test]
    async fn test_tcp_dial_and_tune() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = TcpDialer::new();
        let mut conn = dialer
            .dial(&bound_addr.to_string(), FecConfig::default())
            .await
            .unwrap();

        conn.set_stream_mode(true);
        conn.set_no_delay(NoDelayConfig::new(0, 20, 2, 1));
        conn.set_window_size(128, 512);
        assert!(conn.set_mtu(1350));
        conn.set_ack_no_delay(true);
        conn.set_keep_alive(Duration::from_secs(10));
        conn.set_dscp(46).unwrap();
        conn.set_read_buffer(64 * 1024).unwrap();
        conn.set_write_buffer(64 * 1024).unwrap();

        conn.write_all(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_tcp_conn_records_arq_params() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(bound_addr).await.unwrap();
        let mut conn = TcpConn::new(stream);
        conn.set_stream_mode(true);
        conn.set_no_delay(NoDelayConfig::new(1, 10, 2, 1));
        conn.set_window_size(64, 256);
        conn.set_mtu(1200);

        let arq = conn.arq_params();
        assert!(arq.stream_mode);
        assert_eq!(arq.no_delay, NoDelayConfig::new(1, 10, 2, 1));
        assert_eq!(arq.window, (64, 256));
        assert_eq!(arq.mtu, 1200);
        assert!(conn.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = listen_tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpDialer::new().dial(&addr.to_string(), FecConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_protector_runs_once_per_dial() {
        let listener = listen_tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut peers = Vec::new();
            for _ in 0..3 {
                peers.push(listener.accept().await.unwrap().0);
            }
            peers
        });

        let protector = Arc::new(RecordingProtector::default());
        let dialer = TcpDialer::with_protector(protector.clone());
        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(dialer.dial(&addr.to_string(), FecConfig::default()).await.unwrap());
        }

        assert_eq!(accept.await.unwrap().len(), 3);
        let seen = protector.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let mut distinct = seen.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
    }
}
