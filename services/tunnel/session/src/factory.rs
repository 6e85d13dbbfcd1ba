//! Session creation.
//!
//! [`SessionFactory`] dials the transport, applies tuning, layers compression
//! and starts the multiplexer. [`SessionSource::wait_until_ready`] is the only
//! retry policy in the client: a fixed one-second pause between attempts and
//! no attempt limit.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use tunnel_wire::CompressionStream;

use crate::error::SessionError;
use crate::mux::{MuxConfig, SharedSession, YamuxSession};
use crate::transport::{FecConfig, NoDelayConfig, TransportConn, TransportDialer};

/// Delay between session creation attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Tuning parameters applied to every new session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Remote transport address
    pub remote_addr: String,
    /// Erasure-coding shard counts
    pub fec: FecConfig,
    /// Retransmission and congestion parameters
    pub no_delay: NoDelayConfig,
    /// Send window in packets
    pub send_window: u32,
    /// Receive window in packets
    pub recv_window: u32,
    /// Maximum transmission unit
    pub mtu: u32,
    /// Flush acks immediately
    pub ack_no_delay: bool,
    /// Transport keep-alive interval
    pub keep_alive: Duration,
    /// DSCP code point (6 bits)
    pub dscp: u8,
    /// Socket buffer size in bytes, also bounds the multiplexer window
    pub sock_buf: usize,
    /// Whether to compress the transport byte stream
    pub compression: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            remote_addr: "vps:29900".to_string(),
            fec: FecConfig {
                data_shards: 10,
                parity_shards: 3,
            },
            no_delay: NoDelayConfig::new(0, 20, 2, 1),
            send_window: 128,
            recv_window: 512,
            mtu: 1350,
            ack_no_delay: false,
            keep_alive: Duration::from_secs(10),
            dscp: 0,
            sock_buf: 4 * 1024 * 1024, // 4 MiB
            compression: true,
        }
    }
}

/// Anything that can produce multiplexed sessions
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Create one session, failing on the first error
    async fn create(&self) -> Result<SharedSession, SessionError>;

    /// Create a session, retrying every [`RETRY_DELAY`] until one succeeds
    async fn wait_until_ready(&self) -> SharedSession {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.create().await {
                Ok(session) => return session,
                Err(e) => {
                    warn!(
                        "Session creation attempt {} failed: {}, retrying in {:?}",
                        attempt, e, RETRY_DELAY
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

/// Builds sessions over a transport dialer
pub struct SessionFactory<D> {
    dialer: D,
    config: SessionConfig,
    mux: MuxConfig,
}

impl<D: TransportDialer> SessionFactory<D> {
    /// Create a factory for `config` using `dialer`
    pub fn new(dialer: D, config: SessionConfig) -> Self {
        let mux = MuxConfig::from_sock_buf(config.sock_buf);
        Self { dialer, config, mux }
    }

    /// Tuning parameters in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Apply tuning to a freshly dialed connection.
    ///
    /// DSCP and buffer sizing only affect performance, so their failures are
    /// logged and skipped.
    fn tune(&self, conn: &mut dyn TransportConn) {
        let cfg = &self.config;
        conn.set_stream_mode(true);
        conn.set_no_delay(cfg.no_delay);
        conn.set_window_size(cfg.send_window, cfg.recv_window);
        if !conn.set_mtu(cfg.mtu) {
            warn!("SetMtu: {} rejected by transport", cfg.mtu);
        }
        conn.set_ack_no_delay(cfg.ack_no_delay);
        conn.set_keep_alive(cfg.keep_alive);

        if let Err(e) = conn.set_dscp(cfg.dscp) {
            warn!("SetDSCP: {}", e);
        }
        if let Err(e) = conn.set_read_buffer(cfg.sock_buf) {
            warn!("SetReadBuffer: {}", e);
        }
        if let Err(e) = conn.set_write_buffer(cfg.sock_buf) {
            warn!("SetWriteBuffer: {}", e);
        }
    }
}

#[async_trait]
impl<D: TransportDialer> SessionSource for SessionFactory<D> {
    async fn create(&self) -> Result<SharedSession, SessionError> {
        let mut conn = self
            .dialer
            .dial(&self.config.remote_addr, self.config.fec)
            .await
            .map_err(SessionError::Dial)?;

        self.tune(conn.as_mut());

        let session = if self.config.compression {
            YamuxSession::client(CompressionStream::new(conn), &self.mux)
        } else {
            YamuxSession::client(conn, &self.mux)
        };
        debug!(
            "Created session {} to {} (compression: {})",
            session.id(),
            self.config.remote_addr,
            self.config.compression
        );

        Ok(Arc::new(session))
    }
}
