//! Tunnel client binary.
//!
//! Accepts local TCP connections and forwards each one over a pool of
//! multiplexed sessions to the remote tunnel endpoint.

use anyhow::Context;
use clap::Parser;
use socket2::SockRef;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tunnel_pool::{relay, scavenger_channel, Dispatcher, SessionPool, Stats};
use tunnel_session::{listen_tcp, SessionFactory, TcpDialer};
#[cfg(unix)]
use tunnel_session::{SocketProtector, UnixSocketProtector};

#[macro_use]
mod logging;
mod config;
mod stats;

use config::{plugin_options_from_env, ClientConfig};
use stats::StatsLogger;

/// Unix socket the VPN host listens on for fds to protect
#[cfg(unix)]
const PROTECT_PATH: &str = "protect_path";

/// Local TCP front end of the tunnel
#[derive(Parser, Debug)]
#[command(name = "tunnel-client", about = "Forward local TCP connections over multiplexed tunnel sessions")]
struct Args {
    /// Local listen address
    #[arg(short = 'l', long, default_value = ":12948")]
    localaddr: String,

    /// Remote tunnel address
    #[arg(short = 'r', long, default_value = "vps:29900")]
    remoteaddr: String,

    /// Profiles: normal, fast, fast2, fast3, manual
    #[arg(long, default_value = "fast")]
    mode: String,

    /// Number of sessions in the pool
    #[arg(long, default_value_t = 1)]
    conn: usize,

    /// Session lifetime in seconds, 0 disables
    #[arg(long, default_value_t = 60)]
    autoexpire: u64,

    /// Maximum transmission unit
    #[arg(long, default_value_t = 1350)]
    mtu: u32,

    /// Send window in packets
    #[arg(long, default_value_t = 128)]
    sndwnd: u32,

    /// Receive window in packets
    #[arg(long, default_value_t = 512)]
    rcvwnd: u32,

    /// Erasure-coding data shards
    #[arg(long, default_value_t = 10)]
    datashard: u32,

    /// Erasure-coding parity shards
    #[arg(long, default_value_t = 3)]
    parityshard: u32,

    /// DSCP code point (6 bits)
    #[arg(long, default_value_t = 0)]
    dscp: u32,

    /// Disable compression
    #[arg(long)]
    nocomp: bool,

    /// Flush acknowledgements immediately
    #[arg(long)]
    acknodelay: bool,

    #[arg(long, default_value_t = 0, hide = true)]
    nodelay: u32,

    #[arg(long, default_value_t = 40, hide = true)]
    interval: u32,

    #[arg(long, default_value_t = 0, hide = true)]
    resend: u32,

    #[arg(long, default_value_t = 0, hide = true)]
    nc: u32,

    /// Socket buffer size in bytes
    #[arg(long, default_value_t = 4194304)] // 4 MiB
    sockbuf: usize,

    /// Keep-alive interval in seconds
    #[arg(long, default_value_t = 10)]
    keepalive: u64,

    /// Stats CSV file, strftime escapes allowed, e.g. ./snmp-%Y%m%d.log
    #[arg(long, default_value = "")]
    snmplog: String,

    /// Stats collection period in seconds
    #[arg(long, default_value_t = 60)]
    snmpperiod: u64,

    /// Append logs to this file instead of stderr
    #[arg(long, default_value = "")]
    log: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON or YAML config file overriding the command line
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Accepted for compatibility, has no effect
    #[arg(long = "fast-open")]
    fast_open: bool,

    /// VPN mode: protect every transport socket through the host app
    #[arg(short = 'V', long = "vpn")]
    vpn: bool,
}

impl From<&Args> for ClientConfig {
    fn from(args: &Args) -> Self {
        Self {
            localaddr: args.localaddr.clone(),
            remoteaddr: args.remoteaddr.clone(),
            mode: args.mode.clone(),
            conn: args.conn,
            autoexpire: args.autoexpire,
            mtu: args.mtu,
            sndwnd: args.sndwnd,
            rcvwnd: args.rcvwnd,
            datashard: args.datashard,
            parityshard: args.parityshard,
            dscp: args.dscp,
            nocomp: args.nocomp,
            acknodelay: args.acknodelay,
            nodelay: args.nodelay,
            interval: args.interval,
            resend: args.resend,
            nc: args.nc,
            sockbuf: args.sockbuf,
            keepalive: args.keepalive,
            log: args.log.clone(),
            snmplog: args.snmplog.clone(),
            snmpperiod: args.snmpperiod,
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::from(args);
    if let Some(path) = &args.config {
        config.apply_file(path)?;
    }
    if let Some(opts) = plugin_options_from_env() {
        config.apply_plugin_options(&opts);
    }
    config.apply_mode();
    config.validate()?;
    Ok(config)
}

#[cfg(unix)]
fn make_dialer(vpn: bool) -> anyhow::Result<TcpDialer> {
    if !vpn {
        return Ok(TcpDialer::new());
    }
    component_info!("protect", "VPN mode: protecting sockets via {}", PROTECT_PATH);
    let protector: Arc<dyn SocketProtector> = Arc::new(UnixSocketProtector::new(PROTECT_PATH));
    Ok(TcpDialer::with_protector(protector))
}

#[cfg(not(unix))]
fn make_dialer(vpn: bool) -> anyhow::Result<TcpDialer> {
    if vpn {
        anyhow::bail!("VPN mode needs Unix domain sockets");
    }
    Ok(TcpDialer::new())
}

/// Size the kernel buffers of an accepted local connection
fn tune_local(conn: &TcpStream, sock_buf: usize) {
    let sock = SockRef::from(conn);
    if let Err(e) = sock.set_recv_buffer_size(sock_buf) {
        component_warn!("accept", "TCP SetReadBuffer: {}", e);
    }
    if let Err(e) = sock.set_send_buffer_size(sock_buf) {
        component_warn!("accept", "TCP SetWriteBuffer: {}", e);
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let log_file = (!config.log.is_empty()).then(|| PathBuf::from(&config.log));
    logging::init(&args.log_level, log_file.as_deref())?;

    info!("Starting tunnel client v{}", env!("CARGO_PKG_VERSION"));
    if args.fast_open {
        warn!("--fast-open has no effect and is ignored");
    }

    let listen_addr = config.listen_addr().await?;
    let listener = listen_tcp(listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    info!("Listening on {}", listener.local_addr()?);
    config.log_summary();

    let stats = Arc::new(Stats::default());
    let dialer = make_dialer(args.vpn)?;
    let factory = SessionFactory::new(dialer, config.session_config());

    let (retire_tx, scavenger) = scavenger_channel(stats.clone());
    tokio::spawn(scavenger.run());

    let mut pool = SessionPool::initialize(factory, config.pool_config(), retire_tx, stats.clone())
        .await
        .context("Failed to create initial sessions")?;
    let mut dispatcher = Dispatcher::new(pool.len());

    if let Some(logger) = StatsLogger::new(&config.snmplog, config.snmpperiod, stats.clone())? {
        tokio::spawn(logger.run());
    }

    loop {
        let (conn, peer_addr) = listener
            .accept()
            .await
            .context("Failed to accept local connection")?;
        stats.record_accept();
        component_debug!("accept", "Accepted connection from {}", peer_addr);
        tune_local(&conn, config.sockbuf);

        let slot = dispatcher.next_slot();
        let session = pool.acquire(slot).await;
        tokio::spawn(relay(conn, session, stats.clone()));
    }
}
