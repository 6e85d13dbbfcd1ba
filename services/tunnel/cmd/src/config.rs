//! Configuration handling for the tunnel client.
//!
//! Values start from the command line, are overridden by the `-c` config file
//! (JSON, or YAML for `.yaml`/`.yml`), then by the SIP003 plugin environment
//! when the client runs as a shadowsocks plugin. The mode profile is applied
//! last and replaces the four no-delay values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{info, warn};
use tunnel_pool::PoolConfig;
use tunnel_session::{FecConfig, NoDelayConfig, SessionConfig};

use crate::stats::check_path_format;

/// Highest valid DSCP code point
const MAX_DSCP: u32 = 63;

/// Client configuration, keyed the same way in files and plugin options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local listen address, `:port` binds every interface
    pub localaddr: String,
    /// Remote transport address
    pub remoteaddr: String,
    /// Tuning profile: normal, fast, fast2, fast3, or anything else for manual
    pub mode: String,
    /// Number of pooled sessions
    pub conn: usize,
    /// Session lifetime in seconds, 0 disables rotation by age
    pub autoexpire: u64,
    pub mtu: u32,
    pub sndwnd: u32,
    pub rcvwnd: u32,
    pub datashard: u32,
    pub parityshard: u32,
    pub dscp: u32,
    /// Disable stream compression
    pub nocomp: bool,
    pub acknodelay: bool,
    pub nodelay: u32,
    pub interval: u32,
    pub resend: u32,
    pub nc: u32,
    /// Socket buffer size in bytes
    pub sockbuf: usize,
    /// Transport keep-alive in seconds
    pub keepalive: u64,
    /// Append logs to this file instead of stderr
    pub log: String,
    /// Stats CSV path, expanded with strftime escapes
    pub snmplog: String,
    /// Stats collection period in seconds
    pub snmpperiod: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            localaddr: ":12948".to_string(),
            remoteaddr: "vps:29900".to_string(),
            mode: "fast".to_string(),
            conn: 1,
            autoexpire: 60,
            mtu: 1350,
            sndwnd: 128,
            rcvwnd: 512,
            datashard: 10,
            parityshard: 3,
            dscp: 0,
            nocomp: false,
            acknodelay: false,
            nodelay: 0,
            interval: 40,
            resend: 0,
            nc: 0,
            sockbuf: 4194304, // 4 MiB
            keepalive: 10,
            log: String::new(),
            snmplog: String::new(),
            snmpperiod: 60,
        }
    }
}

impl ClientConfig {
    /// Override every key present in the config file at `path`
    pub fn apply_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let overrides: serde_json::Value = if is_yaml {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config {:?}", path))?;
            serde_json::to_value(yaml)?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config {:?}", path))?
        };

        let serde_json::Value::Object(overrides) = overrides else {
            bail!("Config file {:?} must contain a mapping", path);
        };

        let mut merged = serde_json::to_value(&*self)?;
        if let serde_json::Value::Object(current) = &mut merged {
            current.extend(overrides);
        }
        *self = serde_json::from_value(merged)
            .with_context(|| format!("Invalid value in config file {:?}", path))?;

        info!("Loaded configuration from {:?}", path);
        Ok(())
    }

    /// Override from SIP003 plugin options; unparsable values are skipped
    pub fn apply_plugin_options(&mut self, opts: &HashMap<String, String>) {
        for (key, value) in opts {
            let applied = match key.as_str() {
                "localaddr" => {
                    self.localaddr = value.clone();
                    true
                }
                "remoteaddr" => {
                    self.remoteaddr = value.clone();
                    true
                }
                "mode" => {
                    self.mode = value.clone();
                    true
                }
                "log" => {
                    self.log = value.clone();
                    true
                }
                "snmplog" => {
                    self.snmplog = value.clone();
                    true
                }
                "conn" => set_parsed(&mut self.conn, value),
                "autoexpire" => set_parsed(&mut self.autoexpire, value),
                "mtu" => set_parsed(&mut self.mtu, value),
                "sndwnd" => set_parsed(&mut self.sndwnd, value),
                "rcvwnd" => set_parsed(&mut self.rcvwnd, value),
                "datashard" => set_parsed(&mut self.datashard, value),
                "parityshard" => set_parsed(&mut self.parityshard, value),
                "dscp" => set_parsed(&mut self.dscp, value),
                "nodelay" => set_parsed(&mut self.nodelay, value),
                "interval" => set_parsed(&mut self.interval, value),
                "resend" => set_parsed(&mut self.resend, value),
                "nc" => set_parsed(&mut self.nc, value),
                "sockbuf" => set_parsed(&mut self.sockbuf, value),
                "keepalive" => set_parsed(&mut self.keepalive, value),
                "snmpperiod" => set_parsed(&mut self.snmpperiod, value),
                "nocomp" => set_bool(&mut self.nocomp, value),
                "acknodelay" => set_bool(&mut self.acknodelay, value),
                _ => {
                    warn!("Ignoring unknown plugin option {}", key);
                    continue;
                }
            };
            if !applied {
                warn!("Ignoring plugin option {}={}: invalid value", key, value);
            }
        }
    }

    /// Replace the no-delay values with the named profile, if any
    pub fn apply_mode(&mut self) {
        let profile = match self.mode.as_str() {
            "normal" => (0, 30, 2, 1),
            "fast" => (0, 20, 2, 1),
            "fast2" => (1, 20, 2, 1),
            "fast3" => (1, 10, 2, 1),
            _ => return,
        };
        (self.nodelay, self.interval, self.resend, self.nc) = profile;
    }

    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.conn == 0 {
            bail!("conn must be at least 1");
        }
        if self.dscp > MAX_DSCP {
            bail!("dscp must be between 0 and {}, got {}", MAX_DSCP, self.dscp);
        }
        split_host_port(&self.localaddr)?;
        check_path_format(&self.snmplog)?;
        Ok(())
    }

    /// Resolve `localaddr`; an empty host means every IPv4 interface
    pub async fn listen_addr(&self) -> Result<SocketAddr> {
        let (host, port) = split_host_port(&self.localaddr)?;
        if host.is_empty() {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }
        lookup_host((host, port))
            .await
            .with_context(|| format!("Failed to resolve local address {:?}", self.localaddr))?
            .next()
            .with_context(|| format!("No address found for {:?}", self.localaddr))
    }

    /// Parameters for every new session
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            remote_addr: self.remoteaddr.clone(),
            fec: FecConfig {
                data_shards: self.datashard,
                parity_shards: self.parityshard,
            },
            no_delay: NoDelayConfig::new(self.nodelay, self.interval, self.resend, self.nc),
            send_window: self.sndwnd,
            recv_window: self.rcvwnd,
            mtu: self.mtu,
            ack_no_delay: self.acknodelay,
            keep_alive: Duration::from_secs(self.keepalive),
            // validate() bounds dscp to six bits
            dscp: self.dscp.min(MAX_DSCP) as u8,
            sock_buf: self.sockbuf,
            compression: !self.nocomp,
        }
    }

    /// Pool sizing and expiry
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connections: self.conn,
            auto_expire: Duration::from_secs(self.autoexpire),
        }
    }

    /// Log the effective settings
    pub fn log_summary(&self) {
        info!("remote address: {}", self.remoteaddr);
        info!(
            "nodelay parameters: {} {} {} {}",
            self.nodelay, self.interval, self.resend, self.nc
        );
        info!("sndwnd: {} rcvwnd: {}", self.sndwnd, self.rcvwnd);
        info!("compression: {}", !self.nocomp);
        info!("mtu: {}", self.mtu);
        info!(
            "datashard: {} parityshard: {}",
            self.datashard, self.parityshard
        );
        info!("acknodelay: {}", self.acknodelay);
        info!("dscp: {}", self.dscp);
        info!("sockbuf: {}", self.sockbuf);
        info!("keepalive: {}", self.keepalive);
        info!("conn: {}", self.conn);
        info!("autoexpire: {}", self.autoexpire);
        info!("snmplog: {}", self.snmplog);
        info!("snmpperiod: {}", self.snmpperiod);
    }
}

fn set_parsed<T: std::str::FromStr>(field: &mut T, value: &str) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *field = parsed;
            true
        }
        Err(_) => false,
    }
}

fn set_bool(field: &mut bool, value: &str) -> bool {
    match parse_bool(value) {
        Some(parsed) => {
            *field = parsed;
            true
        }
        None => false,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Read the SIP003 plugin environment.
///
/// Returns `None` unless all four `SS_*` address variables are set. The
/// local and remote addresses are returned under `localaddr`/`remoteaddr`
/// next to the parsed `SS_PLUGIN_OPTIONS`.
pub fn plugin_options_from_env() -> Option<HashMap<String, String>> {
    plugin_options(|name| std::env::var(name).ok())
}

fn plugin_options<F>(var: F) -> Option<HashMap<String, String>>
where
    F: Fn(&str) -> Option<String>,
{
    let remote_host = var("SS_REMOTE_HOST")?;
    let remote_port = var("SS_REMOTE_PORT")?;
    let local_host = var("SS_LOCAL_HOST")?;
    let local_port = var("SS_LOCAL_PORT")?;

    let mut opts = HashMap::new();
    opts.insert(
        "remoteaddr".to_string(),
        join_host_port(&remote_host, &remote_port),
    );
    opts.insert(
        "localaddr".to_string(),
        join_host_port(&local_host, &local_port),
    );
    if let Some(raw) = var("SS_PLUGIN_OPTIONS") {
        opts.extend(parse_plugin_options(&raw));
    }
    Some(opts)
}

/// Split `host:port`, stripping brackets from an IPv6 host
fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("Missing port in local address {:?}", addr))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid local port in {:?}", addr))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host, port))
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parse `key=value;flag;...`; a backslash escapes the next character and a
/// bare flag reads as `true`
pub fn parse_plugin_options(raw: &str) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let mut key = String::new();
    let mut value: Option<String> = None;
    let mut chars = raw.chars();

    let mut finish = |key: &mut String, value: &mut Option<String>| {
        let k = std::mem::take(key);
        let v = value.take();
        if !k.is_empty() {
            opts.insert(k, v.unwrap_or_else(|| "true".to_string()));
        }
    };

    while let Some(c) = chars.next() {
        let (literal, c) = match c {
            '\\' => match chars.next() {
                Some(escaped) => (true, escaped),
                None => break,
            },
            other => (false, other),
        };

        if !literal && c == ';' {
            finish(&mut key, &mut value);
        } else if let Some(v) = value.as_mut() {
            v.push(c);
        } else if !literal && c == '=' {
            value = Some(String::new());
        } else {
            key.push(c);
        }
    }
    finish(&mut key, &mut value);

    opts
}
