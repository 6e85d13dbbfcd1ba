//! Client-side counters.
//!
//! Updated by the pool, the scavenger and every relay; read periodically by
//! the stats logger in the binary.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters
#[derive(Debug, Default)]
pub struct Stats {
    connections_accepted: AtomicU64,
    sessions_created: AtomicU64,
    sessions_rotated: AtomicU64,
    sessions_scavenged: AtomicU64,
    streams_opened: AtomicU64,
    stream_failures: AtomicU64,
    active_relays: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Local connections accepted
    pub connections_accepted: u64,
    /// Sessions created, including the initial ones
    pub sessions_created: u64,
    /// Slot rotations performed
    pub sessions_rotated: u64,
    /// Retired sessions closed by the scavenger
    pub sessions_scavenged: u64,
    /// Logical streams opened
    pub streams_opened: u64,
    /// Stream opens that failed
    pub stream_failures: u64,
    /// Relays currently running (gauge)
    pub active_relays: u64,
    /// Bytes copied from local connections into streams
    pub bytes_sent: u64,
    /// Bytes copied from streams into local connections
    pub bytes_received: u64,
}

impl StatsSnapshot {
    /// CSV column names, in [`StatsSnapshot::to_row`] order
    pub fn header() -> &'static [&'static str] {
        &[
            "ConnectionsAccepted",
            "SessionsCreated",
            "SessionsRotated",
            "SessionsScavenged",
            "StreamsOpened",
            "StreamFailures",
            "ActiveRelays",
            "BytesSent",
            "BytesReceived",
        ]
    }

    /// Values as CSV fields
    pub fn to_row(&self) -> Vec<String> {
        [
            self.connections_accepted,
            self.sessions_created,
            self.sessions_rotated,
            self.sessions_scavenged,
            self.streams_opened,
            self.stream_failures,
            self.active_relays,
            self.bytes_sent,
            self.bytes_received,
        ]
        .iter()
        .map(|v| v.to_string())
        .collect()
    }
}

impl Stats {
    /// A local connection was accepted
    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A session was created
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// A slot swapped its session
    pub fn record_rotation(&self) {
        self.sessions_rotated.fetch_add(1, Ordering::Relaxed);
    }

    /// The scavenger closed a retired session
    pub fn record_scavenged(&self) {
        self.sessions_scavenged.fetch_add(1, Ordering::Relaxed);
    }

    /// A stream open failed
    pub fn record_stream_failure(&self) {
        self.stream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A relay opened its stream and started copying
    pub fn relay_started(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.active_relays.fetch_add(1, Ordering::Relaxed);
    }

    /// A relay finished after moving `sent` and `received` bytes
    pub fn relay_finished(&self, sent: u64, received: u64) {
        self.active_relays.fetch_sub(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_rotated: self.sessions_rotated.load(Ordering::Relaxed),
            sessions_scavenged: self.sessions_scavenged.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            active_relays: self.active_relays.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Read every counter and reset them; the relay gauge is left alone
    pub fn take(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.swap(0, Ordering::Relaxed),
            sessions_created: self.sessions_created.swap(0, Ordering::Relaxed),
            sessions_rotated: self.sessions_rotated.swap(0, Ordering::Relaxed),
            sessions_scavenged: self.sessions_scavenged.swap(0, Ordering::Relaxed),
            streams_opened: self.streams_opened.swap(0, Ordering::Relaxed),
            stream_failures: self.stream_failures.swap(0, Ordering::Relaxed),
            active_relays: self.active_relays.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
        }
    }
}
