//! Retired-session scavenger.
//!
//! A displaced session may still carry relays that were started before it was
//! rotated out. The pool hands it to the scavenger instead of closing it, and
//! the scavenger closes it on a later tick once it is idle, already dead, or
//! has been waiting longer than [`MAX_SCAVENGE_AGE`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use tunnel_session::SharedSession;

use crate::stats::Stats;

/// Capacity of the retirement queue
pub const RETIRE_QUEUE_CAPACITY: usize = 128;

/// Interval between sweeps
pub const SCAVENGE_PERIOD: Duration = Duration::from_secs(30);

/// Retired sessions older than this are closed even with open streams
pub const MAX_SCAVENGE_AGE: Duration = Duration::from_secs(10 * 60);

/// A session displaced from its slot
#[derive(Debug)]
pub struct RetiredSession {
    /// The displaced session
    pub session: SharedSession,
    /// When it left the pool
    pub retired_at: Instant,
}

impl RetiredSession {
    /// Stamp `session` as retired now
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            retired_at: Instant::now(),
        }
    }

    /// Whether the session may be closed at `now`
    pub fn should_reap(&self, now: Instant, max_age: Duration) -> bool {
        self.session.num_streams() == 0
            || self.session.is_closed()
            || now.saturating_duration_since(self.retired_at) > max_age
    }
}

/// Pool side of the retirement queue
#[derive(Clone, Debug)]
pub struct RetireSender {
    tx: mpsc::Sender<RetiredSession>,
}

impl RetireSender {
    /// Queue `session` for closing.
    ///
    /// Waits while the queue is full. If the scavenger has stopped the session
    /// is closed here instead.
    pub async fn retire(&self, session: SharedSession) {
        if self.tx.capacity() == 0 {
            warn!(
                "Retirement queue full ({} entries), waiting for the scavenger",
                RETIRE_QUEUE_CAPACITY
            );
        }

        if let Err(mpsc::error::SendError(entry)) = self.tx.send(RetiredSession::new(session)).await
        {
            warn!("Scavenger stopped, closing {:?} directly", entry.session);
            entry.session.close().await;
        }
    }
}

/// Create the retirement queue and the scavenger that drains it
pub fn scavenger_channel(stats: Arc<Stats>) -> (RetireSender, Scavenger) {
    let (tx, rx) = mpsc::channel(RETIRE_QUEUE_CAPACITY);
    let scavenger = Scavenger {
        rx,
        pending: Vec::new(),
        period: SCAVENGE_PERIOD,
        max_age: MAX_SCAVENGE_AGE,
        stats,
    };
    (RetireSender { tx }, scavenger)
}

/// Background task closing retired sessions
pub struct Scavenger {
    pub(crate) rx: mpsc::Receiver<RetiredSession>,
    pending: Vec<RetiredSession>,
    period: Duration,
    max_age: Duration,
    stats: Arc<Stats>,
}

impl Scavenger {
    /// Override the sweep interval
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Override the age after which busy sessions are closed anyway
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Number of sessions waiting to be closed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Receive retired sessions and sweep them on every tick.
    ///
    /// Returns once the queue is closed and nothing is left pending.
    pub async fn run(mut self) {
        info!(
            "Scavenger started: period {:?}, max age {:?}",
            self.period, self.max_age
        );

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        let mut open = true;

        loop {
            tokio::select! {
                received = self.rx.recv(), if open => match received {
                    Some(entry) => {
                        debug!("Retired {:?} ({} streams)", entry.session, entry.session.num_streams());
                        self.pending.push(entry);
                    }
                    None => {
                        debug!("Retirement queue closed, {} sessions pending", self.pending.len());
                        open = false;
                    }
                },
                _ = ticker.tick() => {
                    self.sweep(Instant::now()).await;
                }
            }

            if !open && self.pending.is_empty() {
                break;
            }
        }

        info!("Scavenger stopped");
    }

    /// Close every pending session that may be reaped at `now`
    pub async fn sweep(&mut self, now: Instant) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let mut reaped = 0;

        for entry in pending {
            if entry.should_reap(now, self.max_age) {
                debug!(
                    "Closing retired {:?} after {:?}",
                    entry.session,
                    now.saturating_duration_since(entry.retired_at)
                );
                entry.session.close().await;
                self.stats.record_scavenged();
                reaped += 1;
            } else {
                self.pending.push(entry);
            }
        }

        if reaped > 0 {
            debug!("Scavenged {} sessions, {} still pending", reaped, self.pending.len());
        }
        reaped
    }
}
