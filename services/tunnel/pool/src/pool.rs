//! Session pool and round-robin dispatch.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tunnel_session::{SessionSource, SharedSession};

use crate::error::PoolError;
use crate::scavenger::RetireSender;
use crate::stats::Stats;

/// Pool sizing and expiry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of slots, each holding one session
    pub connections: usize,
    /// Session lifetime before rotation; zero disables expiry
    pub auto_expire: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections: 1,
            auto_expire: Duration::from_secs(60),
        }
    }
}

/// One pool position and the session currently installed in it
#[derive(Debug)]
pub struct PoolSlot {
    /// Current session
    pub session: SharedSession,
    /// When the session must be rotated, if expiry is enabled
    pub expires_at: Option<Instant>,
}

impl PoolSlot {
    fn install(session: SharedSession, auto_expire: Option<Duration>) -> Self {
        Self {
            session,
            expires_at: auto_expire.map(|ttl| Instant::now() + ttl),
        }
    }

    /// Whether the session must be replaced before use at `now`
    pub fn needs_rotation(&self, now: Instant) -> bool {
        self.session.is_closed() || self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Fixed-size set of multiplexed sessions
pub struct SessionPool<S> {
    source: S,
    slots: Vec<PoolSlot>,
    auto_expire: Option<Duration>,
    retire_tx: RetireSender,
    stats: Arc<Stats>,
}

impl<S: SessionSource> SessionPool<S> {
    /// Fill every slot with a fresh session.
    ///
    /// Slots are created one attempt each; the first failure aborts.
    pub async fn initialize(
        source: S,
        config: PoolConfig,
        retire_tx: RetireSender,
        stats: Arc<Stats>,
    ) -> Result<Self, PoolError> {
        if config.connections == 0 {
            return Err(PoolError::NoSlots);
        }

        let auto_expire = if config.auto_expire.is_zero() {
            None
        } else {
            Some(config.auto_expire)
        };

        let mut slots = Vec::with_capacity(config.connections);
        for slot in 0..config.connections {
            let session = source
                .create()
                .await
                .map_err(|source| PoolError::InitialSession { slot, source })?;
            stats.record_session_created();
            debug!("Slot {} ready with {:?}", slot, session);
            slots.push(PoolSlot::install(session, auto_expire));
        }

        info!(
            "Session pool ready: {} slots, auto-expire {:?}",
            slots.len(),
            auto_expire
        );

        Ok(Self {
            source,
            slots,
            auto_expire,
            retire_tx,
            stats,
        })
    }

    /// Return a usable session for slot `idx`, rotating it first if it is
    /// closed or expired.
    ///
    /// Rotation waits for the replacement session, however long that takes.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    pub async fn acquire(&mut self, idx: usize) -> SharedSession {
        if self.slots[idx].needs_rotation(Instant::now()) {
            self.rotate(idx).await;
        }
        self.slots[idx].session.clone()
    }

    async fn rotate(&mut self, idx: usize) {
        let reason = if self.slots[idx].session.is_closed() {
            "closed"
        } else {
            "expired"
        };
        info!("Rotating slot {}: session {}", idx, reason);

        let replacement = self.source.wait_until_ready().await;
        self.stats.record_session_created();
        self.stats.record_rotation();

        let displaced = std::mem::replace(
            &mut self.slots[idx],
            PoolSlot::install(replacement, self.auto_expire),
        );
        debug!(
            "Slot {} now holds {:?}, retiring {:?}",
            idx, self.slots[idx].session, displaced.session
        );
        self.retire_tx.retire(displaced.session).await;
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots; never true for an initialized pool
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inspect slot `idx`
    pub fn slot(&self, idx: usize) -> Option<&PoolSlot> {
        self.slots.get(idx)
    }

    /// The session source used for rotation
    pub fn source(&self) -> &S {
        &self.source
    }
}

/// Round-robin slot selection
#[derive(Debug, Clone)]
pub struct Dispatcher {
    counter: u64,
    slots: usize,
}

impl Dispatcher {
    /// Dispatch over `slots` positions
    pub fn new(slots: usize) -> Self {
        Self {
            counter: 0,
            slots: slots.max(1),
        }
    }

    /// Slot for the next connection
    pub fn next_slot(&mut self) -> usize {
        let slot = (self.counter % self.slots as u64) as usize;
        self.counter = self.counter.wrapping_add(1);
        slot
    }
}
