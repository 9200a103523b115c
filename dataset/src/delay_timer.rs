//! Pending dataset delay timer
//!
//! One timer per node. It is armed when a Pending dataset is accepted or
//! adopted, replaced outright by a newer Pending dataset, and fires once.
//! Monotonic time drives the countdown; wall-clock time is only used to
//! stamp persisted records and to interpret them at boot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::DelayBootPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayState {
    #[default]
    NoPendingDataset,
    Scheduled {
        deadline: Instant,
    },
}

#[derive(Debug, Default)]
pub struct DelayTimer {
    state: DelayState,
}

impl DelayTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DelayState {
        self.state
    }

    /// Arm (or re-arm) the timer to fire `delay` after `now`.
    pub fn schedule(&mut self, now: Instant, delay: Duration) {
        self.state = DelayState::Scheduled {
            deadline: now + delay,
        };
    }

    pub fn cancel(&mut self) {
        self.state = DelayState::NoPendingDataset;
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DelayState::Scheduled { deadline } => Some(deadline),
            DelayState::NoPendingDataset => None,
        }
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Disarm and return true if the deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.state = DelayState::NoPendingDataset;
                true
            }
            _ => false,
        }
    }
}

/// Remaining delay to arm at boot from a persisted record.
pub fn boot_remaining(
    policy: DelayBootPolicy,
    persisted: Duration,
    saved_at: DateTime<Utc>,
    wall_now: DateTime<Utc>,
) -> Duration {
    match policy {
        DelayBootPolicy::Resume => persisted,
        DelayBootPolicy::ElapseWallClock => {
            let elapsed = (wall_now - saved_at).to_std().unwrap_or(Duration::ZERO);
            persisted.saturating_sub(elapsed)
        }
    }
}

/// Source of wall-clock time for persisted records.
pub trait WallClock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for simulations and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
