//! Counters for dataset operations.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::dataset::DatasetKind;

/// Dataset operation counters. Cheap to update from the engine loop.
#[derive(Debug, Default)]
pub struct DatasetMetrics {
    active_sets_accepted: AtomicU64,
    active_sets_rejected: AtomicU64,
    pending_sets_accepted: AtomicU64,
    pending_sets_rejected: AtomicU64,
    delay_clamps: AtomicU64,
    pending_commits: AtomicU64,
    datasets_adopted: AtomicU64,
    reconcile_pushes: AtomicU64,
    mgmt_requests: AtomicU64,
    mgmt_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sets_accepted: u64,
    pub active_sets_rejected: u64,
    pub pending_sets_accepted: u64,
    pub pending_sets_rejected: u64,
    pub delay_clamps: u64,
    pub pending_commits: u64,
    pub datasets_adopted: u64,
    pub reconcile_pushes: u64,
    pub mgmt_requests: u64,
    pub mgmt_timeouts: u64,
}

impl DatasetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a Set evaluated by the leader.
    pub fn record_set(&self, kind: DatasetKind, accepted: bool) {
        let counter = match (kind, accepted) {
            (DatasetKind::Active, true) => &self.active_sets_accepted,
            (DatasetKind::Active, false) => &self.active_sets_rejected,
            (DatasetKind::Pending, true) => &self.pending_sets_accepted,
            (DatasetKind::Pending, false) => &self.pending_sets_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delay_clamp(&self) {
        self.delay_clamps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.pending_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// A newer dataset was taken from a neighbour or parent.
    pub fn record_adopted(&self) {
        self.datasets_adopted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile_push(&self) {
        self.reconcile_pushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mgmt_request(&self) {
        self.mgmt_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mgmt_timeout(&self) {
        self.mgmt_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sets_accepted: self.active_sets_accepted.load(Ordering::Relaxed),
            active_sets_rejected: self.active_sets_rejected.load(Ordering::Relaxed),
            pending_sets_accepted: self.pending_sets_accepted.load(Ordering::Relaxed),
            pending_sets_rejected: self.pending_sets_rejected.load(Ordering::Relaxed),
            delay_clamps: self.delay_clamps.load(Ordering::Relaxed),
            pending_commits: self.pending_commits.load(Ordering::Relaxed),
            datasets_adopted: self.datasets_adopted.load(Ordering::Relaxed),
            reconcile_pushes: self.reconcile_pushes.load(Ordering::Relaxed),
            mgmt_requests: self.mgmt_requests.load(Ordering::Relaxed),
            mgmt_timeouts: self.mgmt_timeouts.load(Ordering::Relaxed),
        }
    }
}
