//! # Session Performance Statistics
//!
//! Lightweight timing of cluster CRUD paths. When a session registers a
//! statistics object, every create/read/update/delete brackets its work with
//! a timer; the guard records on drop, so the stop side fires on error paths
//! too — no try/finally needed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOperationKind {
    RecordCreation,
    RecordRead,
    RecordUpdate,
    RecordDeletion,
}

#[derive(Debug, Default)]
struct OperationCounter {
    invocations: AtomicU64,
    nanos: AtomicU64,
}

impl OperationCounter {
    fn record(&self, nanos: u64) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Per-session counters. Shared behind an `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct SessionStoragePerformanceStatistic {
    creation: OperationCounter,
    read: OperationCounter,
    update: OperationCounter,
    deletion: OperationCounter,
}

impl SessionStoragePerformanceStatistic {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: ClusterOperationKind) -> &OperationCounter {
        match kind {
            ClusterOperationKind::RecordCreation => &self.creation,
            ClusterOperationKind::RecordRead => &self.read,
            ClusterOperationKind::RecordUpdate => &self.update,
            ClusterOperationKind::RecordDeletion => &self.deletion,
        }
    }

    /// Starts a timer; dropping the guard stops it and records the span.
    pub fn start_timer(&self, kind: ClusterOperationKind) -> OperationTimer<'_> {
        OperationTimer {
            stats: self,
            kind,
            started: Instant::now(),
        }
    }

    pub fn invocations(&self, kind: ClusterOperationKind) -> u64 {
        self.counter(kind).invocations.load(Ordering::Relaxed)
    }

    pub fn total_nanos(&self, kind: ClusterOperationKind) -> u64 {
        self.counter(kind).nanos.load(Ordering::Relaxed)
    }
}

pub struct OperationTimer<'a> {
    stats: &'a SessionStoragePerformanceStatistic,
    kind: ClusterOperationKind,
    started: Instant,
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        let nanos = self.started.elapsed().as_nanos() as u64;
        self.stats.counter(self.kind).record(nanos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_on_drop() {
        let stats = SessionStoragePerformanceStatistic::new();

        {
            let _t = stats.start_timer(ClusterOperationKind::RecordCreation);
        }

        assert_eq!(stats.invocations(ClusterOperationKind::RecordCreation), 1);
        assert_eq!(stats.invocations(ClusterOperationKind::RecordRead), 0);
    }

    #[test]
    fn timer_records_even_when_work_fails() {
        let stats = SessionStoragePerformanceStatistic::new();

        let result: Result<(), &str> = (|| {
            let _t = stats.start_timer(ClusterOperationKind::RecordUpdate);
            Err("boom")
        })();

        assert!(result.is_err());
        assert_eq!(stats.invocations(ClusterOperationKind::RecordUpdate), 1);
    }
}
