//! Removal statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::removal::{RemovalCause, RemovalOutcome, SkipReason};

/// Lock-free counters for removal outcomes.
#[derive(Debug, Default)]
pub struct StatsCounter {
    expired: AtomicU64,
    evicted: AtomicU64,
    skipped_locked: AtomicU64,
    skipped_absent: AtomicU64,
    skipped_not_expired: AtomicU64,
    failed: AtomicU64,
    batch_errors: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one removal outcome.
    pub fn record(&self, cause: RemovalCause, outcome: RemovalOutcome) {
        let counter = match (cause, outcome) {
            (RemovalCause::Expiration, RemovalOutcome::Removed) => &self.expired,
            (RemovalCause::Eviction, RemovalOutcome::Removed) => &self.evicted,
            (_, RemovalOutcome::Skipped(SkipReason::Locked)) => &self.skipped_locked,
            (_, RemovalOutcome::Skipped(SkipReason::Absent)) => &self.skipped_absent,
            (_, RemovalOutcome::Skipped(SkipReason::NotExpired)) => &self.skipped_not_expired,
            (_, RemovalOutcome::Failed) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a batch that could not be opened.
    pub fn record_batch_error(&self) {
        self.batch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    pub fn snapshot(&self, tracked: usize, queued: usize) -> SchedulerStats {
        SchedulerStats {
            tracked,
            queued,
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            skipped_locked: self.skipped_locked.load(Ordering::Relaxed),
            skipped_absent: self.skipped_absent.load(Ordering::Relaxed),
            skipped_not_expired: self.skipped_not_expired.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batch_errors: self.batch_errors.load(Ordering::Relaxed),
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Ids currently tracked for expiration (suspended included).
    pub tracked: usize,

    /// Ids currently in the LRU queue.
    pub queued: usize,

    /// Entries removed by idle-timeout expiration.
    pub expired: u64,

    /// Entries removed by capacity eviction.
    pub evicted: u64,

    /// Candidates skipped because they were in use.
    pub skipped_locked: u64,

    /// Candidates skipped because they were already gone.
    pub skipped_absent: u64,

    /// Expiration candidates that turned out to be recently used.
    pub skipped_not_expired: u64,

    /// Removals the store reported as failed.
    pub failed: u64,

    /// Batches that could not be opened.
    pub batch_errors: u64,
}

impl SchedulerStats {
    /// Total successful removals.
    pub fn removed(&self) -> u64 {
        self.expired + self.evicted
    }

    /// Total skipped candidates.
    pub fn skipped(&self) -> u64 {
        self.skipped_locked + self.skipped_absent + self.skipped_not_expired
    }
}
