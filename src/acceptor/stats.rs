//! Acceptor Statistics

use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters shared by the acceptor and its accept slots
#[derive(Debug, Default)]
pub struct AcceptorStats {
    active_slots: AtomicUsize,
    accepts_issued: AtomicUsize,
    accepts_completed: AtomicUsize,
    accept_failures: AtomicUsize,
    suppressed_failures: AtomicUsize,
    connections_created: AtomicUsize,
    setup_failures: AtomicUsize,
}

/// Point-in-time copy of the acceptor counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptorStatsSnapshot {
    /// Accept slots opened and not yet retired.
    ///
    /// Stays at the configured concurrency while listening; it does not dip
    /// between an accept resolving and its replacement being issued.
    pub active_slots: usize,
    pub accepts_issued: usize,
    pub accepts_completed: usize,
    pub accept_failures: usize,
    /// Failures swallowed because the acceptor was stopping
    pub suppressed_failures: usize,
    pub connections_created: usize,
    pub setup_failures: usize,
}

impl AcceptorStats {
    pub(crate) fn open_slots(&self, count: usize) {
        self.active_slots.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn retire_slot(&self) {
        self.active_slots.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_issued(&self) {
        self.accepts_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.accepts_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.accept_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suppressed(&self) {
        self.suppressed_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_setup_failure(&self) {
        self.setup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_slots(&self) -> usize {
        self.active_slots.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> AcceptorStatsSnapshot {
        AcceptorStatsSnapshot {
            active_slots: self.active_slots(),
            accepts_issued: self.accepts_issued.load(Ordering::Relaxed),
            accepts_completed: self.accepts_completed.load(Ordering::Relaxed),
            accept_failures: self.accept_failures.load(Ordering::Relaxed),
            suppressed_failures: self.suppressed_failures.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            setup_failures: self.setup_failures.load(Ordering::Relaxed),
        }
    }
}
