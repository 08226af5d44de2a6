//! Lock-free counters for one batch run.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Attempt-level counters, updated by every machine.
#[derive(Debug, Default)]
pub struct BatchStats {
    attempts: AtomicUsize,
    failures: AtomicUsize,
    retried: AtomicUsize,
    delivered: AtomicUsize,
    bytes: AtomicU64,
}

impl BatchStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strategy invocations started.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Attempts that ended in a classified failure.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Same-strategy retries after transient failures.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Artifacts handed to the sink.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Bytes written by successful attempts.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_delivery(&self, bytes: u64) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }
}
