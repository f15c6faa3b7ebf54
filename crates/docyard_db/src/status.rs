//! Completion counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for throughput counters, called once per completion attempt.
pub trait StatusUpdater: Send + Sync {
    fn add_processed(&self, n: u64);
    fn add_discarded(&self, n: u64);
    fn add_failed(&self, n: u64);
}

/// In-process counters, the default sink of a [`crate::DocumentDb`].
#[derive(Debug, Default)]
pub struct StatusCounters {
    processed: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`StatusCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub processed: u64,
    pub discarded: u64,
    pub failed: u64,
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl StatusUpdater for StatusCounters {
    fn add_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    fn add_discarded(&self, n: u64) {
        self.discarded.fetch_add(n, Ordering::Relaxed);
    }

    fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let counters = StatusCounters::new();
        counters.add_processed(2);
        counters.add_failed(1);
        assert_eq!(
            counters.snapshot(),
            StatusSnapshot {
                processed: 2,
                discarded: 0,
                failed: 1
            }
        );
    }
}
