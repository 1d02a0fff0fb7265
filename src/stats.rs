use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the acceptor and every worker.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    served: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    /// Accepted after the queue closed; closed without being served.
    pub rejected: u64,
    pub served: u64,
    pub failed: u64,
    pub bytes: u64,
}

impl ServerStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection that ran to end-of-stream.
    pub fn record_served(&self, bytes: u64) {
        self.served.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A connection abandoned early (open, read or write failure).
    pub fn record_failed(&self, bytes: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accumulates() {
        let stats = ServerStats::default();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_rejected();
        stats.record_served(10);
        stats.record_failed(3);
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                accepted: 2,
                rejected: 1,
                served: 1,
                failed: 1,
                bytes: 13,
            }
        );
    }
}
