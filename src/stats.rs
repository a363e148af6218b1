//! Pipeline statistics - atomic counters shared across stages
//!
//! One `PipelineStats` instance is created per runtime and cloned (via
//! `Arc`) into every stage. Counters are relaxed atomics; `snapshot()`
//! gives a point-in-time copy for logging and the demo summary.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for the whole pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    // Ingest
    pub raw_ingested: AtomicU64,
    pub dropped_no_route: AtomicU64,
    pub dropped_filtered: AtomicU64,
    pub canonical_emitted: AtomicU64,
    /// Sum of adapter-to-ingest latencies; divide by `canonical_emitted`
    /// for the running average.
    pub ingest_latency_ms_sum: AtomicU64,

    // Dispatcher
    pub deduped: AtomicU64,
    pub buffered: AtomicU64,
    pub released_in_order: AtomicU64,
    pub released_late: AtomicU64,
    pub published: AtomicU64,
    pub publish_errors: AtomicU64,

    // Fan-out
    pub fanout_dispatches: AtomicU64,
    pub fanout_failures: AtomicU64,

    // Orchestrator
    pub snapshots_put: AtomicU64,
    pub deltas_fused: AtomicU64,
    pub deltas_dropped: AtomicU64,
    pub cas_conflicts: AtomicU64,
    pub throttled: AtomicU64,

    // Consumers
    pub consumer_processed: AtomicU64,
    pub consumer_filtered: AtomicU64,
    pub consumer_panics: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub raw_ingested: u64,
    pub dropped_no_route: u64,
    pub dropped_filtered: u64,
    pub canonical_emitted: u64,
    pub ingest_latency_ms_sum: u64,
    pub deduped: u64,
    pub buffered: u64,
    pub released_in_order: u64,
    pub released_late: u64,
    pub published: u64,
    pub publish_errors: u64,
    pub fanout_dispatches: u64,
    pub fanout_failures: u64,
    pub snapshots_put: u64,
    pub deltas_fused: u64,
    pub deltas_dropped: u64,
    pub cas_conflicts: u64,
    pub throttled: u64,
    pub consumer_processed: u64,
    pub consumer_filtered: u64,
    pub consumer_panics: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            raw_ingested: load(&self.raw_ingested),
            dropped_no_route: load(&self.dropped_no_route),
            dropped_filtered: load(&self.dropped_filtered),
            canonical_emitted: load(&self.canonical_emitted),
            ingest_latency_ms_sum: load(&self.ingest_latency_ms_sum),
            deduped: load(&self.deduped),
            buffered: load(&self.buffered),
            released_in_order: load(&self.released_in_order),
            released_late: load(&self.released_late),
            published: load(&self.published),
            publish_errors: load(&self.publish_errors),
            fanout_dispatches: load(&self.fanout_dispatches),
            fanout_failures: load(&self.fanout_failures),
            snapshots_put: load(&self.snapshots_put),
            deltas_fused: load(&self.deltas_fused),
            deltas_dropped: load(&self.deltas_dropped),
            cas_conflicts: load(&self.cas_conflicts),
            throttled: load(&self.throttled),
            consumer_processed: load(&self.consumer_processed),
            consumer_filtered: load(&self.consumer_filtered),
            consumer_panics: load(&self.consumer_panics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.published);
        PipelineStats::incr(&stats.published);
        PipelineStats::add(&stats.deduped, 5);

        let snap = stats.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.deduped, 5);
        assert_eq!(snap.publish_errors, 0);
    }
}
