//! Fire-and-forget usage metrics.
//!
//! Reporting never sits on the critical path: sinks must not block, and a
//! dropped event is acceptable under load.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum MetricsEvent {
    SearchCompleted {
        cache_bytes: usize,
        records_searched: u64,
        elapsed_ms: u64,
        results_found: usize,
        is_first_search: bool,
        is_cache_limited: bool,
    },
    BuildCompleted {
        records_indexed: u64,
        records_skipped: u64,
        elapsed_ms: u64,
    },
    SyncApplied {
        mutations_applied: usize,
    },
}

pub trait MetricsSink: Send + Sync {
    fn report(&self, event: MetricsEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn report(&self, _event: MetricsEvent) {}
}
