use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-local counters shared by every engine component.
#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
pub struct EngineTelemetry {
    pub(crate) samples_ingested_total: AtomicU64,
    pub(crate) duplicate_samples_total: AtomicU64,
    pub(crate) invalid_samples_total: AtomicU64,
    pub(crate) anomalies_total: AtomicU64,
    pub(crate) insufficient_data_total: AtomicU64,
    pub(crate) late_samples_total: AtomicU64,
    pub(crate) store_unavailable_total: AtomicU64,
    pub(crate) analyses_dispatched_total: AtomicU64,
    pub(crate) analyses_shed_total: AtomicU64,
    pub(crate) analyses_timed_out_total: AtomicU64,
    pub(crate) analyses_completed_total: AtomicU64,
    pub(crate) causal_budget_exhausted_total: AtomicU64,
    pub(crate) embedding_failures_total: AtomicU64,
    pub(crate) feedback_recorded_total: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct EngineTelemetrySnapshot {
    pub samples_ingested_total: u64,
    pub duplicate_samples_total: u64,
    pub invalid_samples_total: u64,
    pub anomalies_total: u64,
    pub insufficient_data_total: u64,
    pub late_samples_total: u64,
    pub store_unavailable_total: u64,
    pub analyses_dispatched_total: u64,
    pub analyses_shed_total: u64,
    pub analyses_timed_out_total: u64,
    pub analyses_completed_total: u64,
    pub causal_budget_exhausted_total: u64,
    pub embedding_failures_total: u64,
    pub feedback_recorded_total: u64,
}

impl EngineTelemetry {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineTelemetrySnapshot {
        EngineTelemetrySnapshot {
            samples_ingested_total: self.samples_ingested_total.load(Ordering::Relaxed),
            duplicate_samples_total: self.duplicate_samples_total.load(Ordering::Relaxed),
            invalid_samples_total: self.invalid_samples_total.load(Ordering::Relaxed),
            anomalies_total: self.anomalies_total.load(Ordering::Relaxed),
            insufficient_data_total: self.insufficient_data_total.load(Ordering::Relaxed),
            late_samples_total: self.late_samples_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            analyses_dispatched_total: self.analyses_dispatched_total.load(Ordering::Relaxed),
            analyses_shed_total: self.analyses_shed_total.load(Ordering::Relaxed),
            analyses_timed_out_total: self.analyses_timed_out_total.load(Ordering::Relaxed),
            analyses_completed_total: self.analyses_completed_total.load(Ordering::Relaxed),
            causal_budget_exhausted_total: self
                .causal_budget_exhausted_total
                .load(Ordering::Relaxed),
            embedding_failures_total: self.embedding_failures_total.load(Ordering::Relaxed),
            feedback_recorded_total: self.feedback_recorded_total.load(Ordering::Relaxed),
        }
    }
}
