#![forbid(unsafe_code)]
//! Storage boundary of the decision core. Implementations surface
//! infrastructure failures as `anyhow` errors; callers degrade on them.

use std::collections::BTreeMap;

use anyhow::Result;
use decision_intel_core::{
    BaselineKey, CalibrationBin, CalibrationBucket, CausalAnalysis, DecisionId, DecisionTrace,
    EvidenceSignature, FeedbackEntry, IndexedDecision, MetricSample, SearchScope,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Time-ordered `(timestamp, value)` pairs of one metric.
pub type Series = Vec<(OffsetDateTime, f64)>;

pub trait MetricStore: Send + Sync {
    /// Returns `false` when a sample with the same natural key already exists.
    #[allow(clippy::missing_errors_doc)]
    fn append_sample(&self, sample: &MetricSample) -> Result<bool>;

    /// Most recent `limit` samples strictly before `before`, oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn recent_window(&self, key: &BaselineKey, before: OffsetDateTime, limit: usize)
        -> Result<Series>;

    /// Every metric recorded for the entity in `[from, to]`, keyed by name.
    #[allow(clippy::missing_errors_doc)]
    fn entity_series(
        &self,
        tenant_id: &str,
        entity_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<BTreeMap<String, Series>>;
}

pub trait DecisionIndexStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn insert_decision(&self, trace: &DecisionTrace) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn decision(&self, id: DecisionId) -> Result<Option<DecisionTrace>>;

    /// Decisions visible in `scope` that carry an embedding.
    #[allow(clippy::missing_errors_doc)]
    fn indexed_decisions(&self, scope: &SearchScope) -> Result<Vec<IndexedDecision>>;
}

/// Result of a ledger upsert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackUpsert {
    pub entry: FeedbackEntry,
    /// Entry replaced by this write, if the operator had voted before.
    pub previous: Option<FeedbackEntry>,
    /// Recomputed aggregate over the ledger.
    pub feedback_score: i64,
    /// Evidence signature recorded with the decision.
    pub signature: EvidenceSignature,
}

pub trait FeedbackLedger: Send + Sync {
    /// Upserts keyed by `(decision_id, operator_id)` and recomputes the
    /// decision's aggregate score in the same unit of work.
    #[allow(clippy::missing_errors_doc)]
    fn upsert_feedback(&self, entry: &FeedbackEntry) -> Result<FeedbackUpsert>;

    #[allow(clippy::missing_errors_doc)]
    fn feedback_for(&self, decision_id: DecisionId) -> Result<Vec<FeedbackEntry>>;
}

pub trait CalibrationStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn calibration_bin(&self, bucket: CalibrationBucket) -> Result<Option<CalibrationBin>>;

    /// Applies one operator's rating change incrementally: `previous` is
    /// withdrawn and `current` is added, either may be absent.
    #[allow(clippy::missing_errors_doc)]
    fn apply_rating_change(
        &self,
        bucket: CalibrationBucket,
        previous: Option<u8>,
        current: Option<u8>,
    ) -> Result<CalibrationBin>;

    #[allow(clippy::missing_errors_doc)]
    fn calibration_bins(&self) -> Result<Vec<CalibrationBin>>;
}

pub trait CausalEdgeSink: Send + Sync {
    /// Persists the significant edges of an analysis for audit. Returns the
    /// number of rows written.
    #[allow(clippy::missing_errors_doc)]
    fn record_causal_edges(
        &self,
        tenant_id: &str,
        analysis: &CausalAnalysis,
        analyzed_at: OffsetDateTime,
    ) -> Result<usize>;
}
