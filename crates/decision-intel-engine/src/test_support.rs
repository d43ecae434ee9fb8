use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use decision_intel_core::{
    parse_rfc3339_utc, BaselineKey, CalibrationBin, CalibrationBucket, CausalAnalysis, DecisionId,
    DecisionTrace, FeedbackEntry, IndexedDecision, MetricSample, SearchScope,
};
use decision_intel_store::{
    CalibrationStore, CausalEdgeSink, DecisionIndexStore, FeedbackLedger, FeedbackUpsert,
    MetricStore, Series,
};
use time::{Duration, OffsetDateTime};

pub(crate) fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

pub(crate) fn start() -> OffsetDateTime {
    match parse_rfc3339_utc("2026-03-01T00:00:00Z") {
        Ok(value) => value,
        Err(err) => panic!("invalid fixture timestamp: {err}"),
    }
}

pub(crate) fn sample_at(tenant: &str, metric: &str, offset_secs: i64, value: f64) -> MetricSample {
    MetricSample {
        tenant_id: tenant.to_string(),
        entity_id: "router-1".to_string(),
        metric_name: metric.to_string(),
        timestamp: start() + Duration::seconds(offset_secs),
        value,
    }
}

/// Store double whose every call fails, as an unreachable backend would.
pub(crate) struct FailingStore;

fn unreachable_store<T>() -> Result<T> {
    Err(anyhow!("connection refused"))
}

impl MetricStore for FailingStore {
    fn append_sample(&self, _sample: &MetricSample) -> Result<bool> {
        unreachable_store()
    }

    fn recent_window(
        &self,
        _key: &BaselineKey,
        _before: OffsetDateTime,
        _limit: usize,
    ) -> Result<Series> {
        unreachable_store()
    }

    fn entity_series(
        &self,
        _tenant_id: &str,
        _entity_id: &str,
        _from: OffsetDateTime,
        _to: OffsetDateTime,
    ) -> Result<BTreeMap<String, Series>> {
        unreachable_store()
    }
}

impl DecisionIndexStore for FailingStore {
    fn insert_decision(&self, _trace: &DecisionTrace) -> Result<()> {
        unreachable_store()
    }

    fn decision(&self, _id: DecisionId) -> Result<Option<DecisionTrace>> {
        unreachable_store()
    }

    fn indexed_decisions(&self, _scope: &SearchScope) -> Result<Vec<IndexedDecision>> {
        unreachable_store()
    }
}

impl FeedbackLedger for FailingStore {
    fn upsert_feedback(&self, _entry: &FeedbackEntry) -> Result<FeedbackUpsert> {
        unreachable_store()
    }

    fn feedback_for(&self, _decision_id: DecisionId) -> Result<Vec<FeedbackEntry>> {
        unreachable_store()
    }
}

impl CalibrationStore for FailingStore {
    fn calibration_bin(&self, _bucket: CalibrationBucket) -> Result<Option<CalibrationBin>> {
        unreachable_store()
    }

    fn apply_rating_change(
        &self,
        _bucket: CalibrationBucket,
        _previous: Option<u8>,
        _current: Option<u8>,
    ) -> Result<CalibrationBin> {
        unreachable_store()
    }

    fn calibration_bins(&self) -> Result<Vec<CalibrationBin>> {
        unreachable_store()
    }
}

impl CausalEdgeSink for FailingStore {
    fn record_causal_edges(
        &self,
        _tenant_id: &str,
        _analysis: &CausalAnalysis,
        _analyzed_at: OffsetDateTime,
    ) -> Result<usize> {
        unreachable_store()
    }
}
