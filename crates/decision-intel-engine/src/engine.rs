use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use decision_intel_core::{
    memory_hit_count, AnomalyResult, CalibrationBin, CausalAnalysis, CausalStatus,
    ConfidenceAssessment, DecisionError, DecisionId, DecisionRuleset, DecisionTrace, Embedder,
    EvidenceSignature, FeedbackKind, MetricSample, RawMetricSample, SampleRejection,
    SearchRequest, SearchScope, SimilarDecision,
};
use decision_intel_store::{
    CalibrationStore, CausalEdgeSink, DecisionIndexStore, FeedbackLedger, FeedbackUpsert,
    MetricStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::analyzer::CausalAnalyzer;
use crate::calibrator::ConfidenceCalibrator;
use crate::detector::AnomalyDetector;
use crate::memory_index::{DecisionMemoryIndex, NewDecision};
use crate::telemetry::{EngineTelemetry, EngineTelemetrySnapshot};

pub const RECOMMENDATION_CONTRACT_VERSION: &str = "recommendation.v1";

/// Store handles injected into the engine.
#[derive(Clone)]
pub struct EngineStores {
    pub metrics: Arc<dyn MetricStore>,
    pub decisions: Arc<dyn DecisionIndexStore>,
    pub ledger: Arc<dyn FeedbackLedger>,
    pub calibration: Arc<dyn CalibrationStore>,
    pub edges: Option<Arc<dyn CausalEdgeSink>>,
}

impl EngineStores {
    /// Uses one backend for every store role.
    #[must_use]
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: MetricStore
            + DecisionIndexStore
            + FeedbackLedger
            + CalibrationStore
            + CausalEdgeSink
            + 'static,
    {
        Self {
            metrics: store.clone(),
            decisions: store.clone(),
            ledger: store.clone(),
            calibration: store.clone(),
            edges: Some(store),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Evaluated,
    Duplicate,
    Rejected,
    /// The sample could not be persisted; it was still scored.
    StoreUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<MetricSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<SampleRejection>,
}

impl IngestReport {
    fn rejected(rejection: SampleRejection) -> Self {
        Self {
            status: IngestStatus::Rejected,
            sample: None,
            anomaly: None,
            rejection: Some(rejection),
        }
    }

    /// Analysis request for an anomalous sample.
    #[must_use]
    pub fn trigger(&self) -> Option<AnalysisTrigger> {
        let sample = self.sample.as_ref()?;
        let anomaly = self.anomaly.as_ref()?;
        anomaly
            .is_anomaly
            .then(|| AnalysisTrigger::from_anomaly(sample, anomaly))
    }
}

/// Work item for causal analysis plus memory search on one anomaly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisTrigger {
    pub tenant_id: String,
    pub entity_id: String,
    pub metric_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    /// Query for the decision memory search.
    pub context: Value,
}

impl AnalysisTrigger {
    #[must_use]
    pub fn from_anomaly(sample: &MetricSample, anomaly: &AnomalyResult) -> Self {
        let direction = match anomaly.z_score {
            Some(z) if z < 0.0 => "drop",
            Some(_) => "spike",
            None => "shift",
        };
        Self {
            tenant_id: sample.tenant_id.clone(),
            entity_id: sample.entity_id.clone(),
            metric_name: sample.metric_name.clone(),
            as_of: sample.timestamp,
            context: json!({
                "entity_id": sample.entity_id,
                "metric_name": sample.metric_name,
                "anomaly": format!("{} {direction}", sample.metric_name),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub contract_version: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub effect_metric: String,
    pub confidence: ConfidenceAssessment,
    pub causal: CausalAnalysis,
    pub similar_decisions: Vec<SimilarDecision>,
    /// Enrichment steps that were skipped, e.g. `memory_search`.
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackReceipt {
    pub decision_id: DecisionId,
    pub operator_id: String,
    pub feedback_score: i64,
    pub replaced: bool,
    /// Bin touched by a rating; `None` for votes or when the calibration
    /// write failed.
    pub calibration: Option<CalibrationBin>,
}

/// Explicitly constructed decision pipeline. Clones share every component.
#[derive(Clone)]
pub struct DecisionEngine {
    metrics: Arc<dyn MetricStore>,
    detector: Arc<AnomalyDetector>,
    analyzer: Arc<CausalAnalyzer>,
    memory: Arc<DecisionMemoryIndex>,
    calibrator: Arc<ConfidenceCalibrator>,
    ruleset: Arc<DecisionRuleset>,
    telemetry: Arc<EngineTelemetry>,
    analysis_timeout: Duration,
}

impl DecisionEngine {
    /// # Errors
    /// Returns [`DecisionError::Configuration`] when the ruleset is invalid.
    pub fn new(
        stores: EngineStores,
        ruleset: DecisionRuleset,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, DecisionError> {
        ruleset.validate()?;
        let ruleset = Arc::new(ruleset);
        let telemetry = Arc::new(EngineTelemetry::default());
        // Headroom over the causal budget so partial causal results arrive
        // before the outer timeout fires.
        let analysis_timeout = Duration::from_millis(ruleset.causal_budget_ms.saturating_mul(2))
            .max(Duration::from_millis(500));

        Ok(Self {
            metrics: stores.metrics.clone(),
            detector: Arc::new(AnomalyDetector::new(
                stores.metrics.clone(),
                ruleset.clone(),
                telemetry.clone(),
            )),
            analyzer: Arc::new(CausalAnalyzer::new(
                stores.metrics,
                stores.edges,
                ruleset.clone(),
                telemetry.clone(),
            )),
            memory: Arc::new(DecisionMemoryIndex::new(
                stores.decisions,
                stores.ledger,
                embedder,
                ruleset.clone(),
                telemetry.clone(),
            )),
            calibrator: Arc::new(ConfidenceCalibrator::new(
                stores.calibration,
                ruleset.clone(),
                telemetry.clone(),
            )),
            ruleset,
            telemetry,
            analysis_timeout,
        })
    }

    #[must_use]
    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = timeout;
        self
    }

    #[must_use]
    pub fn ruleset(&self) -> &DecisionRuleset {
        &self.ruleset
    }

    #[must_use]
    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    #[must_use]
    pub fn analyzer(&self) -> &CausalAnalyzer {
        &self.analyzer
    }

    #[must_use]
    pub fn memory(&self) -> &DecisionMemoryIndex {
        &self.memory
    }

    #[must_use]
    pub fn calibrator(&self) -> &ConfidenceCalibrator {
        &self.calibrator
    }

    #[must_use]
    pub fn telemetry(&self) -> EngineTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub(crate) fn telemetry_handle(&self) -> &Arc<EngineTelemetry> {
        &self.telemetry
    }

    /// Validates, stores and scores one wire sample. Never fails: problems
    /// are reported in the returned status.
    pub fn ingest(&self, raw: &RawMetricSample) -> IngestReport {
        let sample = match raw.validate() {
            Ok(sample) => sample,
            Err(rejection) => {
                EngineTelemetry::bump(&self.telemetry.invalid_samples_total);
                debug!(code = rejection.code(), error = %rejection, "sample rejected");
                return IngestReport::rejected(rejection);
            }
        };
        self.ingest_sample(sample)
    }

    pub fn ingest_sample(&self, sample: MetricSample) -> IngestReport {
        let status = match self.metrics.append_sample(&sample) {
            Ok(true) => IngestStatus::Evaluated,
            Ok(false) => {
                EngineTelemetry::bump(&self.telemetry.duplicate_samples_total);
                debug!(
                    key = %sample.key(),
                    timestamp = %sample.timestamp,
                    "duplicate sample ignored"
                );
                return IngestReport {
                    status: IngestStatus::Duplicate,
                    sample: Some(sample),
                    anomaly: None,
                    rejection: None,
                };
            }
            Err(err) => {
                EngineTelemetry::bump(&self.telemetry.store_unavailable_total);
                warn!(key = %sample.key(), error = %err, "failed to persist sample");
                IngestStatus::StoreUnavailable
            }
        };

        EngineTelemetry::bump(&self.telemetry.samples_ingested_total);
        let anomaly = self.detector.evaluate(&sample);
        IngestReport {
            status,
            sample: Some(sample),
            anomaly: Some(anomaly),
            rejection: None,
        }
    }

    /// Runs causal analysis and memory search concurrently on the blocking
    /// pool, then calibrates confidence from both.
    #[allow(clippy::too_many_lines)]
    pub async fn analyze(&self, trigger: AnalysisTrigger) -> Recommendation {
        EngineTelemetry::bump(&self.telemetry.analyses_dispatched_total);
        let mut degraded = Vec::new();

        let analyzer = Arc::clone(&self.analyzer);
        let causal_trigger = trigger.clone();
        let causal_task = tokio::task::spawn_blocking(move || {
            analyzer.find_causes(
                &causal_trigger.tenant_id,
                &causal_trigger.entity_id,
                &causal_trigger.metric_name,
                causal_trigger.as_of,
            )
        });

        let memory = Arc::clone(&self.memory);
        let request = memory.default_request(SearchScope::Tenant(trigger.tenant_id.clone()));
        let query = trigger.context.clone();
        let memory_task = tokio::task::spawn_blocking(move || memory.search(&query, &request));

        let (causal, similar) = tokio::join!(
            tokio::time::timeout(self.analysis_timeout, causal_task),
            tokio::time::timeout(self.analysis_timeout, memory_task),
        );

        let causal = match causal {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(err)) => {
                warn!(entity_id = %trigger.entity_id, error = %err, "causal analysis task failed");
                CausalAnalysis::empty(
                    &trigger.entity_id,
                    &trigger.metric_name,
                    CausalStatus::StoreUnavailable,
                )
            }
            Err(_) => {
                EngineTelemetry::bump(&self.telemetry.analyses_timed_out_total);
                warn!(
                    entity_id = %trigger.entity_id,
                    "causal analysis exceeded the analysis timeout"
                );
                degraded.push("causal_analysis".to_string());
                CausalAnalysis::empty(
                    &trigger.entity_id,
                    &trigger.metric_name,
                    CausalStatus::TimedOut,
                )
            }
        };
        if causal.status == CausalStatus::StoreUnavailable {
            degraded.push("causal_analysis".to_string());
        }

        let similar = match similar {
            Ok(Ok(Ok(results))) => results,
            Ok(Ok(Err(err))) => {
                EngineTelemetry::bump(&self.telemetry.store_unavailable_total);
                warn!(tenant_id = %trigger.tenant_id, error = %err, "memory search unavailable");
                degraded.push("memory_search".to_string());
                Vec::new()
            }
            Ok(Err(err)) => {
                warn!(tenant_id = %trigger.tenant_id, error = %err, "memory search task failed");
                degraded.push("memory_search".to_string());
                Vec::new()
            }
            Err(_) => {
                EngineTelemetry::bump(&self.telemetry.analyses_timed_out_total);
                warn!(
                    tenant_id = %trigger.tenant_id,
                    "memory search exceeded the analysis timeout"
                );
                degraded.push("memory_search".to_string());
                Vec::new()
            }
        };

        let signature = EvidenceSignature::new(
            memory_hit_count(&similar, self.ruleset.memory_hit_similarity),
            u32::try_from(causal.causal_evidence_count(self.ruleset.significance_level))
                .unwrap_or(u32::MAX),
        );

        let calibrator = Arc::clone(&self.calibrator);
        let confidence = match tokio::time::timeout(
            self.analysis_timeout,
            tokio::task::spawn_blocking(move || calibrator.assess(signature)),
        )
        .await
        {
            Ok(Ok(assessment)) => assessment,
            _ => {
                warn!(tenant_id = %trigger.tenant_id, "calibration lookup failed; using heuristic");
                degraded.push("calibration".to_string());
                decision_intel_core::calibrate(signature, None, &self.ruleset)
            }
        };

        EngineTelemetry::bump(&self.telemetry.analyses_completed_total);
        info!(
            tenant_id = %trigger.tenant_id,
            entity_id = %trigger.entity_id,
            effect_metric = %trigger.metric_name,
            confidence = confidence.confidence,
            source = ?confidence.source,
            memory_hits = signature.memory_hit_count,
            causal_edges = signature.causal_evidence_count,
            "recommendation ready"
        );

        Recommendation {
            contract_version: RECOMMENDATION_CONTRACT_VERSION.to_string(),
            tenant_id: trigger.tenant_id,
            entity_id: trigger.entity_id,
            effect_metric: trigger.metric_name,
            confidence,
            causal,
            similar_decisions: similar,
            degraded,
        }
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn record_decision(&self, decision: NewDecision) -> Result<DecisionTrace> {
        self.memory.index(decision)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn search(&self, query: &Value, request: &SearchRequest) -> Result<Vec<SimilarDecision>> {
        self.memory.search(query, request)
    }

    /// Records feedback in the ledger, then folds any rating change into
    /// the calibration bin. A failed bin update is logged and left for
    /// calibration replay.
    #[allow(clippy::missing_errors_doc)]
    pub fn record_feedback(
        &self,
        decision_id: DecisionId,
        operator_id: &str,
        kind: FeedbackKind,
    ) -> Result<FeedbackReceipt> {
        let upsert: FeedbackUpsert = self.memory.record_feedback(decision_id, operator_id, kind)?;
        let calibration = match self.calibrator.record_rating(&upsert) {
            Ok(bin) => bin,
            Err(err) => {
                EngineTelemetry::bump(&self.telemetry.store_unavailable_total);
                warn!(decision_id = %decision_id, error = %err, "calibration bin not updated");
                None
            }
        };

        Ok(FeedbackReceipt {
            decision_id,
            operator_id: upsert.entry.operator_id,
            feedback_score: upsert.feedback_score,
            replaced: upsert.previous.is_some(),
            calibration,
        })
    }

    #[must_use]
    pub fn confidence(&self, signature: EvidenceSignature) -> ConfidenceAssessment {
        self.calibrator.assess(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{must, start, FailingStore};
    use decision_intel_core::{ConfidenceSource, FeatureHashEmbedder};
    use decision_intel_store_sqlite::SqliteDecisionStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::path::Path;
    use time::format_description::well_known::Rfc3339;

    fn engine_with_store() -> (DecisionEngine, Arc<SqliteDecisionStore>) {
        let store = Arc::new(must(SqliteDecisionStore::open(Path::new(":memory:"))));
        must(store.migrate());
        let engine = match DecisionEngine::new(
            EngineStores::shared(store.clone()),
            DecisionRuleset::v1(),
            Arc::new(FeatureHashEmbedder::default()),
        ) {
            Ok(engine) => engine,
            Err(err) => panic!("engine construction failed: {err}"),
        };
        (engine, store)
    }

    fn raw(metric: &str, offset_secs: i64, value: Value) -> RawMetricSample {
        let timestamp = (start() + time::Duration::seconds(offset_secs))
            .format(&Rfc3339)
            .unwrap_or_default();
        RawMetricSample {
            tenant_id: Some("tenant-a".to_string()),
            entity_id: Some("router-1".to_string()),
            metric_name: Some(metric.to_string()),
            value: Some(value),
            timestamp: Some(timestamp),
        }
    }

    #[test]
    fn replayed_sample_is_reported_duplicate_and_not_rescored() {
        let (engine, store) = engine_with_store();
        let sample = raw("throughput", 0, json!(42.0));

        assert_eq!(engine.ingest(&sample).status, IngestStatus::Evaluated);
        let replay = engine.ingest(&sample);
        assert_eq!(replay.status, IngestStatus::Duplicate);
        assert_eq!(replay.anomaly, None);

        let key = match sample.validate() {
            Ok(sample) => sample.key(),
            Err(err) => panic!("fixture rejected: {err}"),
        };
        assert_eq!(must(store.count_samples(&key)), 1);
        let telemetry = engine.telemetry();
        assert_eq!(telemetry.samples_ingested_total, 1);
        assert_eq!(telemetry.duplicate_samples_total, 1);
    }

    #[test]
    fn malformed_samples_are_rejected_with_typed_codes() {
        let (engine, _) = engine_with_store();
        let text = engine.ingest(&raw("throughput", 0, json!("42")));
        assert_eq!(text.status, IngestStatus::Rejected);
        assert_eq!(text.rejection.as_ref().map(SampleRejection::code), Some("non_numeric_value"));

        let mut missing = raw("throughput", 0, json!(1.0));
        missing.timestamp = None;
        assert_eq!(
            engine.ingest(&missing).rejection.as_ref().map(SampleRejection::code),
            Some("missing_field")
        );
        assert_eq!(engine.telemetry().invalid_samples_total, 2);
    }

    #[test]
    fn far_future_sample_is_rejected_before_touching_the_baseline() {
        let (engine, _) = engine_with_store();
        for offset in 0..6_i64 {
            let report = engine.ingest(&raw("throughput", offset, json!(50.0)));
            assert_eq!(report.status, IngestStatus::Evaluated);
        }

        let mut far_future = raw("throughput", 0, json!(50.0));
        far_future.timestamp = Some("2300-01-01T00:00:00Z".to_string());
        let report = engine.ingest(&far_future);
        assert_eq!(report.status, IngestStatus::Rejected);
        assert_eq!(report.anomaly, None);
        assert_eq!(
            report.rejection.as_ref().map(SampleRejection::code),
            Some("out_of_range_timestamp")
        );

        let next = raw("throughput", 9, json!(50.0));
        let key = match next.validate() {
            Ok(sample) => sample.key(),
            Err(err) => panic!("fixture rejected: {err}"),
        };
        let count = |engine: &DecisionEngine| {
            engine
                .detector()
                .cache()
                .get(&key)
                .map(|baseline| baseline.sample_count)
        };
        assert_eq!(count(&engine), Some(6));
        assert_eq!(engine.ingest(&next).status, IngestStatus::Evaluated);
        assert_eq!(count(&engine), Some(7));

        let telemetry = engine.telemetry();
        assert_eq!(telemetry.invalid_samples_total, 1);
        assert_eq!(telemetry.store_unavailable_total, 0);
        assert_eq!(telemetry.late_samples_total, 0);
    }

    #[test]
    fn anomalous_sample_yields_trigger() {
        let (engine, _) = engine_with_store();
        for (offset, value) in [45.0, 55.0, 45.0, 55.0, 50.0].into_iter().enumerate() {
            let offset = i64::try_from(offset).unwrap_or(0);
            let report = engine.ingest(&raw("throughput", offset, json!(value)));
            assert!(report.trigger().is_none());
        }
        let report = engine.ingest(&raw("throughput", 10, json!(85.0)));
        let trigger = match report.trigger() {
            Some(trigger) => trigger,
            None => panic!("expected anomaly trigger, got {report:?}"),
        };
        assert_eq!(trigger.metric_name, "throughput");
        assert_eq!(trigger.context["anomaly"], json!("throughput spike"));
    }

    #[test]
    fn unavailable_store_never_stalls_ingestion() {
        let engine = match DecisionEngine::new(
            EngineStores::shared(Arc::new(FailingStore)),
            DecisionRuleset::v1(),
            Arc::new(FeatureHashEmbedder::default()),
        ) {
            Ok(engine) => engine,
            Err(err) => panic!("engine construction failed: {err}"),
        };
        let report = engine.ingest(&raw("throughput", 0, json!(1.0)));
        assert_eq!(report.status, IngestStatus::StoreUnavailable);
        assert_eq!(report.anomaly.map(|anomaly| anomaly.insufficient_data), Some(true));
    }

    #[test]
    fn invalid_ruleset_is_refused() {
        let mut ruleset = DecisionRuleset::v1();
        ruleset.analysis_workers = 0;
        let result = DecisionEngine::new(
            EngineStores::shared(Arc::new(FailingStore)),
            ruleset,
            Arc::new(FeatureHashEmbedder::default()),
        );
        assert!(matches!(result, Err(DecisionError::Configuration(_))));
    }

    #[test]
    fn ratings_feed_the_recorded_signature_bin() {
        let (engine, store) = engine_with_store();
        let decision = must(engine.record_decision(NewDecision {
            tenant_id: "tenant-a".to_string(),
            context: json!({"action": "reroute traffic"}),
            memory_hit_count: 3,
            causal_evidence_count: 1,
        }));

        let first = must(engine.record_feedback(decision.id, "op-1", FeedbackKind::Rating(4)));
        assert_eq!(first.feedback_score, 1);
        assert_eq!(first.calibration.map(|bin| bin.sample_count), Some(1));

        let second = must(engine.record_feedback(decision.id, "op-1", FeedbackKind::Rating(2)));
        assert!(second.replaced);
        assert_eq!(second.feedback_score, -1);
        assert_eq!(
            second.calibration.map(|bin| (bin.sample_count, bin.running_avg_rating)),
            Some((1, 2.0))
        );

        assert!(must(store.check_calibration(engine.ruleset())).healthy);
    }

    #[tokio::test]
    async fn anomaly_analysis_combines_causes_and_memory() {
        let (engine, _) = engine_with_store();
        let mut rng = StdRng::seed_from_u64(29);
        let mut loss = Vec::new();
        for t in 0..160_i64 {
            let current = rng.gen_range(0.0..1.0);
            loss.push(current);
            let index = usize::try_from(t).unwrap_or(0);
            let driven = if index >= 2 { 15.0 * loss[index - 2] } else { 0.0 };
            let latency = 20.0 + driven + rng.gen_range(-0.5..0.5);
            engine.ingest(&raw("packet_loss", t * 60, json!(current)));
            engine.ingest(&raw("latency", t * 60, json!(latency)));
        }

        let trigger = AnalysisTrigger {
            tenant_id: "tenant-a".to_string(),
            entity_id: "router-1".to_string(),
            metric_name: "latency".to_string(),
            as_of: start() + time::Duration::minutes(160),
            context: json!({"metric_name": "latency", "anomaly": "latency spike"}),
        };
        for _ in 0..3 {
            must(engine.record_decision(NewDecision {
                tenant_id: "tenant-a".to_string(),
                context: trigger.context.clone(),
                memory_hit_count: 0,
                causal_evidence_count: 0,
            }));
        }

        let recommendation = engine.analyze(trigger).await;
        assert_eq!(recommendation.contract_version, RECOMMENDATION_CONTRACT_VERSION);
        assert_eq!(recommendation.causal.status, CausalStatus::Complete);
        assert!(!recommendation.causal.edges.is_empty());
        assert_eq!(recommendation.similar_decisions.len(), 3);
        assert_eq!(recommendation.confidence.signature.memory_hit_count, 3);
        assert_eq!(recommendation.confidence.source, ConfidenceSource::Heuristic);
        assert!(recommendation.confidence.confidence >= 0.7);
        assert!(recommendation.degraded.is_empty());
    }

    #[tokio::test]
    async fn short_history_relies_on_memory_hits_only() {
        let (engine, _) = engine_with_store();
        for t in 0..40_i64 {
            let wobble = f64::from(u8::try_from(t % 7).unwrap_or(0));
            engine.ingest(&raw("latency", t * 60, json!(20.0 + wobble)));
            engine.ingest(&raw("packet_loss", t * 60, json!(0.1)));
        }
        let trigger = AnalysisTrigger {
            tenant_id: "tenant-a".to_string(),
            entity_id: "router-1".to_string(),
            metric_name: "latency".to_string(),
            as_of: start() + time::Duration::minutes(40),
            context: json!({"metric_name": "latency"}),
        };

        let recommendation = engine.analyze(trigger).await;
        assert_eq!(recommendation.causal.status, CausalStatus::InsufficientStatisticalPower);
        assert_eq!(recommendation.confidence.signature.causal_evidence_count, 0);
        assert!((recommendation.confidence.confidence - 0.3).abs() < 1e-12);
        assert!(recommendation.confidence.low_confidence);
    }

    #[tokio::test]
    async fn unavailable_stores_degrade_the_recommendation() {
        let engine = match DecisionEngine::new(
            EngineStores::shared(Arc::new(FailingStore)),
            DecisionRuleset::v1(),
            Arc::new(FeatureHashEmbedder::default()),
        ) {
            Ok(engine) => engine,
            Err(err) => panic!("engine construction failed: {err}"),
        };
        let trigger = AnalysisTrigger {
            tenant_id: "tenant-a".to_string(),
            entity_id: "router-1".to_string(),
            metric_name: "latency".to_string(),
            as_of: start(),
            context: json!({"metric_name": "latency"}),
        };

        let recommendation = engine.analyze(trigger).await;
        assert_eq!(recommendation.causal.status, CausalStatus::StoreUnavailable);
        assert!(recommendation.similar_decisions.is_empty());
        assert!(recommendation.degraded.contains(&"memory_search".to_string()));
        assert!(recommendation.degraded.contains(&"causal_analysis".to_string()));
        assert_eq!(recommendation.confidence.source, ConfidenceSource::Heuristic);
    }
}
