use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use decision_intel_core::{
    now_utc, rank_candidates, DecisionId, DecisionRuleset, DecisionTrace, Embedder,
    FeedbackEntry, FeedbackKind, SearchRequest, SearchScope, SimilarDecision,
};
use decision_intel_store::{DecisionIndexStore, FeedbackLedger, FeedbackUpsert};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::telemetry::EngineTelemetry;

/// A decision as submitted for recording, before it has an id or embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDecision {
    pub tenant_id: String,
    pub context: Value,
    /// Evidence signature at decision time; drives the calibration bucket
    /// that later ratings of this decision feed.
    #[serde(default)]
    pub memory_hit_count: u32,
    #[serde(default)]
    pub causal_evidence_count: u32,
}

pub struct DecisionMemoryIndex {
    decisions: Arc<dyn DecisionIndexStore>,
    ledger: Arc<dyn FeedbackLedger>,
    embedder: Arc<dyn Embedder>,
    ruleset: Arc<DecisionRuleset>,
    telemetry: Arc<EngineTelemetry>,
}

impl DecisionMemoryIndex {
    #[must_use]
    pub fn new(
        decisions: Arc<dyn DecisionIndexStore>,
        ledger: Arc<dyn FeedbackLedger>,
        embedder: Arc<dyn Embedder>,
        ruleset: Arc<DecisionRuleset>,
        telemetry: Arc<EngineTelemetry>,
    ) -> Self {
        Self {
            decisions,
            ledger,
            embedder,
            ruleset,
            telemetry,
        }
    }

    /// Records a decision. A context that cannot be embedded is still stored
    /// but stays out of search results.
    #[allow(clippy::missing_errors_doc)]
    pub fn index(&self, decision: NewDecision) -> Result<DecisionTrace> {
        let tenant_id = decision.tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(anyhow!("tenant_id MUST NOT be empty"));
        }

        let embedding = match self.embedder.embed(&decision.context) {
            Ok(vector) => Some(vector),
            Err(err) => {
                EngineTelemetry::bump(&self.telemetry.embedding_failures_total);
                warn!(tenant_id, error = %err, "decision excluded from similarity index");
                None
            }
        };

        let trace = DecisionTrace {
            id: DecisionId::new(),
            tenant_id: tenant_id.to_string(),
            embedding,
            context: decision.context,
            feedback_score: 0,
            memory_hit_count: decision.memory_hit_count,
            causal_evidence_count: decision.causal_evidence_count,
            created_at: now_utc(),
        };
        self.decisions.insert_decision(&trace)?;
        info!(
            decision_id = %trace.id,
            tenant_id = %trace.tenant_id,
            indexed = trace.embedding.is_some(),
            "decision recorded"
        );
        Ok(trace)
    }

    /// Request with ruleset defaults for the floor and the result limit.
    #[must_use]
    pub fn default_request(&self, scope: SearchScope) -> SearchRequest {
        SearchRequest {
            scope,
            min_similarity: self.ruleset.default_min_similarity,
            limit: self.ruleset.default_search_limit,
        }
    }

    /// Decisions similar to `query`, re-ranked by bounded feedback boost.
    /// A query without embeddable features matches nothing.
    #[allow(clippy::missing_errors_doc)]
    pub fn search(&self, query: &Value, request: &SearchRequest) -> Result<Vec<SimilarDecision>> {
        let embedding = match self.embedder.embed(query) {
            Ok(vector) => vector,
            Err(err) => {
                debug!(error = %err, "query has no usable embedding");
                return Ok(Vec::new());
            }
        };

        let candidates = self
            .decisions
            .indexed_decisions(&request.scope)
            .context("failed to load indexed decisions")?;
        let scanned = candidates.len();
        let ranked = rank_candidates(&embedding, candidates, request, &self.ruleset);
        debug!(scanned, returned = ranked.len(), "similarity search finished");
        Ok(ranked)
    }

    /// Upserts one operator's feedback; a repeat by the same operator
    /// replaces the earlier entry.
    #[allow(clippy::missing_errors_doc)]
    pub fn record_feedback(
        &self,
        decision_id: DecisionId,
        operator_id: &str,
        kind: FeedbackKind,
    ) -> Result<FeedbackUpsert> {
        let entry = FeedbackEntry::new(decision_id, operator_id, kind, now_utc())
            .map_err(|err| anyhow!("invalid feedback: {err}"))?;
        let upsert = self.ledger.upsert_feedback(&entry)?;
        EngineTelemetry::bump(&self.telemetry.feedback_recorded_total);
        info!(
            decision_id = %decision_id,
            operator_id = %entry.operator_id,
            replaced = upsert.previous.is_some(),
            feedback_score = upsert.feedback_score,
            "feedback recorded"
        );
        Ok(upsert)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn decision(&self, decision_id: DecisionId) -> Result<Option<DecisionTrace>> {
        self.decisions.decision(decision_id)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn feedback_for(&self, decision_id: DecisionId) -> Result<Vec<FeedbackEntry>> {
        self.ledger.feedback_for(decision_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{must, FailingStore};
    use decision_intel_core::FeatureHashEmbedder;
    use decision_intel_store_sqlite::SqliteDecisionStore;
    use serde_json::json;
    use std::path::Path;

    fn fixture_index() -> (DecisionMemoryIndex, Arc<EngineTelemetry>) {
        let store = Arc::new(must(SqliteDecisionStore::open(Path::new(":memory:"))));
        must(store.migrate());
        let telemetry = Arc::new(EngineTelemetry::default());
        let index = DecisionMemoryIndex::new(
            store.clone(),
            store,
            Arc::new(FeatureHashEmbedder::default()),
            Arc::new(DecisionRuleset::v1()),
            telemetry.clone(),
        );
        (index, telemetry)
    }

    fn record(index: &DecisionMemoryIndex, tenant: &str, context: Value) -> DecisionTrace {
        must(index.index(NewDecision {
            tenant_id: tenant.to_string(),
            context,
            memory_hit_count: 1,
            causal_evidence_count: 0,
        }))
    }

    #[test]
    fn unembeddable_decision_is_stored_but_never_returned() {
        let (index, telemetry) = fixture_index();
        let blank = record(&index, "tenant-a", json!({}));
        assert_eq!(blank.embedding, None);
        assert_eq!(telemetry.snapshot().embedding_failures_total, 1);
        assert!(must(index.decision(blank.id)).is_some());

        let results = must(index.search(
            &json!({"action": "reroute"}),
            &SearchRequest {
                scope: SearchScope::Tenant("tenant-a".to_string()),
                min_similarity: -1.0,
                limit: 10,
            },
        ));
        assert!(results.iter().all(|result| result.decision_id != blank.id));
    }

    #[test]
    fn search_is_tenant_scoped_unless_operator_mode() {
        let (index, _) = fixture_index();
        let context = json!({"metric": "latency", "action": "reroute traffic"});
        let own = record(&index, "tenant-a", context.clone());
        let foreign = record(&index, "tenant-b", context.clone());

        let request = index.default_request(SearchScope::Tenant("tenant-a".to_string()));
        let scoped = must(index.search(&context, &request));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].decision_id, own.id);
        assert!((scoped[0].raw_similarity - 1.0).abs() < 1e-6);

        let operator = must(index.search(&context, &index.default_request(SearchScope::Operator)));
        let ids = operator.iter().map(|result| result.decision_id).collect::<Vec<_>>();
        assert!(ids.contains(&own.id) && ids.contains(&foreign.id));
    }

    #[test]
    fn repeat_vote_replaces_and_shifts_ranking_within_cap() {
        let (index, _) = fixture_index();
        let context = json!({"metric": "latency", "action": "reroute traffic"});
        let decision = record(&index, "tenant-a", context.clone());

        let first = must(index.record_feedback(decision.id, "op-1", FeedbackKind::Vote(1)));
        assert_eq!(first.feedback_score, 1);
        let second = must(index.record_feedback(decision.id, "op-1", FeedbackKind::Vote(-1)));
        assert_eq!(second.feedback_score, -1);
        assert_eq!(must(index.feedback_for(decision.id)).len(), 1);

        let request = index.default_request(SearchScope::Tenant("tenant-a".to_string()));
        let results = must(index.search(&context, &request));
        let delta = results[0].adjusted_similarity - results[0].raw_similarity;
        assert!(delta < 0.0 && delta >= -0.2);
    }

    #[test]
    fn invalid_feedback_is_rejected_before_the_ledger() {
        let (index, telemetry) = fixture_index();
        let decision = record(&index, "tenant-a", json!({"action": "restart"}));
        assert!(index.record_feedback(decision.id, "op-1", FeedbackKind::Rating(9)).is_err());
        assert!(index.record_feedback(decision.id, " ", FeedbackKind::Vote(1)).is_err());
        assert_eq!(telemetry.snapshot().feedback_recorded_total, 0);
    }

    #[test]
    fn unavailable_store_surfaces_as_error() {
        let index = DecisionMemoryIndex::new(
            Arc::new(FailingStore),
            Arc::new(FailingStore),
            Arc::new(FeatureHashEmbedder::default()),
            Arc::new(DecisionRuleset::v1()),
            Arc::new(EngineTelemetry::default()),
        );
        let request = index.default_request(SearchScope::Operator);
        assert!(index.search(&json!({"action": "restart"}), &request).is_err());
    }
}
