use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use decision_intel_core::{
    duration_from_secs, find_causes, CausalAnalysis, CausalStatus, DecisionRuleset,
};
use decision_intel_store::{CausalEdgeSink, MetricStore};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::telemetry::EngineTelemetry;

/// Loads an entity's metrics for the analysis window and runs the causal
/// search under the per-entity time budget.
pub struct CausalAnalyzer {
    metrics: Arc<dyn MetricStore>,
    edges: Option<Arc<dyn CausalEdgeSink>>,
    ruleset: Arc<DecisionRuleset>,
    telemetry: Arc<EngineTelemetry>,
}

impl CausalAnalyzer {
    #[must_use]
    pub fn new(
        metrics: Arc<dyn MetricStore>,
        edges: Option<Arc<dyn CausalEdgeSink>>,
        ruleset: Arc<DecisionRuleset>,
        telemetry: Arc<EngineTelemetry>,
    ) -> Self {
        Self {
            metrics,
            edges,
            ruleset,
            telemetry,
        }
    }

    #[must_use]
    pub fn budget(&self) -> StdDuration {
        StdDuration::from_millis(self.ruleset.causal_budget_ms)
    }

    /// Significant causes of `effect_metric` over the window ending at
    /// `as_of`, ascending by p-value.
    pub fn find_causes(
        &self,
        tenant_id: &str,
        entity_id: &str,
        effect_metric: &str,
        as_of: OffsetDateTime,
    ) -> CausalAnalysis {
        let started = Instant::now();
        let deadline = started + self.budget();
        let from = as_of - duration_from_secs(self.ruleset.causal_window_secs);

        let series = match self.metrics.entity_series(tenant_id, entity_id, from, as_of) {
            Ok(series) => series,
            Err(err) => {
                EngineTelemetry::bump(&self.telemetry.store_unavailable_total);
                warn!(
                    tenant_id,
                    entity_id,
                    effect_metric,
                    error = %err,
                    "metric store unavailable; causal analysis skipped"
                );
                return CausalAnalysis::empty(
                    entity_id,
                    effect_metric,
                    CausalStatus::StoreUnavailable,
                );
            }
        };

        let analysis = find_causes(
            entity_id,
            effect_metric,
            &series,
            &self.ruleset,
            Some(deadline),
        );
        if analysis.status == CausalStatus::TimedOut {
            EngineTelemetry::bump(&self.telemetry.causal_budget_exhausted_total);
        }

        info!(
            tenant_id,
            entity_id,
            effect_metric,
            status = ?analysis.status,
            candidates = analysis.candidates.len(),
            edges = analysis.edges.len(),
            best_p_value = ?analysis.edges.first().map(|edge| edge.p_value),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "causal analysis finished"
        );

        self.persist(tenant_id, &analysis, as_of);
        analysis
    }

    fn persist(&self, tenant_id: &str, analysis: &CausalAnalysis, analyzed_at: OffsetDateTime) {
        if !self.ruleset.persist_causal_edges || analysis.edges.is_empty() {
            return;
        }
        let Some(sink) = &self.edges else {
            return;
        };
        match sink.record_causal_edges(tenant_id, analysis, analyzed_at) {
            Ok(written) => debug!(tenant_id, written, "causal edges recorded"),
            Err(err) => {
                EngineTelemetry::bump(&self.telemetry.store_unavailable_total);
                warn!(tenant_id, error = %err, "failed to record causal edges");
            }
        }
    }
}
