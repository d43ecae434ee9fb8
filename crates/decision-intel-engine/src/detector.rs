//! Per-key baseline cache and the anomaly detector that reads and updates it.

use std::collections::HashMap;
use std::sync::Arc;

use decision_intel_core::baseline::{AnomalyBasis, FoldOutcome};
use decision_intel_core::{
    now_utc, score_against_baseline, AnomalyResult, Baseline, BaselineKey, DecisionRuleset,
    MetricSample,
};
use decision_intel_store::MetricStore;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::telemetry::EngineTelemetry;

type Slot = Arc<Mutex<Option<Baseline>>>;

/// Baselines keyed by `(tenant, entity, metric)`. Each key owns its own
/// mutex; the outer map lock is held only to find or create a slot.
#[derive(Debug, Default)]
pub struct BaselineCache {
    slots: RwLock<HashMap<BaselineKey, Slot>>,
}

impl BaselineCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &BaselineKey) -> Slot {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(key.clone()).or_default())
    }

    #[must_use]
    pub fn get(&self, key: &BaselineKey) -> Option<Baseline> {
        let slot = self.slots.read().get(key).map(Arc::clone)?;
        let guard = slot.lock();
        guard.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the cached baseline so the next evaluation refreshes from the
    /// metric store.
    pub fn invalidate(&self, key: &BaselineKey) {
        if let Some(slot) = self.slots.read().get(key) {
            *slot.lock() = None;
        }
    }
}

pub struct AnomalyDetector {
    cache: BaselineCache,
    metrics: Arc<dyn MetricStore>,
    ruleset: Arc<DecisionRuleset>,
    telemetry: Arc<EngineTelemetry>,
}

impl AnomalyDetector {
    #[must_use]
    pub fn new(
        metrics: Arc<dyn MetricStore>,
        ruleset: Arc<DecisionRuleset>,
        telemetry: Arc<EngineTelemetry>,
    ) -> Self {
        Self {
            cache: BaselineCache::new(),
            metrics,
            ruleset,
            telemetry,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &BaselineCache {
        &self.cache
    }

    pub fn evaluate(&self, sample: &MetricSample) -> AnomalyResult {
        self.evaluate_at(sample, now_utc())
    }

    /// Scores `sample` against the baseline as it stood before the sample,
    /// then folds the sample in. `now` drives TTL expiry.
    pub fn evaluate_at(&self, sample: &MetricSample, now: OffsetDateTime) -> AnomalyResult {
        let key = sample.key();
        let slot = self.cache.slot(&key);

        {
            let mut guard = slot.lock();
            if let Some(baseline) = guard.as_mut() {
                if !baseline.is_stale(now, self.ruleset.baseline_ttl_secs) {
                    return self.score_and_fold(baseline, sample);
                }
            }
        }

        // Refresh without holding the key lock.
        let window = match self.metrics.recent_window(
            &key,
            sample.timestamp,
            self.ruleset.baseline_window_samples,
        ) {
            Ok(window) => window,
            Err(err) => {
                EngineTelemetry::bump(&self.telemetry.store_unavailable_total);
                EngineTelemetry::bump(&self.telemetry.insufficient_data_total);
                warn!(key = %key, error = %err, "metric store unavailable; baseline not refreshed");
                return AnomalyResult::insufficient(AnomalyBasis::BaselineUnavailable);
            }
        };

        let mut guard = slot.lock();
        let still_stale = match guard.as_ref() {
            Some(current) => current.is_stale(now, self.ruleset.baseline_ttl_secs),
            None => true,
        };
        if still_stale {
            debug!(key = %key, samples = window.len(), "baseline refreshed from metric store");
            *guard = Some(Baseline::from_window(key, &window, now));
        }
        match guard.as_mut() {
            Some(baseline) => self.score_and_fold(baseline, sample),
            None => AnomalyResult::insufficient(AnomalyBasis::BaselineUnavailable),
        }
    }

    fn score_and_fold(&self, baseline: &mut Baseline, sample: &MetricSample) -> AnomalyResult {
        let result = score_against_baseline(baseline, sample.value, &self.ruleset);

        if baseline.fold(sample.value, sample.timestamp) == FoldOutcome::Late {
            EngineTelemetry::bump(&self.telemetry.late_samples_total);
            debug!(
                key = %baseline.key,
                timestamp = %sample.timestamp,
                "late sample scored but not folded"
            );
        }

        if result.insufficient_data {
            EngineTelemetry::bump(&self.telemetry.insufficient_data_total);
        }
        if result.is_anomaly {
            EngineTelemetry::bump(&self.telemetry.anomalies_total);
            debug!(
                key = %baseline.key,
                value = sample.value,
                z_score = ?result.z_score,
                basis = ?result.basis,
                "anomaly detected"
            );
        }
        result
    }
}
