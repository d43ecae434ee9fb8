use std::sync::Arc;

use anyhow::Result;
use decision_intel_core::{
    calibrate, CalibrationBin, ConfidenceAssessment, DecisionRuleset, EvidenceSignature,
};
use decision_intel_store::{CalibrationStore, FeedbackUpsert};
use tracing::{debug, warn};

use crate::telemetry::EngineTelemetry;

pub struct ConfidenceCalibrator {
    store: Arc<dyn CalibrationStore>,
    ruleset: Arc<DecisionRuleset>,
    telemetry: Arc<EngineTelemetry>,
}

impl ConfidenceCalibrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn CalibrationStore>,
        ruleset: Arc<DecisionRuleset>,
        telemetry: Arc<EngineTelemetry>,
    ) -> Self {
        Self {
            store,
            ruleset,
            telemetry,
        }
    }

    /// Confidence for an evidence signature. When the calibration store is
    /// unreachable the heuristic is used.
    #[must_use]
    pub fn assess(&self, signature: EvidenceSignature) -> ConfidenceAssessment {
        let bucket = signature.bucket(&self.ruleset);
        let bin = match self.store.calibration_bin(bucket) {
            Ok(bin) => bin,
            Err(err) => {
                EngineTelemetry::bump(&self.telemetry.store_unavailable_total);
                warn!(
                    memory_hit_bucket = bucket.memory_hit_bucket,
                    causal_evidence_bucket = bucket.causal_evidence_bucket,
                    error = %err,
                    "calibration store unavailable; using heuristic confidence"
                );
                None
            }
        };
        calibrate(signature, bin.as_ref(), &self.ruleset)
    }

    /// Feeds a ledger change into the bin of the decision's recorded
    /// signature. Votes never touch a bin; a rating replaced by the same
    /// operator is swapped in place.
    #[allow(clippy::missing_errors_doc)]
    pub fn record_rating(&self, upsert: &FeedbackUpsert) -> Result<Option<CalibrationBin>> {
        let previous = upsert.previous.as_ref().and_then(|entry| entry.kind.rating());
        let current = upsert.entry.kind.rating();
        if previous.is_none() && current.is_none() {
            return Ok(None);
        }

        let bucket = upsert.signature.bucket(&self.ruleset);
        let bin = self.store.apply_rating_change(bucket, previous, current)?;
        debug!(
            decision_id = %upsert.entry.decision_id,
            memory_hit_bucket = bin.memory_hit_bucket,
            causal_evidence_bucket = bin.causal_evidence_bucket,
            sample_count = bin.sample_count,
            running_avg_rating = bin.running_avg_rating,
            "calibration bin updated"
        );
        Ok(Some(bin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{must, start, FailingStore};
    use decision_intel_core::{
        CalibrationBucket, ConfidenceSource, DecisionId, FeedbackEntry, FeedbackKind,
    };

    #[derive(Default)]
    struct MemoryBins {
        bins: parking_lot::Mutex<Vec<CalibrationBin>>,
    }

    impl CalibrationStore for MemoryBins {
        fn calibration_bin(&self, bucket: CalibrationBucket) -> Result<Option<CalibrationBin>> {
            Ok(self.bins.lock().iter().find(|bin| bin.bucket() == bucket).copied())
        }

        fn apply_rating_change(
            &self,
            bucket: CalibrationBucket,
            previous: Option<u8>,
            current: Option<u8>,
        ) -> Result<CalibrationBin> {
            let mut bins = self.bins.lock();
            if !bins.iter().any(|bin| bin.bucket() == bucket) {
                bins.push(CalibrationBin::empty(bucket));
            }
            let mut updated = CalibrationBin::empty(bucket);
            for bin in bins.iter_mut().filter(|bin| bin.bucket() == bucket) {
                match (previous, current) {
                    (None, Some(rating)) => bin.record(rating),
                    (Some(old), Some(rating)) => bin.replace(old, rating),
                    (Some(old), None) => bin.remove(old),
                    (None, None) => {}
                }
                updated = *bin;
            }
            Ok(updated)
        }

        fn calibration_bins(&self) -> Result<Vec<CalibrationBin>> {
            Ok(self.bins.lock().clone())
        }
    }

    fn upsert(previous: Option<FeedbackKind>, current: FeedbackKind) -> FeedbackUpsert {
        let decision_id = DecisionId::new();
        let entry = |kind| match FeedbackEntry::new(decision_id, "op-1", kind, start()) {
            Ok(entry) => entry,
            Err(err) => panic!("invalid fixture feedback: {err}"),
        };
        FeedbackUpsert {
            entry: entry(current),
            previous: previous.map(entry),
            feedback_score: current.ledger_score(),
            signature: EvidenceSignature::new(3, 1),
        }
    }

    #[test]
    fn fifty_ratings_switch_to_calibrated_confidence() {
        let store = Arc::new(MemoryBins::default());
        let calibrator = ConfidenceCalibrator::new(
            store.clone(),
            Arc::new(DecisionRuleset::v1()),
            Arc::new(EngineTelemetry::default()),
        );
        let signature = EvidenceSignature::new(3, 1);

        for _ in 0..49 {
            must(calibrator.record_rating(&upsert(None, FeedbackKind::Rating(2))));
        }
        let heuristic = calibrator.assess(signature);
        assert_eq!(heuristic.source, ConfidenceSource::Heuristic);
        assert!((heuristic.confidence - 0.7).abs() < 1e-12);
        assert!(!heuristic.low_confidence);

        must(calibrator.record_rating(&upsert(None, FeedbackKind::Rating(2))));
        let calibrated = calibrator.assess(signature);
        assert_eq!(calibrated.source, ConfidenceSource::Calibrated);
        assert!((calibrated.confidence - 0.25).abs() < 1e-12);
        assert!(calibrated.low_confidence);
        assert_eq!(calibrated.bin_sample_count, 50);
    }

    #[test]
    fn votes_leave_bins_untouched_and_switching_removes_rating() {
        let store = Arc::new(MemoryBins::default());
        let calibrator = ConfidenceCalibrator::new(
            store.clone(),
            Arc::new(DecisionRuleset::v1()),
            Arc::new(EngineTelemetry::default()),
        );

        assert_eq!(must(calibrator.record_rating(&upsert(None, FeedbackKind::Vote(1)))), None);
        let rated = must(calibrator.record_rating(&upsert(None, FeedbackKind::Rating(5))));
        assert_eq!(rated.map(|bin| bin.sample_count), Some(1));

        let rerated = must(calibrator.record_rating(&upsert(
            Some(FeedbackKind::Rating(5)),
            FeedbackKind::Rating(3),
        )));
        assert_eq!(rerated.map(|bin| (bin.sample_count, bin.running_avg_rating)), Some((1, 3.0)));

        let switched = must(calibrator.record_rating(&upsert(
            Some(FeedbackKind::Rating(3)),
            FeedbackKind::Vote(-1),
        )));
        assert_eq!(switched.map(|bin| bin.sample_count), Some(0));
    }

    #[test]
    fn unavailable_store_falls_back_to_heuristic() {
        let telemetry = Arc::new(EngineTelemetry::default());
        let calibrator = ConfidenceCalibrator::new(
            Arc::new(FailingStore),
            Arc::new(DecisionRuleset::v1()),
            telemetry.clone(),
        );
        let assessment = calibrator.assess(EvidenceSignature::new(0, 0));
        assert_eq!(assessment.source, ConfidenceSource::Heuristic);
        assert!((assessment.confidence - 0.3).abs() < 1e-12);
        assert_eq!(telemetry.snapshot().store_unavailable_total, 1);
    }
}
