//! Confidence scoring: a heuristic estimate until a calibration bin has
//! enough operator ratings, then the empirical average of that bin.

use serde::{Deserialize, Serialize};

use crate::ruleset::DecisionRuleset;

/// Evidence counts observed when a recommendation was produced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct EvidenceSignature {
    pub memory_hit_count: u32,
    pub causal_evidence_count: u32,
}

impl EvidenceSignature {
    #[must_use]
    pub fn new(memory_hit_count: u32, causal_evidence_count: u32) -> Self {
        Self {
            memory_hit_count,
            causal_evidence_count,
        }
    }

    /// Counts above the caps share the top bucket.
    #[must_use]
    pub fn bucket(&self, ruleset: &DecisionRuleset) -> CalibrationBucket {
        CalibrationBucket {
            memory_hit_bucket: self.memory_hit_count.min(ruleset.memory_bucket_cap),
            causal_evidence_bucket: self.causal_evidence_count.min(ruleset.causal_bucket_cap),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CalibrationBucket {
    pub memory_hit_bucket: u32,
    pub causal_evidence_bucket: u32,
}

/// Running aggregate of operator ratings (1..=5) for one bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CalibrationBin {
    pub memory_hit_bucket: u32,
    pub causal_evidence_bucket: u32,
    pub sample_count: u64,
    pub running_avg_rating: f64,
}

impl CalibrationBin {
    #[must_use]
    pub fn empty(bucket: CalibrationBucket) -> Self {
        Self {
            memory_hit_bucket: bucket.memory_hit_bucket,
            causal_evidence_bucket: bucket.causal_evidence_bucket,
            sample_count: 0,
            running_avg_rating: 0.0,
        }
    }

    #[must_use]
    pub fn bucket(&self) -> CalibrationBucket {
        CalibrationBucket {
            memory_hit_bucket: self.memory_hit_bucket,
            causal_evidence_bucket: self.causal_evidence_bucket,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record(&mut self, rating: u8) {
        self.sample_count += 1;
        let rating = f64::from(rating);
        self.running_avg_rating += (rating - self.running_avg_rating) / self.sample_count as f64;
    }

    /// An operator changed an existing rating; the sample count is unchanged.
    #[allow(clippy::cast_precision_loss)]
    pub fn replace(&mut self, previous: u8, rating: u8) {
        if self.sample_count == 0 {
            self.record(rating);
            return;
        }
        self.running_avg_rating +=
            (f64::from(rating) - f64::from(previous)) / self.sample_count as f64;
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn remove(&mut self, previous: u8) {
        if self.sample_count <= 1 {
            self.sample_count = 0;
            self.running_avg_rating = 0.0;
            return;
        }
        let total = self.running_avg_rating * self.sample_count as f64 - f64::from(previous);
        self.sample_count -= 1;
        self.running_avg_rating = total / self.sample_count as f64;
    }

    #[must_use]
    pub fn is_authoritative(&self, ruleset: &DecisionRuleset) -> bool {
        self.sample_count >= ruleset.calibration_min_samples && self.running_avg_rating.is_finite()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceSource {
    Heuristic,
    Calibrated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceAssessment {
    pub confidence: f64,
    pub source: ConfidenceSource,
    pub low_confidence: bool,
    pub signature: EvidenceSignature,
    pub bucket: CalibrationBucket,
    pub bin_sample_count: u64,
}

pub trait ConfidenceStrategy {
    fn source(&self) -> ConfidenceSource;

    fn applies(&self, bin: Option<&CalibrationBin>, ruleset: &DecisionRuleset) -> bool;

    fn score(
        &self,
        signature: EvidenceSignature,
        bin: Option<&CalibrationBin>,
        ruleset: &DecisionRuleset,
    ) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicStrategy;

impl ConfidenceStrategy for HeuristicStrategy {
    fn source(&self) -> ConfidenceSource {
        ConfidenceSource::Heuristic
    }

    fn applies(&self, _bin: Option<&CalibrationBin>, _ruleset: &DecisionRuleset) -> bool {
        true
    }

    fn score(
        &self,
        signature: EvidenceSignature,
        _bin: Option<&CalibrationBin>,
        ruleset: &DecisionRuleset,
    ) -> f64 {
        let memory = (ruleset.heuristic_memory_base
            + ruleset.heuristic_memory_step * f64::from(signature.memory_hit_count))
        .min(ruleset.heuristic_memory_cap);
        let causal = (ruleset.heuristic_causal_step * f64::from(signature.causal_evidence_count))
            .min(ruleset.heuristic_causal_cap);
        (memory + causal).min(ruleset.heuristic_total_cap)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmpiricalStrategy;

impl ConfidenceStrategy for EmpiricalStrategy {
    fn source(&self) -> ConfidenceSource {
        ConfidenceSource::Calibrated
    }

    fn applies(&self, bin: Option<&CalibrationBin>, ruleset: &DecisionRuleset) -> bool {
        bin.is_some_and(|bin| bin.is_authoritative(ruleset))
    }

    fn score(
        &self,
        _signature: EvidenceSignature,
        bin: Option<&CalibrationBin>,
        _ruleset: &DecisionRuleset,
    ) -> f64 {
        bin.map_or(0.0, |bin| (bin.running_avg_rating - 1.0) / 4.0)
    }
}

/// Scores a signature with the first applicable strategy.
#[must_use]
pub fn calibrate(
    signature: EvidenceSignature,
    bin: Option<&CalibrationBin>,
    ruleset: &DecisionRuleset,
) -> ConfidenceAssessment {
    let strategies: [&dyn ConfidenceStrategy; 2] = [&EmpiricalStrategy, &HeuristicStrategy];
    let strategy = strategies
        .into_iter()
        .find(|strategy| strategy.applies(bin, ruleset))
        .unwrap_or(&HeuristicStrategy);

    let confidence = settle(strategy.score(signature, bin, ruleset));
    ConfidenceAssessment {
        confidence,
        source: strategy.source(),
        low_confidence: confidence < ruleset.low_confidence_threshold,
        signature,
        bucket: signature.bucket(ruleset),
        bin_sample_count: bin.map_or(0, |bin| bin.sample_count),
    }
}

/// Clamps into `[0, 1]` and drops sub-nanounit float noise so thresholds
/// such as 0.3 + 0.3 + 0.1 compare exactly.
fn settle(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    ((value * 1e9).round() / 1e9).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bin_with(sample_count: u64, running_avg_rating: f64) -> CalibrationBin {
        CalibrationBin {
            memory_hit_bucket: 3,
            causal_evidence_bucket: 1,
            sample_count,
            running_avg_rating,
        }
    }

    #[test]
    fn three_hits_one_edge_is_exactly_the_threshold() {
        let ruleset = DecisionRuleset::v1();
        let assessment = calibrate(EvidenceSignature::new(3, 1), None, &ruleset);
        assert_eq!(assessment.confidence, 0.7);
        assert!(!assessment.low_confidence);
        assert_eq!(assessment.source, ConfidenceSource::Heuristic);
    }

    #[test]
    fn empirical_override_starts_at_fifty_samples() {
        let ruleset = DecisionRuleset::v1();
        let signature = EvidenceSignature::new(3, 1);

        let before = calibrate(signature, Some(&bin_with(49, 2.0)), &ruleset);
        assert_eq!(before.source, ConfidenceSource::Heuristic);
        assert_eq!(before.confidence, 0.7);

        let at = calibrate(signature, Some(&bin_with(50, 2.0)), &ruleset);
        assert_eq!(at.source, ConfidenceSource::Calibrated);
        assert_eq!(at.confidence, 0.25);
        assert!(at.low_confidence);
        assert_eq!(at.bin_sample_count, 50);
    }

    #[test]
    fn heuristic_components_are_capped() {
        let ruleset = DecisionRuleset::v1();
        let saturated = calibrate(EvidenceSignature::new(40, 9), None, &ruleset);
        assert_eq!(saturated.confidence, 0.95);

        let memory_only = calibrate(EvidenceSignature::new(2, 0), None, &ruleset);
        assert_eq!(memory_only.confidence, 0.5);
        assert!(memory_only.low_confidence);
    }

    #[test]
    fn signatures_saturate_into_capped_buckets() {
        let ruleset = DecisionRuleset::v1();
        assert_eq!(
            EvidenceSignature::new(12, 7).bucket(&ruleset),
            CalibrationBucket {
                memory_hit_bucket: 5,
                causal_evidence_bucket: 2,
            }
        );
    }

    #[test]
    fn replace_and_remove_match_a_full_recount() {
        let mut bin = CalibrationBin::empty(CalibrationBucket {
            memory_hit_bucket: 1,
            causal_evidence_bucket: 0,
        });
        for rating in [5, 4, 2, 1] {
            bin.record(rating);
        }
        bin.replace(2, 5);
        assert_eq!(bin.sample_count, 4);
        assert!((bin.running_avg_rating - 15.0 / 4.0).abs() < 1e-12);

        bin.remove(1);
        assert_eq!(bin.sample_count, 3);
        assert!((bin.running_avg_rating - 14.0 / 3.0).abs() < 1e-12);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_confidence_is_a_probability(
            hits in 0_u32..1_000,
            edges in 0_u32..1_000,
            samples in 0_u64..500,
            average in 1.0f64..=5.0,
        ) {
            let ruleset = DecisionRuleset::v1();
            let bin = bin_with(samples, average);
            let assessment = calibrate(EvidenceSignature::new(hits, edges), Some(&bin), &ruleset);
            prop_assert!((0.0..=1.0).contains(&assessment.confidence));
            prop_assert_eq!(assessment.low_confidence, assessment.confidence < 0.7);
        }
    }
}
