use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ruleset::DecisionRuleset;

/// Baselines are never shared across tenants: the tenant is part of the key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BaselineKey {
    pub tenant_id: String,
    pub entity_id: String,
    pub metric_name: String,
}

impl Display for BaselineKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.entity_id, self.metric_name)
    }
}

/// Rolling reference distribution for one metric of one entity.
///
/// `variance` is the unbiased sample variance. The incremental update
/// recovers the Welford sum of squared deviations from it, so the struct has
/// no hidden accumulator state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    pub key: BaselineKey,
    pub mean: f64,
    pub variance: f64,
    pub sample_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub refreshed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sample_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FoldOutcome {
    Folded,
    /// Timestamp at or before the newest folded sample; the running
    /// statistics are left untouched.
    Late,
}

impl Baseline {
    #[must_use]
    pub fn empty(key: BaselineKey, refreshed_at: OffsetDateTime) -> Self {
        Self {
            key,
            mean: 0.0,
            variance: 0.0,
            sample_count: 0,
            refreshed_at,
            last_sample_at: None,
        }
    }

    /// Builds a baseline from a time-ordered window of historical samples.
    #[must_use]
    pub fn from_window(
        key: BaselineKey,
        window: &[(OffsetDateTime, f64)],
        refreshed_at: OffsetDateTime,
    ) -> Self {
        let mut baseline = Self::empty(key, refreshed_at);
        for (timestamp, value) in window {
            if value.is_finite() {
                baseline.welford(*value);
            }
            baseline.last_sample_at = Some(match baseline.last_sample_at {
                Some(current) if current > *timestamp => current,
                _ => *timestamp,
            });
        }
        baseline
    }

    #[must_use]
    pub fn stddev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn is_stale(&self, now: OffsetDateTime, ttl_secs: u64) -> bool {
        crate::seconds_between(self.refreshed_at, now) >= ttl_secs as f64
    }

    /// Online update with a newly observed value.
    pub fn fold(&mut self, value: f64, timestamp: OffsetDateTime) -> FoldOutcome {
        if let Some(last) = self.last_sample_at {
            if timestamp <= last {
                return FoldOutcome::Late;
            }
        }
        if !value.is_finite() {
            return FoldOutcome::Late;
        }
        self.welford(value);
        self.last_sample_at = Some(timestamp);
        FoldOutcome::Folded
    }

    #[allow(clippy::cast_precision_loss)]
    fn welford(&mut self, value: f64) {
        let previous_m2 = if self.sample_count > 1 {
            self.variance * (self.sample_count - 1) as f64
        } else {
            0.0
        };

        self.sample_count += 1;
        let count = self.sample_count as f64;
        let delta = value - self.mean;
        self.mean += delta / count;
        let m2 = previous_m2 + delta * (value - self.mean);

        self.variance = if self.sample_count > 1 {
            (m2 / (count - 1.0)).max(0.0)
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyBasis {
    ZScore,
    AbsoluteDeviation,
    InsufficientHistory,
    BaselineUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub z_score: Option<f64>,
    pub insufficient_data: bool,
    pub basis: AnomalyBasis,
}

impl AnomalyResult {
    #[must_use]
    pub fn insufficient(basis: AnomalyBasis) -> Self {
        Self {
            is_anomaly: false,
            z_score: None,
            insufficient_data: true,
            basis,
        }
    }
}

/// Scores `value` against a baseline that does not yet include it.
#[must_use]
pub fn score_against_baseline(
    baseline: &Baseline,
    value: f64,
    ruleset: &DecisionRuleset,
) -> AnomalyResult {
    if baseline.sample_count < ruleset.min_baseline_samples {
        return AnomalyResult::insufficient(AnomalyBasis::InsufficientHistory);
    }

    let stddev = baseline.stddev();
    if stddev <= f64::EPSILON * baseline.mean.abs().max(1.0) {
        let deviation = (value - baseline.mean).abs();
        let tolerance =
            ruleset.flat_abs_tolerance + ruleset.flat_rel_tolerance * baseline.mean.abs();
        return AnomalyResult {
            is_anomaly: deviation > tolerance,
            z_score: None,
            insufficient_data: false,
            basis: AnomalyBasis::AbsoluteDeviation,
        };
    }

    let z = (value - baseline.mean) / stddev;
    if !z.is_finite() {
        return AnomalyResult {
            is_anomaly: true,
            z_score: None,
            insufficient_data: false,
            basis: AnomalyBasis::AbsoluteDeviation,
        };
    }

    AnomalyResult {
        is_anomaly: z.abs() > ruleset.z_threshold,
        z_score: Some(z),
        insufficient_data: false,
        basis: AnomalyBasis::ZScore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;
    use proptest::prelude::*;
    use time::Duration;

    fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_key() -> BaselineKey {
        BaselineKey {
            tenant_id: "tenant-a".to_string(),
            entity_id: "router-1".to_string(),
            metric_name: "throughput".to_string(),
        }
    }

    fn window(values: &[f64]) -> Vec<(OffsetDateTime, f64)> {
        let start = must_utc("2026-03-01T00:00:00Z");
        values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                (
                    start + Duration::seconds(i64::try_from(index).unwrap_or(0)),
                    *value,
                )
            })
            .collect()
    }

    fn fixed_baseline(mean: f64, stddev: f64, count: u64) -> Baseline {
        Baseline {
            key: fixture_key(),
            mean,
            variance: stddev * stddev,
            sample_count: count,
            refreshed_at: must_utc("2026-03-01T00:00:00Z"),
            last_sample_at: None,
        }
    }

    #[test]
    fn throughput_spike_scores_seven_sigma() {
        let baseline = fixed_baseline(50.0, 5.0, 200);
        let result = score_against_baseline(&baseline, 85.0, &DecisionRuleset::v1());
        assert!(result.is_anomaly);
        assert!(!result.insufficient_data);
        let z = result.z_score.unwrap_or(f64::NAN);
        assert!((z - 7.0).abs() < 1e-12);
    }

    #[test]
    fn short_history_is_insufficient_regardless_of_value() {
        let baseline = Baseline::from_window(
            fixture_key(),
            &window(&[1.0, 2.0, 3.0, 4.0]),
            must_utc("2026-03-01T00:00:00Z"),
        );
        let result = score_against_baseline(&baseline, 1_000_000.0, &DecisionRuleset::v1());
        assert!(result.insufficient_data);
        assert!(!result.is_anomaly);
        assert_eq!(result.z_score, None);
    }

    #[test]
    fn constant_history_uses_absolute_deviation() {
        let baseline = Baseline::from_window(
            fixture_key(),
            &window(&[7.0; 20]),
            must_utc("2026-03-01T00:00:00Z"),
        );
        assert!(baseline.variance.abs() < f64::EPSILON);

        let same = score_against_baseline(&baseline, 7.0, &DecisionRuleset::v1());
        assert!(!same.is_anomaly);
        assert_eq!(same.z_score, None);
        assert_eq!(same.basis, AnomalyBasis::AbsoluteDeviation);

        let moved = score_against_baseline(&baseline, 9.0, &DecisionRuleset::v1());
        assert!(moved.is_anomaly);
        assert_eq!(moved.z_score, None);
    }

    #[test]
    fn late_samples_do_not_move_statistics() {
        let mut baseline = Baseline::from_window(
            fixture_key(),
            &window(&[10.0, 11.0, 12.0, 13.0, 14.0]),
            must_utc("2026-03-01T00:00:00Z"),
        );
        let before = baseline.clone();
        let outcome = baseline.fold(500.0, must_utc("2026-03-01T00:00:02Z"));
        assert_eq!(outcome, FoldOutcome::Late);
        assert_eq!(baseline, before);
    }

    #[test]
    fn welford_matches_two_pass_statistics() {
        let values = [3.5, 9.25, -4.0, 12.0, 0.5, 7.75, 7.75, 1.0];
        let baseline = Baseline::from_window(
            fixture_key(),
            &window(&values),
            must_utc("2026-03-01T00:00:00Z"),
        );

        #[allow(clippy::cast_precision_loss)]
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        assert!((baseline.mean - mean).abs() < 1e-12);
        assert!((baseline.variance - variance).abs() < 1e-9);
        assert_eq!(baseline.sample_count, 8);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_constant_series_never_flags_repeats(value in -1.0e6f64..1.0e6, len in 5usize..200) {
            let mut baseline = Baseline::from_window(
                fixture_key(),
                &window(&vec![value; len]),
                must_utc("2026-03-01T00:00:00Z"),
            );
            let ruleset = DecisionRuleset::v1();
            let base = must_utc("2026-03-02T00:00:00Z");
            for step in 0..20_i64 {
                let result = score_against_baseline(&baseline, value, &ruleset);
                prop_assert!(!result.is_anomaly);
                prop_assert!(!result.insufficient_data);
                let _ = baseline.fold(value, base + Duration::seconds(step));
            }
        }

        #[test]
        fn prop_sample_count_never_decreases_on_fold(
            values in prop::collection::vec(-1.0e3f64..1.0e3, 1..120),
        ) {
            let mut baseline = Baseline::empty(fixture_key(), must_utc("2026-03-01T00:00:00Z"));
            let base = must_utc("2026-03-01T00:00:00Z");
            let mut previous = 0_u64;
            for (index, value) in values.iter().enumerate() {
                let offset = i64::try_from(index).unwrap_or(0);
                let _ = baseline.fold(*value, base + Duration::seconds(offset));
                prop_assert!(baseline.sample_count >= previous);
                prop_assert!(baseline.variance >= 0.0);
                previous = baseline.sample_count;
            }
        }
    }
}
