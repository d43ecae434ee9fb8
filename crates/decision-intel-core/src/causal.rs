//! Granger-causal hypothesis testing between the metrics of one entity.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ruleset::DecisionRuleset;
use crate::stats::{adf_test, difference, granger_test, GrangerOutcome, StatsError};

pub const INSUFFICIENT_STATISTICAL_POWER: &str = "insufficient_statistical_power";

/// A directional hypothesis: past values of `cause_metric` improve the
/// prediction of `effect_metric`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CausalEdge {
    pub entity_id: String,
    pub cause_metric: String,
    pub effect_metric: String,
    pub p_value: f64,
    pub lag: usize,
    pub stationarity_fixed: bool,
    pub f_statistic: f64,
    pub observations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CandidateVerdict {
    Significant,
    NotSignificant,
    NonStationary,
    NotTestable { reason: String },
    InsufficientObservations { available: usize },
    /// The analysis budget ran out before this candidate was scored.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateReport {
    pub cause_metric: String,
    pub verdict: CandidateVerdict,
    pub observations: usize,
    /// Lag-search corrected p-value; significance is judged on this.
    pub p_value: Option<f64>,
    /// Uncorrected p-value at `lag`.
    pub raw_p_value: Option<f64>,
    pub lag: Option<usize>,
    pub f_statistic: Option<f64>,
    pub stationarity_fixed: bool,
}

impl CandidateReport {
    fn with_verdict(cause_metric: &str, verdict: CandidateVerdict, observations: usize) -> Self {
        Self {
            cause_metric: cause_metric.to_string(),
            verdict,
            observations,
            p_value: None,
            raw_p_value: None,
            lag: None,
            f_statistic: None,
            stationarity_fixed: false,
        }
    }

    #[must_use]
    pub fn edge(&self, entity_id: &str, effect_metric: &str) -> Option<CausalEdge> {
        if self.verdict != CandidateVerdict::Significant {
            return None;
        }
        Some(CausalEdge {
            entity_id: entity_id.to_string(),
            cause_metric: self.cause_metric.clone(),
            effect_metric: effect_metric.to_string(),
            p_value: self.p_value?,
            lag: self.lag?,
            stationarity_fixed: self.stationarity_fixed,
            f_statistic: self.f_statistic?,
            observations: self.observations,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CausalStatus {
    Complete,
    InsufficientStatisticalPower,
    TimedOut,
    StoreUnavailable,
}

impl CausalStatus {
    #[must_use]
    pub fn reason(self) -> Option<&'static str> {
        match self {
            Self::Complete => None,
            Self::InsufficientStatisticalPower => Some(INSUFFICIENT_STATISTICAL_POWER),
            Self::TimedOut => Some("timed_out"),
            Self::StoreUnavailable => Some("store_unavailable"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CausalAnalysis {
    pub entity_id: String,
    pub effect_metric: String,
    pub status: CausalStatus,
    pub reason: Option<String>,
    /// Significant edges, ascending by p-value.
    pub edges: Vec<CausalEdge>,
    pub candidates: Vec<CandidateReport>,
}

impl CausalAnalysis {
    #[must_use]
    pub fn empty(entity_id: &str, effect_metric: &str, status: CausalStatus) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            effect_metric: effect_metric.to_string(),
            status,
            reason: status.reason().map(str::to_string),
            edges: Vec::new(),
            candidates: Vec::new(),
        }
    }

    #[must_use]
    pub fn causal_evidence_count(&self, significance_level: f64) -> usize {
        self.edges
            .iter()
            .filter(|edge| edge.p_value < significance_level)
            .count()
    }
}

/// A series after the stationarity check, differenced at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSeries {
    pub values: Vec<f64>,
    pub differenced: bool,
}

/// Runs ADF and applies one pass of first-order differencing when the level
/// series has a unit root.
///
/// # Errors
/// Returns [`CandidateVerdict::NonStationary`] when the differenced series
/// still has a unit root, or [`CandidateVerdict::NotTestable`] for degenerate
/// input.
pub fn prepare_series(
    values: &[f64],
    ruleset: &DecisionRuleset,
) -> Result<PreparedSeries, CandidateVerdict> {
    let level = adf_test(values, ruleset.adf_max_lag).map_err(not_testable)?;
    if level.stationary {
        return Ok(PreparedSeries {
            values: values.to_vec(),
            differenced: false,
        });
    }

    let differenced = difference(values);
    let retest = adf_test(&differenced, ruleset.adf_max_lag).map_err(not_testable)?;
    if retest.stationary {
        Ok(PreparedSeries {
            values: differenced,
            differenced: true,
        })
    } else {
        Err(CandidateVerdict::NonStationary)
    }
}

fn not_testable(err: StatsError) -> CandidateVerdict {
    CandidateVerdict::NotTestable {
        reason: err.to_string(),
    }
}

/// Scores one candidate against the effect over timestamp-aligned values.
#[must_use]
pub fn test_candidate(
    cause_metric: &str,
    effect: &[f64],
    cause: &[f64],
    ruleset: &DecisionRuleset,
    deadline: Option<Instant>,
) -> CandidateReport {
    let observations = effect.len().min(cause.len());
    if observations < ruleset.min_causal_observations {
        return CandidateReport::with_verdict(
            cause_metric,
            CandidateVerdict::InsufficientObservations {
                available: observations,
            },
            observations,
        );
    }

    let prepared_effect = match prepare_series(&effect[..observations], ruleset) {
        Ok(prepared) => prepared,
        Err(CandidateVerdict::NotTestable { reason }) => {
            return CandidateReport::with_verdict(
                cause_metric,
                CandidateVerdict::NotTestable {
                    reason: format!("effect series: {reason}"),
                },
                observations,
            )
        }
        Err(verdict) => return CandidateReport::with_verdict(cause_metric, verdict, observations),
    };
    let prepared_cause = match prepare_series(&cause[..observations], ruleset) {
        Ok(prepared) => prepared,
        Err(verdict) => return CandidateReport::with_verdict(cause_metric, verdict, observations),
    };

    let stationarity_fixed = prepared_effect.differenced || prepared_cause.differenced;
    let (effect_values, cause_values) = align_prepared(&prepared_effect, &prepared_cause);
    let lag_bound = ruleset.granger_lag_bound(effect_values.len());

    let mut report = CandidateReport::with_verdict(
        cause_metric,
        CandidateVerdict::NotSignificant,
        observations,
    );
    report.stationarity_fixed = stationarity_fixed;

    match granger_test(effect_values, cause_values, lag_bound, deadline) {
        Ok(outcome) => {
            report.p_value = Some(outcome.p_value);
            report.raw_p_value = Some(outcome.raw_p_value);
            report.lag = Some(outcome.lag);
            report.f_statistic = Some(outcome.f_statistic);
            report.verdict = significance_verdict(&outcome, ruleset);
        }
        Err(StatsError::DeadlineReached) => report.verdict = CandidateVerdict::Skipped,
        Err(err) => report.verdict = not_testable(err),
    }
    report
}

/// The best lag is chosen on the raw p-value, but retention uses the
/// p-value corrected for the number of lags searched.
fn significance_verdict(outcome: &GrangerOutcome, ruleset: &DecisionRuleset) -> CandidateVerdict {
    if outcome.p_value < ruleset.significance_level {
        CandidateVerdict::Significant
    } else {
        CandidateVerdict::NotSignificant
    }
}

/// Differencing drops the first observation, so the undifferenced partner
/// drops it too.
fn align_prepared<'a>(
    effect: &'a PreparedSeries,
    cause: &'a PreparedSeries,
) -> (&'a [f64], &'a [f64]) {
    let len = effect.values.len().min(cause.values.len());
    (
        &effect.values[effect.values.len() - len..],
        &cause.values[cause.values.len() - len..],
    )
}

/// Inner join of two time-ordered series on identical timestamps.
#[must_use]
pub fn align_on_timestamps(
    effect: &[(OffsetDateTime, f64)],
    cause: &[(OffsetDateTime, f64)],
) -> (Vec<f64>, Vec<f64>) {
    let by_time = cause.iter().copied().collect::<BTreeMap<_, _>>();
    effect
        .iter()
        .filter_map(|(timestamp, value)| by_time.get(timestamp).map(|other| (*value, *other)))
        .unzip()
}

/// Tests every other metric of the entity as a Granger cause of
/// `effect_metric`. Work finished before `deadline` is kept.
#[must_use]
pub fn find_causes(
    entity_id: &str,
    effect_metric: &str,
    series: &BTreeMap<String, Vec<(OffsetDateTime, f64)>>,
    ruleset: &DecisionRuleset,
    deadline: Option<Instant>,
) -> CausalAnalysis {
    let effect = series.get(effect_metric).map_or(&[][..], Vec::as_slice);
    if effect.len() < ruleset.min_causal_observations {
        return CausalAnalysis::empty(
            entity_id,
            effect_metric,
            CausalStatus::InsufficientStatisticalPower,
        );
    }

    let mut analysis = CausalAnalysis::empty(entity_id, effect_metric, CausalStatus::Complete);
    for (cause_metric, cause) in series {
        if cause_metric == effect_metric {
            continue;
        }
        if analysis.status == CausalStatus::TimedOut
            || deadline.is_some_and(|limit| Instant::now() >= limit)
        {
            analysis.status = CausalStatus::TimedOut;
            analysis.candidates.push(CandidateReport::with_verdict(
                cause_metric,
                CandidateVerdict::Skipped,
                0,
            ));
            continue;
        }

        let (effect_values, cause_values) = align_on_timestamps(effect, cause);
        let report = test_candidate(cause_metric, &effect_values, &cause_values, ruleset, deadline);
        if report.verdict == CandidateVerdict::Skipped {
            analysis.status = CausalStatus::TimedOut;
        }
        if let Some(edge) = report.edge(entity_id, effect_metric) {
            analysis.edges.push(edge);
        }
        analysis.candidates.push(report);
    }

    analysis.edges.sort_by(|left, right| {
        left.p_value
            .total_cmp(&right.p_value)
            .then_with(|| left.cause_metric.cmp(&right.cause_metric))
    });
    analysis.reason = analysis.status.reason().map(str::to_string);
    analysis
}
