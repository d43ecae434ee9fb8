//! Pure decision-intelligence rules: baselines, causal statistics, memory
//! ranking and confidence calibration. Nothing in this crate performs I/O.

pub mod baseline;
pub mod calibration;
pub mod causal;
pub mod embedding;
pub mod memory;
pub mod ruleset;
pub mod sample;
pub mod stats;

use time::{Duration, OffsetDateTime, UtcOffset};

pub use baseline::{score_against_baseline, AnomalyResult, Baseline, BaselineKey};
pub use calibration::{
    calibrate, CalibrationBin, CalibrationBucket, ConfidenceAssessment, ConfidenceSource,
    ConfidenceStrategy, EmpiricalStrategy, EvidenceSignature, HeuristicStrategy,
};
pub use causal::{
    align_on_timestamps, find_causes, prepare_series, test_candidate, CandidateReport,
    CandidateVerdict, CausalAnalysis, CausalEdge, CausalStatus, PreparedSeries,
};
pub use embedding::{Embedder, EmbeddingUnavailable, FeatureHashEmbedder};
pub use memory::{
    cosine_similarity, feedback_boost, memory_hit_count, rank_candidates, DecisionId,
    DecisionTrace, FeedbackEntry, FeedbackKind, IndexedDecision, SearchRequest, SearchScope,
    SimilarDecision,
};
pub use ruleset::DecisionRuleset;
pub use sample::{MetricSample, RawMetricSample, SampleRejection};
pub use stats::StatsError;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DecisionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not computable: {0}")]
    NotComputable(String),
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DecisionError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DecisionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DecisionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DecisionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DecisionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DecisionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            DecisionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn seconds_between(earlier: OffsetDateTime, later: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }
    (later - earlier).as_seconds_f64()
}

#[must_use]
pub fn duration_from_secs(seconds: u64) -> Duration {
    Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
}
