//! Similarity search over recorded decisions, re-ranked by operator feedback.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::ruleset::DecisionRuleset;
use crate::DecisionError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionId(pub Ulid);

impl DecisionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DecisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DecisionId {
    type Err = DecisionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| DecisionError::Validation(format!("invalid decision id `{raw}`: {err}")))
    }
}

/// A recorded decision. `embedding` is `None` when it could not be computed;
/// such traces are stored but never returned by search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionTrace {
    pub id: DecisionId,
    pub tenant_id: String,
    pub embedding: Option<Vec<f32>>,
    pub context: Value,
    /// Cached sum of the current feedback ledger entries.
    pub feedback_score: i64,
    /// Evidence signature at decision time, used for calibration bins.
    pub memory_hit_count: u32,
    pub causal_evidence_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FeedbackKind {
    /// `+1` or `-1`.
    Vote(i8),
    /// Star rating in `1..=5`.
    Rating(u8),
}

impl FeedbackKind {
    /// # Errors
    /// Returns [`DecisionError::Validation`] for votes other than ±1 or
    /// ratings outside `1..=5`.
    pub fn validate(self) -> Result<(), DecisionError> {
        match self {
            Self::Vote(1 | -1) | Self::Rating(1..=5) => Ok(()),
            Self::Vote(other) => Err(DecisionError::Validation(format!(
                "vote MUST be +1 or -1, got {other}"
            ))),
            Self::Rating(other) => Err(DecisionError::Validation(format!(
                "rating MUST be in 1..=5, got {other}"
            ))),
        }
    }

    /// Contribution to the decision's aggregate feedback score.
    #[must_use]
    pub fn ledger_score(self) -> i64 {
        match self {
            Self::Vote(vote) => i64::from(vote),
            Self::Rating(rating) => i64::from(rating) - 3,
        }
    }

    #[must_use]
    pub fn rating(self) -> Option<u8> {
        match self {
            Self::Rating(rating) => Some(rating),
            Self::Vote(_) => None,
        }
    }
}

/// One operator's current feedback on one decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackEntry {
    pub decision_id: DecisionId,
    pub operator_id: String,
    pub kind: FeedbackKind,
    pub score: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl FeedbackEntry {
    /// # Errors
    /// Returns [`DecisionError::Validation`] for an empty operator or an
    /// out-of-range vote or rating.
    pub fn new(
        decision_id: DecisionId,
        operator_id: &str,
        kind: FeedbackKind,
        recorded_at: OffsetDateTime,
    ) -> Result<Self, DecisionError> {
        let operator_id = operator_id.trim();
        if operator_id.is_empty() {
            return Err(DecisionError::Validation(
                "operator_id MUST NOT be empty".to_string(),
            ));
        }
        kind.validate()?;
        Ok(Self {
            decision_id,
            operator_id: operator_id.to_string(),
            kind,
            score: kind.ledger_score(),
            recorded_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "mode", content = "tenant_id", rename_all = "snake_case")]
pub enum SearchScope {
    Tenant(String),
    /// Privileged cross-tenant view.
    Operator,
}

impl SearchScope {
    #[must_use]
    pub fn admits(&self, tenant_id: &str) -> bool {
        match self {
            Self::Tenant(scope) => scope == tenant_id,
            Self::Operator => true,
        }
    }
}

/// A searchable decision: a trace with a usable embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDecision {
    pub id: DecisionId,
    pub tenant_id: String,
    pub embedding: Vec<f32>,
    pub feedback_score: i64,
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarDecision {
    pub decision_id: DecisionId,
    pub tenant_id: String,
    pub raw_similarity: f64,
    pub adjusted_similarity: f64,
    pub feedback_score: i64,
    pub context_snapshot: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub scope: SearchScope,
    pub min_similarity: f64,
    pub limit: usize,
}

/// Cosine similarity in `[-1, 1]`; `None` when either vector is empty,
/// zero, non-finite or the dimensions differ.
#[must_use]
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> Option<f64> {
    if left.is_empty() || left.len() != right.len() {
        return None;
    }

    let mut dot = 0.0_f64;
    let mut left_norm = 0.0_f64;
    let mut right_norm = 0.0_f64;
    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    let denominator = left_norm.sqrt() * right_norm.sqrt();
    if !denominator.is_finite() || denominator <= f64::EPSILON {
        return None;
    }
    let similarity = dot / denominator;
    similarity.is_finite().then_some(similarity.clamp(-1.0, 1.0))
}

/// Bounded, monotonic adjustment for an aggregate feedback score:
/// `cap * tanh(score / scale)`, so the result stays within `[-cap, cap]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn feedback_boost(feedback_score: i64, ruleset: &DecisionRuleset) -> f64 {
    let cap = ruleset.boost_cap;
    (cap * (feedback_score as f64 / ruleset.boost_scale).tanh()).clamp(-cap, cap)
}

/// Ranks candidates for `query`. The relevance floor applies to raw
/// similarity before any feedback adjustment.
#[must_use]
pub fn rank_candidates<I>(
    query: &[f32],
    candidates: I,
    request: &SearchRequest,
    ruleset: &DecisionRuleset,
) -> Vec<SimilarDecision>
where
    I: IntoIterator<Item = IndexedDecision>,
{
    let mut ranked = candidates
        .into_iter()
        .filter(|candidate| request.scope.admits(&candidate.tenant_id))
        .filter_map(|candidate| {
            let raw_similarity = cosine_similarity(query, &candidate.embedding)?;
            if raw_similarity < request.min_similarity {
                return None;
            }
            Some(SimilarDecision {
                decision_id: candidate.id,
                tenant_id: candidate.tenant_id,
                raw_similarity,
                adjusted_similarity: raw_similarity
                    + feedback_boost(candidate.feedback_score, ruleset),
                feedback_score: candidate.feedback_score,
                context_snapshot: candidate.context,
            })
        })
        .collect::<Vec<_>>();

    ranked.sort_by(compare_ranked);
    ranked.truncate(request.limit);
    ranked
}

fn compare_ranked(left: &SimilarDecision, right: &SimilarDecision) -> Ordering {
    right
        .adjusted_similarity
        .total_cmp(&left.adjusted_similarity)
        .then_with(|| right.raw_similarity.total_cmp(&left.raw_similarity))
        .then_with(|| left.decision_id.cmp(&right.decision_id))
}

/// Number of results whose raw similarity exceeds the memory hit threshold.
#[must_use]
pub fn memory_hit_count(results: &[SimilarDecision], threshold: f64) -> u32 {
    let hits = results
        .iter()
        .filter(|result| result.raw_similarity > threshold)
        .count();
    u32::try_from(hits).unwrap_or(u32::MAX)
}
