use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DecisionError;

/// Every tunable threshold of the decision core, versioned so stored
/// configurations stay reproducible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRuleset {
    pub ruleset_version: u32,

    pub z_threshold: f64,
    pub min_baseline_samples: u64,
    pub baseline_ttl_secs: u64,
    pub baseline_window_samples: usize,
    pub flat_abs_tolerance: f64,
    pub flat_rel_tolerance: f64,

    pub causal_window_secs: u64,
    pub min_causal_observations: usize,
    pub significance_level: f64,
    pub max_granger_lag: usize,
    pub adf_max_lag: usize,
    pub causal_budget_ms: u64,
    pub persist_causal_edges: bool,

    pub boost_cap: f64,
    pub boost_scale: f64,
    pub memory_hit_similarity: f64,
    pub default_min_similarity: f64,
    pub default_search_limit: usize,

    pub heuristic_memory_base: f64,
    pub heuristic_memory_step: f64,
    pub heuristic_memory_cap: f64,
    pub heuristic_causal_step: f64,
    pub heuristic_causal_cap: f64,
    pub heuristic_total_cap: f64,
    pub calibration_min_samples: u64,
    pub memory_bucket_cap: u32,
    pub causal_bucket_cap: u32,
    pub low_confidence_threshold: f64,

    pub analysis_workers: usize,
    pub analysis_queue_capacity: usize,
}

impl DecisionRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            z_threshold: 3.0,
            min_baseline_samples: 5,
            baseline_ttl_secs: 300,
            baseline_window_samples: 1_000,
            flat_abs_tolerance: 1e-9,
            flat_rel_tolerance: 0.0,
            causal_window_secs: 86_400,
            min_causal_observations: 100,
            significance_level: 0.05,
            max_granger_lag: 8,
            adf_max_lag: 12,
            causal_budget_ms: 2_000,
            persist_causal_edges: true,
            boost_cap: 0.2,
            boost_scale: 5.0,
            memory_hit_similarity: 0.7,
            default_min_similarity: 0.5,
            default_search_limit: 10,
            heuristic_memory_base: 0.3,
            heuristic_memory_step: 0.1,
            heuristic_memory_cap: 0.8,
            heuristic_causal_step: 0.1,
            heuristic_causal_cap: 0.2,
            heuristic_total_cap: 0.95,
            calibration_min_samples: 50,
            memory_bucket_cap: 5,
            causal_bucket_cap: 2,
            low_confidence_threshold: 0.7,
            analysis_workers: 4,
            analysis_queue_capacity: 64,
        }
    }

    /// Validates numeric bounds and structural invariants.
    ///
    /// # Errors
    /// Returns [`DecisionError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), DecisionError> {
        if self.ruleset_version == 0 {
            return Err(DecisionError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("significance_level", self.significance_level),
            ("boost_cap", self.boost_cap),
            ("memory_hit_similarity", self.memory_hit_similarity),
            ("heuristic_memory_base", self.heuristic_memory_base),
            ("heuristic_memory_step", self.heuristic_memory_step),
            ("heuristic_memory_cap", self.heuristic_memory_cap),
            ("heuristic_causal_step", self.heuristic_causal_step),
            ("heuristic_causal_cap", self.heuristic_causal_cap),
            ("heuristic_total_cap", self.heuristic_total_cap),
            ("low_confidence_threshold", self.low_confidence_threshold),
            ("flat_rel_tolerance", self.flat_rel_tolerance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DecisionError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if !(-1.0..=1.0).contains(&self.default_min_similarity) {
            return Err(DecisionError::Configuration(
                "default_min_similarity MUST be in [-1.0, 1.0]".to_string(),
            ));
        }

        if !self.z_threshold.is_finite() || self.z_threshold <= 0.0 {
            return Err(DecisionError::Configuration(
                "z_threshold MUST be a positive finite number".to_string(),
            ));
        }

        if !self.flat_abs_tolerance.is_finite() || self.flat_abs_tolerance < 0.0 {
            return Err(DecisionError::Configuration(
                "flat_abs_tolerance MUST be >= 0".to_string(),
            ));
        }

        if !self.boost_scale.is_finite() || self.boost_scale <= 0.0 {
            return Err(DecisionError::Configuration(
                "boost_scale MUST be a positive finite number".to_string(),
            ));
        }

        if self.min_baseline_samples < 2 {
            return Err(DecisionError::Configuration(
                "min_baseline_samples MUST be >= 2".to_string(),
            ));
        }

        if self.baseline_window_samples == 0 {
            return Err(DecisionError::Configuration(
                "baseline_window_samples MUST be >= 1".to_string(),
            ));
        }

        if self.min_causal_observations < 10 {
            return Err(DecisionError::Configuration(
                "min_causal_observations MUST be >= 10".to_string(),
            ));
        }

        if self.max_granger_lag == 0 {
            return Err(DecisionError::Configuration(
                "max_granger_lag MUST be >= 1".to_string(),
            ));
        }

        if self.calibration_min_samples == 0 {
            return Err(DecisionError::Configuration(
                "calibration_min_samples MUST be >= 1".to_string(),
            ));
        }

        if self.analysis_workers == 0 || self.analysis_queue_capacity == 0 {
            return Err(DecisionError::Configuration(
                "analysis pool MUST have at least one worker and one queue slot".to_string(),
            ));
        }

        if self.default_search_limit == 0 {
            return Err(DecisionError::Configuration(
                "default_search_limit MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`DecisionError::Configuration`] when decoding fails or the
    /// decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, DecisionError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            DecisionError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    /// Largest Granger lag usable for a series of `len` observations.
    #[must_use]
    pub fn granger_lag_bound(&self, len: usize) -> usize {
        self.max_granger_lag.min(len / 3)
    }
}

impl Default for DecisionRuleset {
    fn default() -> Self {
        Self::v1()
    }
}
