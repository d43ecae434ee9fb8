//! Time-series statistics used by causal analysis.

mod adf;
mod granger;
mod ols;

pub use adf::{adf_test, mackinnon_critical_5pct, AdfOutcome};
pub use granger::{granger_test, lag_search_p_value, GrangerOutcome};
pub use ols::{least_squares, OlsFit};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StatsError {
    #[error("insufficient observations: need {needed}, have {available}")]
    InsufficientObservations { needed: usize, available: usize },
    #[error("series has zero variance")]
    ZeroVariance,
    #[error("regression design is singular")]
    Singular,
    #[error("non-finite value in input or result")]
    NonFinite,
    #[error("distribution error: {0}")]
    Distribution(String),
    #[error("deadline reached before any test completed")]
    DeadlineReached,
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let center = mean(values);
    values.iter().map(|value| (value - center).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// True when the series carries no usable variation.
#[must_use]
pub fn is_degenerate(values: &[f64]) -> bool {
    if values.iter().any(|value| !value.is_finite()) {
        return true;
    }
    let scale = values.iter().fold(0.0_f64, |acc, value| acc.max(value.abs()));
    sample_variance(values) <= (f64::EPSILON * scale.max(1.0)).powi(2)
}

/// First-order differencing; the result is one element shorter.
#[must_use]
pub fn difference(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|pair| pair[1] - pair[0]).collect()
}
