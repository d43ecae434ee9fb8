use std::time::Instant;

use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use super::{least_squares, StatsError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrangerOutcome {
    /// Lag with the lowest raw p-value.
    pub lag: usize,
    pub f_statistic: f64,
    /// Raw p-value at `lag`.
    pub raw_p_value: f64,
    /// `raw_p_value` adjusted for the number of lags searched (Bonferroni).
    pub p_value: f64,
    pub lags_tested: usize,
    /// True when the deadline cut the lag scan short.
    pub truncated: bool,
}

/// Tests whether lagged `cause` values improve prediction of `effect`.
///
/// For each lag `L` in `1..=max_lag` an F-test compares the restricted
/// autoregression of `effect` against the model augmented with `L` lags of
/// `cause`. Both series must be aligned and stationary.
///
/// # Errors
/// Returns the last [`StatsError`] when no lag produced a usable test, or
/// [`StatsError::DeadlineReached`] when the deadline expired first.
pub fn granger_test(
    effect: &[f64],
    cause: &[f64],
    max_lag: usize,
    deadline: Option<Instant>,
) -> Result<GrangerOutcome, StatsError> {
    if effect.len() != cause.len() {
        return Err(StatsError::InsufficientObservations {
            needed: effect.len(),
            available: cause.len(),
        });
    }
    if max_lag == 0 {
        return Err(StatsError::InsufficientObservations {
            needed: 3,
            available: effect.len(),
        });
    }

    let mut best: Option<(usize, f64, f64)> = None;
    let mut last_error = StatsError::InsufficientObservations {
        needed: 3,
        available: effect.len(),
    };
    let mut lags_tested = 0;
    let mut truncated = false;

    for lag in 1..=max_lag {
        if deadline.is_some_and(|limit| Instant::now() >= limit) {
            truncated = true;
            break;
        }
        match f_test_at_lag(effect, cause, lag) {
            Ok((f_statistic, p_value)) => {
                lags_tested += 1;
                let improves = match best {
                    Some((_, _, current)) => p_value < current,
                    None => true,
                };
                if improves {
                    best = Some((lag, f_statistic, p_value));
                }
            }
            Err(err) => last_error = err,
        }
    }

    let Some((lag, f_statistic, raw_p_value)) = best else {
        return Err(if truncated {
            StatsError::DeadlineReached
        } else {
            last_error
        });
    };

    Ok(GrangerOutcome {
        lag,
        f_statistic,
        raw_p_value,
        p_value: lag_search_p_value(raw_p_value, lags_tested),
        lags_tested,
        truncated,
    })
}

/// Bonferroni correction of the best raw p-value for a search over
/// `lags_tested` lags.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn lag_search_p_value(raw_p_value: f64, lags_tested: usize) -> f64 {
    (raw_p_value * lags_tested.max(1) as f64).min(1.0)
}

#[allow(clippy::cast_precision_loss)]
fn f_test_at_lag(effect: &[f64], cause: &[f64], lag: usize) -> Result<(f64, f64), StatsError> {
    let n = effect.len();
    let unrestricted_columns = 1 + 2 * lag;
    if n <= lag + unrestricted_columns {
        return Err(StatsError::InsufficientObservations {
            needed: lag + unrestricted_columns + 1,
            available: n,
        });
    }

    let rows = n - lag;
    let restricted_columns = 1 + lag;
    let mut restricted = Vec::with_capacity(rows * restricted_columns);
    let mut unrestricted = Vec::with_capacity(rows * unrestricted_columns);
    let mut response = Vec::with_capacity(rows);

    for t in lag..n {
        response.push(effect[t]);
        restricted.push(1.0);
        unrestricted.push(1.0);
        for i in 1..=lag {
            restricted.push(effect[t - i]);
            unrestricted.push(effect[t - i]);
        }
        for i in 1..=lag {
            unrestricted.push(cause[t - i]);
        }
    }

    let restricted_fit = least_squares(&restricted, restricted_columns, &response)?;
    let unrestricted_fit = least_squares(&unrestricted, unrestricted_columns, &response)?;

    let rss_r = restricted_fit.rss;
    let rss_u = unrestricted_fit.rss;
    if rss_u <= f64::EPSILON * rss_r.max(f64::MIN_POSITIVE) {
        return Err(StatsError::Singular);
    }

    let df_num = lag as f64;
    let df_den = unrestricted_fit.residual_dof() as f64;
    let f_statistic = ((rss_r - rss_u).max(0.0) / df_num) / (rss_u / df_den);
    if !f_statistic.is_finite() {
        return Err(StatsError::NonFinite);
    }

    let distribution = FisherSnedecor::new(df_num, df_den)
        .map_err(|err| StatsError::Distribution(err.to_string()))?;
    let p_value = distribution.sf(f_statistic).clamp(0.0, 1.0);
    Ok((f_statistic, p_value))
}
