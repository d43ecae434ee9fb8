use super::{difference, is_degenerate, least_squares, StatsError};

/// Smallest series the ADF regression is attempted on.
const MIN_ADF_OBSERVATIONS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdfOutcome {
    pub statistic: f64,
    pub critical_value: f64,
    pub lags: usize,
    pub observations: usize,
    pub stationary: bool,
}

/// MacKinnon (2010) 5% response surface for the constant-only regression.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mackinnon_critical_5pct(observations: usize) -> f64 {
    let t = observations as f64;
    -2.8621 - 2.738 / t - 8.36 / (t * t)
}

/// Augmented Dickey-Fuller unit root test.
///
/// Regresses `dy_t = a + g*y_{t-1} + sum(b_i * dy_{t-i})` with
/// `p = min(max_lag, floor((n-1)^(1/3)))` augmentation lags and rejects the
/// unit root when the t statistic of `g` falls below the 5% critical value.
///
/// # Errors
/// Returns [`StatsError`] for short, constant or singular inputs.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn adf_test(series: &[f64], max_lag: usize) -> Result<AdfOutcome, StatsError> {
    let n = series.len();
    if n < MIN_ADF_OBSERVATIONS {
        return Err(StatsError::InsufficientObservations {
            needed: MIN_ADF_OBSERVATIONS,
            available: n,
        });
    }
    if is_degenerate(series) {
        return Err(StatsError::ZeroVariance);
    }

    let lags = max_lag.min(((n - 1) as f64).cbrt().floor() as usize);
    let deltas = difference(series);
    let columns = 2 + lags;

    let mut design = Vec::with_capacity((deltas.len() - lags) * columns);
    let mut response = Vec::with_capacity(deltas.len() - lags);
    for index in lags..deltas.len() {
        response.push(deltas[index]);
        design.push(1.0);
        design.push(series[index]);
        for lag in 1..=lags {
            design.push(deltas[index - lag]);
        }
    }

    let fit = least_squares(&design, columns, &response)?;
    let statistic = fit.t_statistic(1).ok_or(StatsError::Singular)?;
    let critical_value = mackinnon_critical_5pct(response.len());

    Ok(AdfOutcome {
        statistic,
        critical_value,
        lags,
        observations: response.len(),
        stationary: statistic < critical_value,
    })
}
