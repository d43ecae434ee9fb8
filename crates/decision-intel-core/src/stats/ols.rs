use nalgebra::{DMatrix, DVector};

use super::StatsError;

/// Columns whose pivot falls below this fraction of the largest pivot are
/// treated as linearly dependent.
const RANK_TOLERANCE: f64 = 1e-10;

/// Ordinary least squares fit computed through a thin QR decomposition of
/// the column-normalized design matrix.
#[derive(Debug, Clone)]
pub struct OlsFit {
    pub coefficients: Vec<f64>,
    pub rss: f64,
    pub observations: usize,
    pub parameters: usize,
    t_denominators: Vec<f64>,
    scaled_coefficients: Vec<f64>,
}

impl OlsFit {
    #[must_use]
    pub fn residual_dof(&self) -> usize {
        self.observations - self.parameters
    }

    /// t statistic of coefficient `index`, or `None` for a perfect fit.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn t_statistic(&self, index: usize) -> Option<f64> {
        let sigma2 = self.rss / self.residual_dof() as f64;
        let denominator = (sigma2 * self.t_denominators.get(index)?).sqrt();
        if !denominator.is_finite() || denominator <= 0.0 {
            return None;
        }
        let value = self.scaled_coefficients.get(index)? / denominator;
        value.is_finite().then_some(value)
    }
}

/// Fits `response ~ design` where `design` is row-major with `columns`
/// regressors per row.
///
/// # Errors
/// [`StatsError::InsufficientObservations`] when rows do not exceed columns,
/// [`StatsError::Singular`] on rank deficiency, [`StatsError::NonFinite`] on
/// NaN or infinite inputs.
pub fn least_squares(
    design: &[f64],
    columns: usize,
    response: &[f64],
) -> Result<OlsFit, StatsError> {
    let rows = response.len();
    if columns == 0 || design.len() != rows * columns {
        return Err(StatsError::Singular);
    }
    if rows <= columns {
        return Err(StatsError::InsufficientObservations {
            needed: columns + 1,
            available: rows,
        });
    }
    if design.iter().chain(response).any(|value| !value.is_finite()) {
        return Err(StatsError::NonFinite);
    }

    let mut x = DMatrix::from_row_slice(rows, columns, design);
    let y = DVector::from_column_slice(response);

    let mut norms = Vec::with_capacity(columns);
    for mut column in x.column_iter_mut() {
        let norm = column.norm();
        if norm <= f64::MIN_POSITIVE {
            return Err(StatsError::Singular);
        }
        column /= norm;
        norms.push(norm);
    }

    let qr = x.clone().qr();
    let r = qr.r();
    let q = qr.q();

    let max_pivot = r.diagonal().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if max_pivot <= 0.0
        || r
            .diagonal()
            .iter()
            .any(|pivot| pivot.abs() <= max_pivot * RANK_TOLERANCE)
    {
        return Err(StatsError::Singular);
    }

    let qty = q.transpose() * &y;
    let scaled = r
        .solve_upper_triangular(&qty)
        .ok_or(StatsError::Singular)?;
    let r_inverse = r.try_inverse().ok_or(StatsError::Singular)?;

    let residuals = &y - &x * &scaled;
    let rss = residuals.norm_squared();
    if !rss.is_finite() {
        return Err(StatsError::NonFinite);
    }

    // diag((R^T R)^-1) is the squared norm of each row of R^-1.
    let t_denominators = r_inverse
        .row_iter()
        .map(|row| row.norm_squared())
        .collect::<Vec<_>>();

    let coefficients = scaled
        .iter()
        .zip(&norms)
        .map(|(beta, norm)| beta / norm)
        .collect::<Vec<_>>();

    Ok(OlsFit {
        coefficients,
        rss,
        observations: rows,
        parameters: columns,
        t_denominators,
        scaled_coefficients: scaled.iter().copied().collect(),
    })
}
