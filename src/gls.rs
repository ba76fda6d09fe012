//! Generalized least squares through a Cholesky factor of the covariance.

use crate::linalg::faer_ndarray::{FaerCholeskyFactor, FaerQr};
use crate::linalg::utils::solve_upper_triangular;
use crate::types::RankPolicy;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use thiserror::Error;

/// Multiple of `max(N, P) * eps` below which the part of a whitened column
/// orthogonal to the retained columns counts as zero.
const RANK_TOL_FACTOR: f64 = 10.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GlsError {
    #[error("Whitened design or response contains non-finite entries")]
    NonFiniteWhitened,

    #[error("GLS Gram matrix is singular: numerical rank {rank} of {columns} design columns")]
    RankDeficient { rank: usize, columns: usize },

    #[error("GLS coefficients are non-finite")]
    NonFiniteCoefficients,
}

/// Solution of the GLS normal equations.
#[derive(Debug, Clone)]
pub struct GlsFit {
    pub beta: Array1<f64>,
    pub residuals: Array1<f64>,
    /// Numerical rank of `X' Psi^-1 X`.
    pub rank: usize,
}

/// Greedy left-to-right selection of linearly independent whitened columns.
///
/// A column is kept when its component orthogonal to the columns already kept
/// (the last diagonal entry of `R`) exceeds `10 * max(N, P) * eps` times its
/// own norm.
fn independent_columns(whitened: &Array2<f64>) -> Vec<usize> {
    let (n, p) = whitened.dim();
    let tol = RANK_TOL_FACTOR * (n.max(p) as f64) * f64::EPSILON;
    let mut kept: Vec<usize> = Vec::with_capacity(p);
    for j in 0..p {
        let k = kept.len();
        if k >= n {
            break;
        }
        let column = whitened.column(j);
        let norm = column.dot(&column).sqrt();
        if norm == 0.0 {
            continue;
        }
        let mut trial = kept.clone();
        trial.push(j);
        let r = whitened.select(Axis(1), &trial).qr_r();
        if r[[k, k]].abs() > tol * norm {
            kept.push(j);
        }
    }
    kept
}

/// Solves `min |L^-1 (y - X beta)|` with `Psi = L L'`, i.e. the GLS normal
/// equations `(X' Psi^-1 X) beta = X' Psi^-1 y`, and returns `y - X beta`.
///
/// The whitened problem is solved by Householder QR of `[L^-1 X_K | L^-1 y]`,
/// where `K` are the independent columns. Dependent columns follow `policy`;
/// under `PseudoInverse` their coefficients are zero and the fitted mean is
/// the unique GLS projection.
pub fn generalized_least_squares(
    factor: &FaerCholeskyFactor,
    design: ArrayView2<'_, f64>,
    response: ArrayView1<'_, f64>,
    policy: RankPolicy,
) -> Result<GlsFit, GlsError> {
    let whitened_design = factor.whiten_mat(&design);
    let whitened_response = factor.whiten_vec(&response);
    if whitened_design.iter().any(|v| !v.is_finite())
        || whitened_response.iter().any(|v| !v.is_finite())
    {
        return Err(GlsError::NonFiniteWhitened);
    }

    let (n, columns) = design.dim();
    let kept = independent_columns(&whitened_design);
    let rank = kept.len();
    if rank < columns {
        match policy {
            RankPolicy::Reject => return Err(GlsError::RankDeficient { rank, columns }),
            RankPolicy::PseudoInverse => {
                log::debug!(
                    "GLS design is rank deficient (rank {} of {}); dropping dependent columns",
                    rank,
                    columns
                );
            }
        }
    }

    let mut beta = Array1::<f64>::zeros(columns);
    if rank > 0 {
        let mut augmented = Array2::<f64>::zeros((n, rank + 1));
        for (slot, &j) in kept.iter().enumerate() {
            augmented.column_mut(slot).assign(&whitened_design.column(j));
        }
        augmented.column_mut(rank).assign(&whitened_response);
        // The last column of R holds Q' L^-1 y.
        let r = augmented.qr_r();
        let kept_beta = solve_upper_triangular(r.slice(s![..rank, ..rank]), r.slice(s![..rank, rank]));
        for (&j, &b) in kept.iter().zip(kept_beta.iter()) {
            beta[j] = b;
        }
    }
    if beta.iter().any(|v| !v.is_finite()) {
        return Err(GlsError::NonFiniteCoefficients);
    }
    let residuals = &response - &design.dot(&beta);

    Ok(GlsFit {
        beta,
        residuals,
        rank,
    })
}
