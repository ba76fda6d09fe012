//! Assembly of the space-time covariance
//! `Psi = sum_j lambda_j * K(D; theta_j) ⊙ phi_j phi_j^T + diag(noise)`.
//!
//! Each component is built on the upper triangle and mirrored, so every term
//! and therefore the sum is exactly symmetric.

use crate::kernel::{CovarianceKernel, KernelError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

/// Observation-level noise added to the diagonal of `Psi`.
#[derive(Debug, Clone, Copy)]
pub enum NoiseModel<'a> {
    /// Per-observation variance blended by a static (1) / roving (0) indicator:
    /// `sigma_R + (sigma_S - sigma_R) * s_i`, parameters `[sigma_S, sigma_R]`.
    Heterogeneous { subset_static: ArrayView1<'a, f64> },
    /// One nugget shared by every observation, parameter `[sigma]`.
    Homogeneous,
}

impl NoiseModel<'_> {
    /// Number of trailing `theta` entries consumed by the noise diagonal.
    pub fn variance_parameter_count(&self) -> usize {
        match self {
            NoiseModel::Heterogeneous { .. } => 2,
            NoiseModel::Homogeneous => 1,
        }
    }

    /// Diagonal noise variances for `n` observations.
    ///
    /// `variances` holds exactly [`Self::variance_parameter_count`] entries.
    pub fn diagonal(&self, n: usize, variances: &[f64]) -> Array1<f64> {
        debug_assert_eq!(variances.len(), self.variance_parameter_count());
        match self {
            NoiseModel::Heterogeneous { subset_static } => {
                let (static_var, roving_var) = (variances[0], variances[1]);
                subset_static.mapv(|s| roving_var + (static_var - roving_var) * s)
            }
            NoiseModel::Homogeneous => Array1::from_elem(n, variances[0]),
        }
    }
}

/// One temporal component: `weight * K(D; range) ⊙ loading loading^T`.
pub fn component_covariance(
    kernel: CovarianceKernel,
    distances: ArrayView2<'_, f64>,
    range: f64,
    weight: f64,
    loading: ArrayView1<'_, f64>,
) -> Result<Array2<f64>, KernelError> {
    let mut out = kernel.matrix(distances, range)?;
    let n = out.nrows();
    for i in 0..n {
        let scaled_i = weight * loading[i];
        for k in i..n {
            let v = scaled_i * loading[k] * out[[i, k]];
            out[[i, k]] = v;
            out[[k, i]] = v;
        }
    }
    Ok(out)
}

/// Sums the `J` component covariances (no noise).
///
/// `ranges`, `weights` and the columns of `loadings` are indexed by component.
/// The parallel path maps components on the rayon pool and reduces by
/// addition; it differs from the serial fold only by reassociation.
pub fn process_covariance(
    kernel: CovarianceKernel,
    distances: ArrayView2<'_, f64>,
    ranges: ArrayView1<'_, f64>,
    weights: ArrayView1<'_, f64>,
    loadings: ArrayView2<'_, f64>,
    parallel: bool,
) -> Result<Array2<f64>, KernelError> {
    let n = distances.nrows();
    let components = weights.len();
    debug_assert_eq!(ranges.len(), components);
    debug_assert_eq!(loadings.ncols(), components);

    let component = |j: usize| {
        component_covariance(kernel, distances, ranges[j], weights[j], loadings.column(j))
    };

    if parallel && components > 1 {
        (0..components)
            .into_par_iter()
            .map(component)
            .try_reduce(
                || Array2::<f64>::zeros((n, n)),
                |mut acc, term| {
                    acc += &term;
                    Ok(acc)
                },
            )
    } else {
        (0..components).try_fold(Array2::<f64>::zeros((n, n)), |mut acc, j| {
            acc += &component(j)?;
            Ok(acc)
        })
    }
}

pub fn add_noise_diagonal(psi: &mut Array2<f64>, noise: ArrayView1<'_, f64>) {
    debug_assert_eq!(psi.nrows(), noise.len());
    for (i, &v) in noise.iter().enumerate() {
        psi[[i, i]] += v;
    }
}
