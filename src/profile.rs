//! Concentrated negative log-likelihood of the separable space-time model.
//!
//! For hyperparameters `theta = [theta_0 .. theta_{J-1}, variances..]` the
//! evaluator builds `Psi`, eliminates the regression coefficients by GLS and
//! returns
//!
//! ```text
//! r' Psi^-1 r + ln det Psi,    r = y - X beta_GLS
//! ```
//!
//! which is `-2 ln L` up to the constant `N ln(2 pi)`. Two noise models share
//! the pipeline: a static/roving blended diagonal (`theta` has `J + 2` entries)
//! and a single nugget (`J + 1` entries).

use crate::covariance::{NoiseModel, add_noise_diagonal, process_covariance};
use crate::gls::{GlsError, generalized_least_squares};
use crate::kernel::{CovarianceKernel, EXPONENTIAL_NU, KernelError};
use crate::linalg::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::types::ProfileOptions;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::f64::consts::PI;
use thiserror::Error;

/// Smoothness used when the caller has no preference: the exponential kernel.
pub const DEFAULT_SMOOTHNESS: f64 = EXPONENTIAL_NU;

const DISTANCE_SYMMETRY_REL_TOL: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Input {0} contains non-finite values")]
    NonFiniteInput(&'static str),

    #[error("Static-subset indicator must be 0 or 1, found {value} at observation {index}")]
    InvalidIndicator { index: usize, value: f64 },

    #[error("Kernel evaluation failed: {0}")]
    Kernel(#[from] KernelError),

    #[error("Covariance matrix is not positive definite: {0}")]
    NotPositiveDefinite(#[source] FaerLinalgError),

    #[error("Generalized least squares failed: {0}")]
    SingularGram(#[from] GlsError),

    #[error("Objective evaluated to a non-finite value (quadratic form {quad_form}, log-determinant {log_det})")]
    NonFiniteObjective { quad_form: f64, log_det: f64 },
}

impl ProfileError {
    /// True for failures caused by hyperparameters in an invalid region, as
    /// opposed to malformed inputs. An optimizer should reject the trial point.
    pub fn is_numerical(&self) -> bool {
        match self {
            ProfileError::NotPositiveDefinite(_)
            | ProfileError::SingularGram(_)
            | ProfileError::NonFiniteObjective { .. } => true,
            ProfileError::Kernel(err) => matches!(
                err,
                KernelError::InvalidRange(_) | KernelError::QuadratureDidNotConverge { .. }
            ),
            ProfileError::DimensionMismatch { .. }
            | ProfileError::NonFiniteInput(_)
            | ProfileError::InvalidIndicator { .. } => false,
        }
    }
}

/// Borrowed inputs that stay fixed while an optimizer varies `theta`.
#[derive(Debug, Clone, Copy)]
pub struct SpatioTemporalData<'a> {
    /// `N x N` pairwise spatial distances.
    pub distances: ArrayView2<'a, f64>,
    /// Length-`N` responses.
    pub response: ArrayView1<'a, f64>,
    /// `N x P` design matrix.
    pub design: ArrayView2<'a, f64>,
    /// `N x J` temporal basis loadings.
    pub loadings: ArrayView2<'a, f64>,
    /// Length-`J` component weights.
    pub weights: ArrayView1<'a, f64>,
    /// Matérn smoothness selecting the kernel family.
    pub nu: f64,
}

impl<'a> SpatioTemporalData<'a> {
    pub fn new(
        distances: ArrayView2<'a, f64>,
        response: ArrayView1<'a, f64>,
        design: ArrayView2<'a, f64>,
        loadings: ArrayView2<'a, f64>,
        weights: ArrayView1<'a, f64>,
        nu: f64,
    ) -> Self {
        Self {
            distances,
            response,
            design,
            loadings,
            weights,
            nu,
        }
    }

    pub fn n_obs(&self) -> usize {
        self.response.len()
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Length `theta` must have under `noise`.
    pub fn expected_theta_len(&self, noise: &NoiseModel<'_>) -> usize {
        self.n_components() + noise.variance_parameter_count()
    }
}

/// Pieces of one evaluation.
#[derive(Debug, Clone)]
pub struct ProfileEvaluation {
    pub objective: f64,
    pub quad_form: f64,
    pub log_det: f64,
    pub beta: Array1<f64>,
    pub residuals: Array1<f64>,
    pub gram_rank: usize,
    pub kernel: CovarianceKernel,
}

fn check_dim(what: &'static str, expected: usize, found: usize) -> Result<(), ProfileError> {
    if expected == found {
        Ok(())
    } else {
        Err(ProfileError::DimensionMismatch {
            what,
            expected,
            found,
        })
    }
}

fn check_finite<'b, I>(what: &'static str, values: I) -> Result<(), ProfileError>
where
    I: IntoIterator<Item = &'b f64>,
{
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ProfileError::NonFiniteInput(what))
    }
}

/// Shape and value checks, run before any kernel or factorization work.
pub fn validate_inputs(
    theta: ArrayView1<'_, f64>,
    data: &SpatioTemporalData<'_>,
    noise: &NoiseModel<'_>,
) -> Result<(), ProfileError> {
    let n = data.n_obs();
    check_dim("distance matrix rows", n, data.distances.nrows())?;
    check_dim("distance matrix columns", n, data.distances.ncols())?;
    check_dim("design matrix rows", n, data.design.nrows())?;
    if data.design.ncols() == 0 || data.design.ncols() > n {
        return Err(ProfileError::DimensionMismatch {
            what: "design matrix columns (between 1 and N)",
            expected: n,
            found: data.design.ncols(),
        });
    }
    check_dim("temporal loading rows", n, data.loadings.nrows())?;
    let j = data.n_components();
    check_dim("temporal loading columns", j, data.loadings.ncols())?;
    if j == 0 {
        return Err(ProfileError::DimensionMismatch {
            what: "temporal components (at least one)",
            expected: 1,
            found: 0,
        });
    }
    if let NoiseModel::Heterogeneous { subset_static } = noise {
        check_dim("static-subset indicator length", n, subset_static.len())?;
        if let Some((index, &value)) = subset_static
            .iter()
            .enumerate()
            .find(|&(_, &v)| v != 0.0 && v != 1.0)
        {
            return Err(ProfileError::InvalidIndicator { index, value });
        }
    }
    check_dim("theta length", data.expected_theta_len(noise), theta.len())?;

    check_finite("theta", theta.iter())?;
    check_finite("distance matrix", data.distances.iter())?;
    check_finite("response", data.response.iter())?;
    check_finite("design matrix", data.design.iter())?;
    check_finite("temporal loadings", data.loadings.iter())?;
    check_finite("component weights", data.weights.iter())?;
    Ok(())
}

fn warn_if_distances_asymmetric(distances: ArrayView2<'_, f64>) {
    let n = distances.nrows();
    let mut scale = 0.0f64;
    let mut worst = 0.0f64;
    for i in 0..n {
        for k in (i + 1)..n {
            scale = scale.max(distances[[i, k]].abs());
            worst = worst.max((distances[[i, k]] - distances[[k, i]]).abs());
        }
    }
    if worst > DISTANCE_SYMMETRY_REL_TOL * scale.max(1.0) {
        log::warn!(
            "Distance matrix is not symmetric (max |D - D'| = {:.3e}); only its upper triangle is used",
            worst
        );
    }
}

fn build_covariance(
    theta: ArrayView1<'_, f64>,
    data: &SpatioTemporalData<'_>,
    noise: &NoiseModel<'_>,
    kernel: CovarianceKernel,
    options: &ProfileOptions,
) -> Result<Array2<f64>, ProfileError> {
    let j = data.n_components();
    let n = data.n_obs();
    let ranges = theta.slice(ndarray::s![..j]);
    let variances: Vec<f64> = theta.iter().skip(j).copied().collect();

    let mut psi = process_covariance(
        kernel,
        data.distances,
        ranges,
        data.weights,
        data.loadings,
        options.use_parallel_assembly(n),
    )?;
    let diag = noise.diagonal(n, &variances);
    add_noise_diagonal(&mut psi, diag.view());
    Ok(psi)
}

/// Validates the inputs and returns the assembled `Psi` (kernel terms plus
/// noise diagonal).
pub fn assemble_covariance(
    theta: ArrayView1<'_, f64>,
    data: &SpatioTemporalData<'_>,
    noise: &NoiseModel<'_>,
    options: &ProfileOptions,
) -> Result<Array2<f64>, ProfileError> {
    validate_inputs(theta, data, noise)?;
    let kernel = CovarianceKernel::select(data.nu)?;
    build_covariance(theta, data, noise, kernel, options)
}

/// Full evaluation with the intermediate quantities.
pub fn evaluate_profile(
    theta: ArrayView1<'_, f64>,
    data: &SpatioTemporalData<'_>,
    noise: &NoiseModel<'_>,
    options: &ProfileOptions,
) -> Result<ProfileEvaluation, ProfileError> {
    validate_inputs(theta, data, noise)?;
    warn_if_distances_asymmetric(data.distances);
    let kernel = CovarianceKernel::select(data.nu)?;
    log::debug!(
        "Profile evaluation: n={}, p={}, components={}, kernel={}",
        data.n_obs(),
        data.design.ncols(),
        data.n_components(),
        kernel.name()
    );

    let psi = build_covariance(theta, data, noise, kernel, options)?;
    let factor = psi
        .cholesky(Side::Lower)
        .map_err(ProfileError::NotPositiveDefinite)?;

    let fit = generalized_least_squares(
        &factor,
        data.design,
        data.response,
        options.rank_policy,
    )?;

    let whitened_residuals = factor.solve_vec(&fit.residuals);
    let quad_form = fit.residuals.dot(&whitened_residuals);
    let log_det = factor.log_determinant();
    let mut objective = quad_form + log_det;
    if options.include_normalizing_constant {
        objective += data.n_obs() as f64 * (2.0 * PI).ln();
    }
    if !objective.is_finite() {
        return Err(ProfileError::NonFiniteObjective { quad_form, log_det });
    }

    Ok(ProfileEvaluation {
        objective,
        quad_form,
        log_det,
        beta: fit.beta,
        residuals: fit.residuals,
        gram_rank: fit.rank,
        kernel,
    })
}

/// Objective with a static/roving noise diagonal.
///
/// `theta` holds `J` ranges, then the static and the roving variance.
#[allow(clippy::too_many_arguments)]
pub fn log_profile_heterogeneous<'a>(
    theta: ArrayView1<'_, f64>,
    distances: ArrayView2<'a, f64>,
    response: ArrayView1<'a, f64>,
    design: ArrayView2<'a, f64>,
    subset_static: ArrayView1<'a, f64>,
    loadings: ArrayView2<'a, f64>,
    weights: ArrayView1<'a, f64>,
    nu: f64,
) -> Result<f64, ProfileError> {
    let data = SpatioTemporalData::new(distances, response, design, loadings, weights, nu);
    let noise = NoiseModel::Heterogeneous { subset_static };
    evaluate_profile(theta, &data, &noise, &ProfileOptions::default()).map(|e| e.objective)
}

/// Objective with one nugget shared by all observations.
///
/// `theta` holds `J` ranges, then the nugget variance.
pub fn log_profile_homogeneous<'a>(
    theta: ArrayView1<'_, f64>,
    distances: ArrayView2<'a, f64>,
    response: ArrayView1<'a, f64>,
    design: ArrayView2<'a, f64>,
    loadings: ArrayView2<'a, f64>,
    weights: ArrayView1<'a, f64>,
    nu: f64,
) -> Result<f64, ProfileError> {
    let data = SpatioTemporalData::new(distances, response, design, loadings, weights, nu);
    evaluate_profile(
        theta,
        &data,
        &NoiseModel::Homogeneous,
        &ProfileOptions::default(),
    )
    .map(|e| e.objective)
}

/// Data, noise model and options bundled for an external minimizer.
#[derive(Debug, Clone)]
pub struct ProfileObjective<'a> {
    data: SpatioTemporalData<'a>,
    noise: NoiseModel<'a>,
    options: ProfileOptions,
}

impl<'a> ProfileObjective<'a> {
    pub fn new(data: SpatioTemporalData<'a>, noise: NoiseModel<'a>, options: ProfileOptions) -> Self {
        Self {
            data,
            noise,
            options,
        }
    }

    pub fn n_params(&self) -> usize {
        self.data.expected_theta_len(&self.noise)
    }

    pub fn evaluate(&self, theta: &[f64]) -> Result<ProfileEvaluation, ProfileError> {
        evaluate_profile(
            ArrayView1::from(theta),
            &self.data,
            &self.noise,
            &self.options,
        )
    }

    /// Objective value, or `+inf` when `theta` cannot be evaluated.
    pub fn cost(&self, theta: &[f64]) -> f64 {
        match self.evaluate(theta) {
            Ok(eval) => eval.objective,
            Err(err) => {
                log::debug!("Rejecting trial point {:?}: {}", theta, err);
                f64::INFINITY
            }
        }
    }
}
