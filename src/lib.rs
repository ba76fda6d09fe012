#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

//! Concentrated Gaussian-process likelihood for separable spatio-temporal
//! models: `Psi = sum_j lambda_j K(D; theta_j) ⊙ phi_j phi_j' + diag(noise)`,
//! GLS elimination of the mean and `r' Psi^-1 r + ln det Psi`.

pub mod covariance;
pub mod gls;
pub mod kernel;
pub mod linalg;
pub mod profile;
pub mod types;

pub use covariance::{NoiseModel, add_noise_diagonal, component_covariance, process_covariance};
pub use gls::{GlsError, GlsFit, generalized_least_squares};
pub use kernel::{CovarianceKernel, EXPONENTIAL_NU, GAUSSIAN_NU_THRESHOLD, KernelError};
pub use profile::{
    DEFAULT_SMOOTHNESS, ProfileError, ProfileEvaluation, ProfileObjective, SpatioTemporalData,
    assemble_covariance, evaluate_profile, log_profile_heterogeneous, log_profile_homogeneous,
    validate_inputs,
};
pub use types::{ProfileOptions, RankPolicy};
