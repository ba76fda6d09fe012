use approx::{assert_abs_diff_eq, assert_relative_eq};
use faer::Side;
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use stprofile::linalg::faer_ndarray::FaerEigh;
use stprofile::{
    NoiseModel, ProfileError, ProfileObjective, ProfileOptions, RankPolicy, SpatioTemporalData,
    assemble_covariance, evaluate_profile,
};

struct Field {
    distances: Array2<f64>,
    response: Array1<f64>,
    design: Array2<f64>,
    loadings: Array2<f64>,
    weights: Array1<f64>,
}

impl Field {
    fn simulate(n: usize, components: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let coord = Uniform::new(0.0, 5.0).expect("valid bounds");
        let normal = Normal::new(0.0, 1.0).expect("valid normal");
        let sites: Vec<(f64, f64)> = (0..n)
            .map(|_| (coord.sample(&mut rng), coord.sample(&mut rng)))
            .collect();
        let distances = Array2::from_shape_fn((n, n), |(i, k)| {
            let (dx, dy) = (sites[i].0 - sites[k].0, sites[i].1 - sites[k].1);
            (dx * dx + dy * dy).sqrt()
        });
        let design = Array2::from_shape_fn((n, 3), |(i, c)| match c {
            0 => 1.0,
            1 => sites[i].0,
            _ => sites[i].1,
        });
        let loadings = Array2::from_shape_fn((n, components), |(i, j)| {
            if j == 0 {
                1.0
            } else {
                ((j as f64) * sites[i].0 * 0.7).cos() + 0.1 * normal.sample(&mut rng)
            }
        });
        let weights = Array1::from_shape_fn(components, |j| 1.0 / (1.0 + j as f64));
        let response = Array1::from_shape_fn(n, |_| normal.sample(&mut rng))
            + design.dot(&array![0.5, -0.2, 0.1]);
        Self {
            distances,
            response,
            design,
            loadings,
            weights,
        }
    }

    fn data(&self, nu: f64) -> SpatioTemporalData<'_> {
        SpatioTemporalData::new(
            self.distances.view(),
            self.response.view(),
            self.design.view(),
            self.loadings.view(),
            self.weights.view(),
            nu,
        )
    }

    fn random_theta(&self, rng: &mut StdRng, noise_params: usize) -> Array1<f64> {
        let j = self.weights.len();
        Array1::from_shape_fn(j + noise_params, |i| {
            if i < j {
                rng.random_range(0.3..3.0)
            } else {
                rng.random_range(0.05..1.0)
            }
        })
    }
}

fn indicator(n: usize) -> Array1<f64> {
    Array1::from_shape_fn(n, |i| if i % 3 == 0 { 1.0 } else { 0.0 })
}

#[test]
fn assembled_covariance_is_symmetric_for_every_kernel_family() {
    let field = Field::simulate(50, 3, 1);
    let s = indicator(50);
    let mut rng = StdRng::seed_from_u64(2);
    let parallel = ProfileOptions {
        parallel_threshold: 0,
        ..ProfileOptions::default()
    };
    for nu in [0.5, 1.5, 2.7, 12.0] {
        let data = field.data(nu);
        let noise = NoiseModel::Heterogeneous {
            subset_static: s.view(),
        };
        let theta = field.random_theta(&mut rng, 2);
        for opts in [ProfileOptions::serial(), parallel.clone()] {
            let psi = assemble_covariance(theta.view(), &data, &noise, &opts).unwrap();
            for i in 0..50 {
                for k in 0..50 {
                    assert_eq!(psi[[i, k]], psi[[k, i]], "nu={nu} at ({i},{k})");
                }
            }
        }
    }
}

#[test]
fn non_positive_nugget_fails_at_factorization() {
    let mut field = Field::simulate(30, 2, 3);
    let data = field.data(0.5);
    let err = evaluate_profile(
        array![1.0, 2.0, -100.0].view(),
        &data,
        &NoiseModel::Homogeneous,
        &ProfileOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ProfileError::NotPositiveDefinite(_)));
    assert!(err.is_numerical());

    // A site with no temporal loading has no process variance; without a
    // nugget its row of Psi vanishes.
    field.loadings.row_mut(7).fill(0.0);
    let data = field.data(0.5);
    let err = evaluate_profile(
        array![1.0, 2.0, 0.0].view(),
        &data,
        &NoiseModel::Homogeneous,
        &ProfileOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ProfileError::NotPositiveDefinite(_)));
}

#[test]
fn response_in_design_span_has_vanishing_quadratic_form() {
    let mut field = Field::simulate(40, 2, 5);
    field.response = field.design.dot(&array![2.0, -1.0, 0.25]);
    let mut rng = StdRng::seed_from_u64(6);
    for nu in [0.5, 2.5, 20.0] {
        let theta = field.random_theta(&mut rng, 1);
        let eval = evaluate_profile(
            theta.view(),
            &field.data(nu),
            &NoiseModel::Homogeneous,
            &ProfileOptions::default(),
        )
        .unwrap();
        assert!(eval.quad_form.abs() < 1e-12, "quad form {}", eval.quad_form);
        assert!(eval.residuals.iter().all(|r| r.abs() < 1e-9));
        assert_abs_diff_eq!(eval.beta[0], 2.0, epsilon = 1e-8);
        assert_abs_diff_eq!(eval.beta[1], -1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(eval.beta[2], 0.25, epsilon = 1e-8);
    }
}

#[test]
fn log_determinant_matches_eigenvalues() {
    let field = Field::simulate(35, 3, 8);
    let s = indicator(35);
    let noise = NoiseModel::Heterogeneous {
        subset_static: s.view(),
    };
    let mut rng = StdRng::seed_from_u64(9);
    for nu in [0.5, 1.2, 15.0] {
        let data = field.data(nu);
        let theta = field.random_theta(&mut rng, 2);
        let opts = ProfileOptions::default();
        let psi = assemble_covariance(theta.view(), &data, &noise, &opts).unwrap();
        let (eigenvalues, _) = psi.eigh(Side::Lower).unwrap();
        assert!(eigenvalues.iter().all(|&v| v > 0.0));
        let reference: f64 = eigenvalues.iter().map(|v| v.ln()).sum();
        let eval = evaluate_profile(theta.view(), &data, &noise, &opts).unwrap();
        assert_relative_eq!(eval.log_det, reference, max_relative = 1e-10, epsilon = 1e-9);
    }
}

#[test]
fn constant_indicator_matches_single_nugget() {
    let field = Field::simulate(45, 2, 10);
    let data = field.data(1.5);
    let opts = ProfileOptions::default();
    let ranges = [0.8, 1.9];
    let (static_var, roving_var) = (0.35, 0.6);

    let zeros = Array1::<f64>::zeros(45);
    let ones = Array1::<f64>::ones(45);
    let all_roving = evaluate_profile(
        array![ranges[0], ranges[1], static_var, roving_var].view(),
        &data,
        &NoiseModel::Heterogeneous {
            subset_static: zeros.view(),
        },
        &opts,
    )
    .unwrap();
    let all_static = evaluate_profile(
        array![ranges[0], ranges[1], static_var, roving_var].view(),
        &data,
        &NoiseModel::Heterogeneous {
            subset_static: ones.view(),
        },
        &opts,
    )
    .unwrap();

    let nugget = |sigma: f64| {
        evaluate_profile(
            array![ranges[0], ranges[1], sigma].view(),
            &data,
            &NoiseModel::Homogeneous,
            &opts,
        )
        .unwrap()
        .objective
    };
    assert_relative_eq!(all_roving.objective, nugget(roving_var), max_relative = 1e-12);
    assert_relative_eq!(all_static.objective, nugget(static_var), max_relative = 1e-12);
}

#[test]
fn objective_is_continuous_in_smoothness_at_the_exponential_boundary() {
    let field = Field::simulate(30, 2, 12);
    let theta = array![1.1, 0.7, 0.4];
    let at = |nu: f64| {
        evaluate_profile(
            theta.view(),
            &field.data(nu),
            &NoiseModel::Homogeneous,
            &ProfileOptions::default(),
        )
        .unwrap()
        .objective
    };
    let exponential = at(0.5);
    assert_relative_eq!(at(0.5 + 1e-7), exponential, max_relative = 1e-5, epsilon = 1e-5);
}

#[test]
fn optimizer_objective_reads_options_from_json() {
    let field = Field::simulate(20, 2, 14);
    let opts: ProfileOptions =
        serde_json::from_str(r#"{"parallel": false, "include_normalizing_constant": true}"#)
            .unwrap();
    let objective = ProfileObjective::new(field.data(0.5), NoiseModel::Homogeneous, opts);
    let plain = ProfileObjective::new(
        field.data(0.5),
        NoiseModel::Homogeneous,
        ProfileOptions::default(),
    );
    let theta = [1.0, 1.5, 0.3];
    assert_abs_diff_eq!(
        objective.cost(&theta) - plain.cost(&theta),
        20.0 * (2.0 * std::f64::consts::PI).ln(),
        epsilon = 1e-9
    );
    assert_eq!(objective.cost(&[1.0, 1.5, -50.0]), f64::INFINITY);
}

#[test]
fn projected_coordinates_with_large_offset_keep_full_rank() {
    let mut field = Field::simulate(40, 2, 16);
    // Intercept plus an easting with a UTM-sized offset and a 100 m spread.
    field.design = Array2::from_shape_fn((40, 2), |(i, c)| {
        if c == 0 { 1.0 } else { 5.0e6 + 2.5 * i as f64 }
    });
    field.response = field.design.column(1).mapv(|v| v - 5.0e6);
    let theta = array![1.0, 2.0, 0.5];
    for rank_policy in [RankPolicy::PseudoInverse, RankPolicy::Reject] {
        let opts = ProfileOptions {
            rank_policy,
            ..ProfileOptions::default()
        };
        let eval = evaluate_profile(theta.view(), &field.data(0.5), &NoiseModel::Homogeneous, &opts)
            .unwrap();
        assert_eq!(eval.gram_rank, 2);
        assert!(eval.quad_form.abs() < 1e-9, "quad form {}", eval.quad_form);
        assert!(eval.residuals.iter().all(|r| r.abs() < 1e-6));
    }
}
