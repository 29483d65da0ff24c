//! # Covariance parameter estimation by profiled REML
//!
//! Every fit follows the same path regardless of the covariance family:
//!
//! 1.  **Validation:** the response must vary, the design must have full
//!     column rank and point locations must not all coincide.
//! 2.  **Profiling:** for trial correlation parameters `θ`, the GLS
//!     coefficients and the overall variance `σ²` have closed forms, leaving
//!     the restricted (or full) log-likelihood as a function of `θ` alone.
//! 3.  **Search:** a coarse grid over `θ` supplies starting points and BFGS
//!     with central finite-difference gradients refines the best of them.
//!
//! The optimum is then turned into a [`FittedModel`] carrying the covariance
//! matrix, its inverse and Cholesky factor for later diagnostics and prediction.

use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::config::{ArealSpec, EstimationMethod, EstimationSettings, GeostatSpec};
use crate::data::{DataError, TrainingData};
use crate::distance::{distance_matrix, max_distance, Coordinate};
use crate::faer_ndarray::{FaerEigh, FaerLinalgError};
use crate::model::{FittedModel, ModelParts, OptimizerSummary, SpatialSupport};
use crate::neighborhood::{Neighborhood, NeighborhoodError};
use crate::structure::{CarStructure, CovarianceStructure, GeostatStructure};

use faer::Side;
use ndarray::{Array1, Array2};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Largest admissible condition number of the column-scaled `XᵀX`.
const MAX_DESIGN_CONDITION: f64 = 1e12;

/// Number of best grid points BFGS is started from before giving up.
const MAX_SEEDS: usize = 3;

/// Cost reported to the optimizer where the likelihood cannot be evaluated.
const FAILED_COST: f64 = 1e10;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "The design matrix is rank deficient (condition number {condition_number:.3e}). Remove collinear or constant predictors."
    )]
    RankDeficientDesign { condition_number: f64 },

    #[error("The response is constant; there is no variance to model.")]
    ConstantResponse,

    #[error("All observed locations coincide, so a spatial covariance cannot be estimated.")]
    DegenerateDistances,

    #[error(
        "Covariance parameter search did not converge from {attempts} starting points within {max_iterations} iterations each. Last failure: {reason}"
    )]
    NonConvergence {
        attempts: usize,
        max_iterations: usize,
        reason: String,
    },

    #[error("The covariance matrix is not positive definite: {0}")]
    SingularCovariance(String),

    #[error("Neighbourhood error: {0}")]
    Neighborhood(#[from] NeighborhoodError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// Fits a geostatistical linear model. `coordinates` covers every unit of
/// `data`, observed and held out, in unit order.
pub fn fit_geostatistical(
    data: &TrainingData,
    coordinates: &[Coordinate],
    spec: &GeostatSpec,
    settings: &EstimationSettings,
) -> Result<FittedModel, EstimationError> {
    spec.validate()
        .map_err(|e| EstimationError::InvalidInput(e.to_string()))?;
    settings
        .validate()
        .map_err(|e| EstimationError::InvalidInput(e.to_string()))?;
    if coordinates.len() != data.n_units() {
        return Err(EstimationError::InvalidInput(format!(
            "{} coordinates supplied for {} units",
            coordinates.len(),
            data.n_units()
        )));
    }
    if let Some(unit) = coordinates.iter().position(|c| !c.is_finite()) {
        return Err(EstimationError::InvalidInput(format!(
            "coordinate of unit {unit} is not finite"
        )));
    }
    log::info!(
        "Starting {} fit of a '{}' geostatistical model on {} observations.",
        method_name(settings.method),
        spec.family.name(),
        data.n_observed()
    );
    internal::validate_training_data(data)?;

    let observed: Vec<Coordinate> = data.observed.iter().map(|&i| coordinates[i]).collect();
    let distances = distance_matrix(&observed);
    let scale = max_distance(&distances);
    if spec.family.is_spatial() && scale == 0.0 {
        return Err(EstimationError::DegenerateDistances);
    }
    let structure =
        CovarianceStructure::Geostatistical(GeostatStructure::new(*spec, distances, scale));
    internal::estimate(
        data,
        structure,
        settings,
        crate::config::CovarianceSpec::Geostatistical(*spec),
        SpatialSupport::Points(coordinates.to_vec()),
        Vec::new(),
    )
}

/// Fits an areal CAR model. `neighborhood` covers every unit of `data`,
/// observed and held out, in unit order.
pub fn fit_areal(
    data: &TrainingData,
    neighborhood: &Neighborhood,
    spec: &ArealSpec,
    settings: &EstimationSettings,
) -> Result<FittedModel, EstimationError> {
    settings
        .validate()
        .map_err(|e| EstimationError::InvalidInput(e.to_string()))?;
    if neighborhood.len() != data.n_units() {
        return Err(EstimationError::InvalidInput(format!(
            "neighbourhood has {} units but the data has {}",
            neighborhood.len(),
            data.n_units()
        )));
    }
    log::info!(
        "Starting {} fit of a CAR model on {} of {} areal units (row standardised: {}).",
        method_name(settings.method),
        data.n_observed(),
        data.n_units(),
        spec.row_standardize
    );
    internal::validate_training_data(data)?;

    let car = CarStructure::new(spec, neighborhood, &data.observed)?;
    let warnings = car.warnings().to_vec();
    internal::estimate(
        data,
        CovarianceStructure::Car(car),
        settings,
        crate::config::CovarianceSpec::Areal(*spec),
        SpatialSupport::Areal(neighborhood.clone()),
        warnings,
    )
}

fn method_name(method: EstimationMethod) -> &'static str {
    match method {
        EstimationMethod::Reml => "REML",
        EstimationMethod::Ml => "ML",
    }
}

/// Condition number of `XᵀX` after scaling every column to unit length.
pub(crate) fn design_condition_number(x: &Array2<f64>) -> Result<f64, EstimationError> {
    let xtx = x.t().dot(x);
    let diag = xtx.diag().to_owned();
    if diag.iter().any(|&d| !(d > 0.0)) {
        return Ok(f64::INFINITY);
    }
    let scale = diag.mapv(|d| 1.0 / d.sqrt());
    let scaled = Array2::from_shape_fn(xtx.dim(), |(i, j)| xtx[(i, j)] * scale[i] * scale[j]);
    let (eigenvalues, _) = scaled.eigh(Side::Lower)?;
    let min = eigenvalues.iter().fold(f64::INFINITY, |acc, &v| acc.min(v));
    let max = eigenvalues.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    if min <= 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(max / min)
}

/// Internal module for estimation logic.
mod internal {
    use super::*;
    use crate::faer_ndarray::FaerCholesky;
    use ahash::AHashMap;
    use std::cell::RefCell;

    pub(super) fn validate_training_data(data: &TrainingData) -> Result<(), EstimationError> {
        let (min, max) = data
            .y
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let magnitude = min.abs().max(max.abs()).max(1.0);
        if max - min <= 1e-12 * magnitude {
            return Err(EstimationError::ConstantResponse);
        }
        let condition_number = design_condition_number(&data.x)?;
        if !(condition_number <= MAX_DESIGN_CONDITION) {
            return Err(EstimationError::RankDeficientDesign { condition_number });
        }
        log::debug!(
            "Design has {} columns with scaled condition number {:.3e}.",
            data.x.ncols(),
            condition_number
        );
        Ok(())
    }

    /// Closed-form profile of one trial `θ`.
    #[derive(Clone, Debug)]
    pub(super) struct Profile {
        pub(super) minus_two_loglik: f64,
        pub(super) sigma2: f64,
    }

    /// Holds the state for the outer optimization over `θ`.
    pub(super) struct RemlState {
        y: Array1<f64>,
        x: Array2<f64>,
        structure: CovarianceStructure,
        method: EstimationMethod,
        workspace: RefCell<Array2<f64>>,
        cache: RefCell<AHashMap<Vec<u64>, Profile>>,
        best: RefCell<Option<(f64, Array1<f64>)>>,
    }

    impl RemlState {
        pub(super) fn new(
            y: Array1<f64>,
            x: Array2<f64>,
            structure: CovarianceStructure,
            method: EstimationMethod,
        ) -> Self {
            let n = y.len();
            Self {
                y,
                x,
                structure,
                method,
                workspace: RefCell::new(Array2::zeros((n, n))),
                cache: RefCell::new(AHashMap::new()),
                best: RefCell::new(None),
            }
        }

        pub(super) fn structure(&self) -> &CovarianceStructure {
            &self.structure
        }

        /// Degrees of freedom of the profiled variance.
        fn dof(&self) -> f64 {
            let n = self.y.len();
            match self.method {
                EstimationMethod::Reml => (n - self.x.ncols()) as f64,
                EstimationMethod::Ml => n as f64,
            }
        }

        /// Profiles `β` and `σ²` out of the likelihood at `theta`, caching the result.
        pub(super) fn profile(&self, theta: &Array1<f64>) -> Result<Profile, EstimationError> {
            let key: Vec<u64> = theta.iter().map(|&v| v.to_bits()).collect();
            if let Some(cached) = self.cache.borrow().get(&key) {
                return Ok(cached.clone());
            }

            let mut r = self.workspace.borrow_mut();
            self.structure.fill_correlation(theta, &mut r)?;
            let factor = r
                .checked_cholesky()
                .map_err(|e| EstimationError::SingularCovariance(e.to_string()))?;
            drop(r);
            let rinv_x = factor.solve_mat(&self.x);
            let rinv_y = factor.solve_vec(&self.y);
            let xt_rinv_x = self.x.t().dot(&rinv_x);
            let gram = xt_rinv_x
                .checked_cholesky()
                .map_err(|e| EstimationError::SingularCovariance(e.to_string()))?;
            let beta = gram.solve_vec(&self.x.t().dot(&rinv_y));
            let quadratic = self.y.dot(&rinv_y) - beta.dot(&rinv_x.t().dot(&self.y));

            let dof = self.dof();
            let sigma2 = quadratic / dof;
            if !(sigma2.is_finite() && sigma2 > 0.0) {
                return Err(EstimationError::SingularCovariance(format!(
                    "profiled variance is {sigma2:e}"
                )));
            }
            let ln_2pi = (2.0 * std::f64::consts::PI).ln();
            let mut minus_two_loglik = dof * sigma2.ln() + factor.log_det() + dof * (1.0 + ln_2pi);
            if self.method == EstimationMethod::Reml {
                minus_two_loglik += gram.log_det();
            }
            let profile = Profile {
                minus_two_loglik,
                sigma2,
            };

            let cost = 0.5 * minus_two_loglik;
            let mut best = self.best.borrow_mut();
            if best.as_ref().is_none_or(|(value, _)| cost < *value) {
                *best = Some((cost, theta.clone()));
            }
            self.cache.borrow_mut().insert(key, profile.clone());
            Ok(profile)
        }

        /// Negative log-likelihood at `theta`.
        pub(super) fn compute_cost(&self, theta: &Array1<f64>) -> Result<f64, EstimationError> {
            Ok(0.5 * self.profile(theta)?.minus_two_loglik)
        }

        /// Central finite-difference gradient of [`Self::compute_cost`],
        /// falling back to a one-sided difference next to an infeasible region.
        pub(super) fn compute_gradient(&self, theta: &Array1<f64>) -> Array1<f64> {
            let centre = self.compute_cost(theta).ok();
            let mut grad = Array1::zeros(theta.len());
            for k in 0..theta.len() {
                let step = 1e-5 * theta[k].abs().max(1.0);
                let mut forward = theta.clone();
                forward[k] += step;
                let mut backward = theta.clone();
                backward[k] -= step;
                let up = self.compute_cost(&forward).ok();
                let down = self.compute_cost(&backward).ok();
                grad[k] = match (up, down, centre) {
                    (Some(u), Some(d), _) => (u - d) / (2.0 * step),
                    (Some(u), None, Some(c)) => (u - c) / step,
                    (None, Some(d), Some(c)) => (c - d) / step,
                    _ => 0.0,
                };
            }
            grad
        }

        pub(super) fn take_best(&self) -> Option<(f64, Array1<f64>)> {
            self.best.borrow_mut().take()
        }
    }

    /// Grid points ordered by cost, keeping those where the likelihood exists.
    fn rank_seeds(state: &RemlState) -> Vec<(f64, Array1<f64>)> {
        let mut seeds: Vec<(f64, Array1<f64>)> = state
            .structure()
            .initial_grid()
            .into_iter()
            .filter_map(|theta| match state.compute_cost(&theta) {
                Ok(cost) if cost.is_finite() => Some((cost, theta)),
                Ok(_) => None,
                Err(e) => {
                    log::debug!("Rejected starting point {:?}: {}", theta.to_vec(), e);
                    None
                }
            })
            .collect();
        seeds.sort_by(|a, b| a.0.total_cmp(&b.0));
        seeds
    }

    /// Runs BFGS from the best seeds in order and returns the first optimum.
    fn optimize(
        state: &Arc<RemlState>,
        settings: &EstimationSettings,
    ) -> Result<(Array1<f64>, OptimizerSummary), EstimationError> {
        let seeds = rank_seeds(state);
        if seeds.is_empty() {
            return Err(EstimationError::SingularCovariance(
                "the covariance matrix is singular at every starting point".to_string(),
            ));
        }
        log::debug!(
            "{} feasible starting points, best cost {:.6}.",
            seeds.len(),
            seeds[0].0
        );

        let mut reason = String::new();
        let attempts = seeds.len().min(MAX_SEEDS);
        let evaluations = Arc::new(AtomicUsize::new(0));
        for (attempt, (seed_cost, seed)) in seeds.into_iter().take(MAX_SEEDS).enumerate() {
            log::debug!(
                "BFGS attempt {} from {:?} (cost {:.6}).",
                attempt + 1,
                seed.to_vec(),
                seed_cost
            );
            state.take_best();

            let state_for_closure = state.clone();
            let counter = evaluations.clone();
            let cost_and_grad = move |theta_bfgs: &Array1<f64>| -> (f64, Array1<f64>) {
                counter.fetch_add(1, Ordering::Relaxed);
                // Keep the search away from the saturated ends of the transforms.
                let safe_theta = theta_bfgs.mapv(|v| v.clamp(-20.0, 20.0));
                let cost = match state_for_closure.compute_cost(&safe_theta) {
                    Ok(cost) if cost.is_finite() => cost,
                    Ok(_) | Err(_) => FAILED_COST,
                };
                let grad = state_for_closure.compute_gradient(&safe_theta);
                (cost, grad)
            };

            match Bfgs::new(seed, cost_and_grad)
                .with_tolerance(settings.tolerance)
                .with_max_iterations(settings.max_iterations)
                .run()
            {
                Ok(BfgsSolution {
                    final_point,
                    final_value,
                    iterations,
                    ..
                }) if final_value.is_finite() && final_value < FAILED_COST => {
                    log::debug!(
                        "BFGS converged in {} iterations with cost {:.6}.",
                        iterations,
                        final_value
                    );
                    let theta = final_point.mapv(|v| v.clamp(-20.0, 20.0));
                    return Ok((
                        theta,
                        OptimizerSummary {
                            iterations: Some(iterations),
                            evaluations: evaluations.load(Ordering::Relaxed),
                            attempts: attempt + 1,
                            converged: true,
                        },
                    ));
                }
                Ok(solution) => {
                    reason = format!("optimum has infeasible cost {}", solution.final_value);
                }
                Err(e) => {
                    // The line search can stall at a stationary point; accept it
                    // when the gradient there meets the stopping rule.
                    if let Some((cost, theta)) = state.take_best() {
                        let grad = state.compute_gradient(&theta);
                        let norm = grad.dot(&grad).sqrt();
                        if norm <= settings.tolerance.sqrt() * (1.0 + cost.abs()) {
                            log::debug!(
                                "BFGS stopped early ({:?}) at a stationary point with gradient norm {:.3e}.",
                                e,
                                norm
                            );
                            return Ok((
                                theta,
                                OptimizerSummary {
                                    iterations: None,
                                    evaluations: evaluations.load(Ordering::Relaxed),
                                    attempts: attempt + 1,
                                    converged: true,
                                },
                            ));
                        }
                    }
                    log::warn!("BFGS attempt {} failed: {:?}", attempt + 1, e);
                    reason = format!("{e:?}");
                }
            }
        }

        Err(EstimationError::NonConvergence {
            attempts,
            max_iterations: settings.max_iterations,
            reason,
        })
    }

    /// Full estimation pipeline for a prepared covariance structure.
    pub(super) fn estimate(
        data: &TrainingData,
        structure: CovarianceStructure,
        settings: &EstimationSettings,
        spec: crate::config::CovarianceSpec,
        support: SpatialSupport,
        warnings: Vec<crate::neighborhood::IsolatedUnitWarning>,
    ) -> Result<FittedModel, EstimationError> {
        let state = Arc::new(RemlState::new(
            data.y.clone(),
            data.x.clone(),
            structure,
            settings.method,
        ));

        let (theta, summary) = if state.structure().n_free() == 0 {
            log::debug!("No free correlation parameters; the profile is closed-form.");
            (
                Array1::zeros(0),
                OptimizerSummary {
                    iterations: Some(0),
                    evaluations: 0,
                    attempts: 0,
                    converged: true,
                },
            )
        } else {
            optimize(&state, settings)?
        };

        let profile = state.profile(&theta)?;
        let parameters = state.structure().parameters(&theta, profile.sigma2);
        let n_free = state.structure().n_free();

        let mut correlation = Array2::zeros((data.n_observed(), data.n_observed()));
        state
            .structure()
            .fill_correlation(&theta, &mut correlation)?;
        let covariance = correlation * profile.sigma2;
        let factor = covariance
            .checked_cholesky()
            .map_err(|e| EstimationError::SingularCovariance(e.to_string()))?;
        let covariance_inverse = factor.inverse();
        let sinv_x = covariance_inverse.dot(&data.x);
        let coefficient_covariance = data
            .x
            .t()
            .dot(&sinv_x)
            .checked_cholesky()
            .map_err(|e| EstimationError::SingularCovariance(e.to_string()))?
            .inverse();
        let coefficients = coefficient_covariance.dot(&sinv_x.t().dot(&data.y));

        let log_likelihood = -0.5 * profile.minus_two_loglik;
        log::info!(
            "Fit finished: log-likelihood {:.4}, sigma^2 {:.6}, parameters {:?}",
            log_likelihood,
            profile.sigma2,
            parameters
        );

        Ok(FittedModel::from_parts(ModelParts {
            spec,
            method: settings.method,
            data: data.clone(),
            support,
            coefficients,
            coefficient_covariance,
            parameters,
            covariance,
            covariance_inverse,
            cholesky_lower: factor.lower(),
            log_likelihood,
            // σ² is always estimated alongside the free correlation parameters.
            n_covariance_parameters: n_free + 1,
            optimizer: summary,
            warnings,
        }))
    }

    #[cfg(test)]
    pub(super) fn state_for_tests(
        data: &TrainingData,
        structure: CovarianceStructure,
        method: EstimationMethod,
    ) -> RemlState {
        RemlState::new(data.y.clone(), data.x.clone(), structure, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeostatSpec, NuggetSpec};
    use crate::covariance::GeostatFamily;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn line_data(n: usize) -> (TrainingData, Vec<Coordinate>) {
        let predictors = Array2::from_shape_fn((n, 1), |(i, _)| (i as f64 * 0.37).sin());
        let response: Vec<Option<f64>> = (0..n)
            .map(|i| Some(1.0 + 2.0 * predictors[(i, 0)] + ((i * 7) % 5) as f64 * 0.1))
            .collect();
        let data = TrainingData::new(predictors.view(), &response, &["s"]).unwrap();
        let coords = (0..n).map(|i| Coordinate::new(i as f64, 0.0)).collect();
        (data, coords)
    }

    #[test]
    fn constant_response_is_rejected() {
        let predictors = Array2::from_shape_fn((6, 1), |(i, _)| i as f64);
        let response = vec![Some(2.0); 6];
        let data = TrainingData::new(predictors.view(), &response, &["a"]).unwrap();
        let coords: Vec<Coordinate> = (0..6).map(|i| Coordinate::new(i as f64, 1.0)).collect();
        let result = fit_geostatistical(
            &data,
            &coords,
            &GeostatSpec::new(GeostatFamily::Exponential),
            &EstimationSettings::default(),
        );
        assert!(matches!(result, Err(EstimationError::ConstantResponse)));
    }

    #[test]
    fn collinear_predictors_are_rejected() {
        let predictors = Array2::from_shape_fn((8, 2), |(i, j)| (i as f64) * (j as f64 + 1.0));
        let response: Vec<Option<f64>> = (0..8).map(|i| Some((i * i) as f64)).collect();
        let data = TrainingData::new(predictors.view(), &response, &["a", "b"]).unwrap();
        let coords: Vec<Coordinate> = (0..8).map(|i| Coordinate::new(0.0, i as f64)).collect();
        let result = fit_geostatistical(
            &data,
            &coords,
            &GeostatSpec::new(GeostatFamily::Exponential),
            &EstimationSettings::default(),
        );
        assert!(matches!(
            result,
            Err(EstimationError::RankDeficientDesign { .. })
        ));
    }

    #[test]
    fn coincident_locations_are_degenerate() {
        let (data, _) = line_data(6);
        let coords = vec![Coordinate::new(3.0, 3.0); 6];
        let result = fit_geostatistical(
            &data,
            &coords,
            &GeostatSpec::new(GeostatFamily::Gaussian),
            &EstimationSettings::default(),
        );
        assert!(matches!(result, Err(EstimationError::DegenerateDistances)));

        let none = fit_geostatistical(
            &data,
            &coords,
            &GeostatSpec::new(GeostatFamily::None),
            &EstimationSettings::default(),
        );
        assert!(none.is_ok());
    }

    #[test]
    fn coordinate_count_must_match_units() {
        let (data, coords) = line_data(6);
        let result = fit_geostatistical(
            &data,
            &coords[..5],
            &GeostatSpec::new(GeostatFamily::Exponential),
            &EstimationSettings::default(),
        );
        assert!(matches!(result, Err(EstimationError::InvalidInput(_))));
    }

    #[test]
    fn profile_matches_ols_for_independent_errors() {
        let (data, coords) = line_data(12);
        let observed: Vec<Coordinate> = data.observed.iter().map(|&i| coords[i]).collect();
        let distances = distance_matrix(&observed);
        let structure = CovarianceStructure::Geostatistical(GeostatStructure::new(
            GeostatSpec {
                family: GeostatFamily::None,
                nugget: NuggetSpec::Estimate,
                range: None,
            },
            distances,
            11.0,
        ));
        let state = internal::state_for_tests(&data, structure, EstimationMethod::Ml);
        let profile = state.profile(&Array1::zeros(0)).unwrap();

        // OLS residual sum of squares by normal equations
        let xtx = data.x.t().dot(&data.x);
        let xty = data.x.t().dot(&data.y);
        let det = xtx[(0, 0)] * xtx[(1, 1)] - xtx[(0, 1)] * xtx[(1, 0)];
        let beta = array![
            (xtx[(1, 1)] * xty[0] - xtx[(0, 1)] * xty[1]) / det,
            (xtx[(0, 0)] * xty[1] - xtx[(1, 0)] * xty[0]) / det
        ];
        let residuals = &data.y - &data.x.dot(&beta);
        let rss = residuals.dot(&residuals);
        assert_abs_diff_eq!(profile.sigma2, rss / 12.0, epsilon = 1e-10);

        let n = 12.0;
        let expected = n * (rss / n).ln() + n * (1.0 + (2.0 * std::f64::consts::PI).ln());
        assert_abs_diff_eq!(profile.minus_two_loglik, expected, epsilon = 1e-8);
    }

    #[test]
    fn exponential_fit_converges() {
        let (data, coords) = line_data(15);
        let settings = EstimationSettings::default();
        let fitted = fit_geostatistical(
            &data,
            &coords,
            &GeostatSpec::new(GeostatFamily::Exponential),
            &settings,
        )
        .unwrap();
        let summary = fitted.optimizer_summary();
        assert!(summary.converged);
        assert!(summary.attempts >= 1);
        assert!(summary.evaluations > 0);
        assert!(summary
            .iterations
            .is_none_or(|iterations| iterations <= settings.max_iterations));
        assert!(fitted.log_likelihood().is_finite());
    }

    #[test]
    fn closed_form_fit_reports_no_search() {
        let (data, coords) = line_data(10);
        let fitted = fit_geostatistical(
            &data,
            &coords,
            &GeostatSpec::new(GeostatFamily::None),
            &EstimationSettings::default(),
        )
        .unwrap();
        let summary = fitted.optimizer_summary();
        assert!(summary.converged);
        assert_eq!(summary.iterations, Some(0));
        assert_eq!(summary.evaluations, 0);
        assert_eq!(summary.attempts, 0);
    }

    #[test]
    fn condition_number_of_orthogonal_design_is_one() {
        let x = array![[1.0, 1.0], [1.0, -1.0], [1.0, 1.0], [1.0, -1.0]];
        assert_abs_diff_eq!(design_condition_number(&x).unwrap(), 1.0, epsilon = 1e-10);
    }
}
