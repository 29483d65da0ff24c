//! # Prediction from a fitted model
//!
//! Best linear unbiased prediction at new locations or areal units:
//! `ŷ₀ = x₀ᵀβ̂ + c₀ᵀΣ⁻¹(y − Xβ̂)` with prediction variance
//! `σ₀² − c₀ᵀΣ⁻¹c₀ + dᵀ cov(β̂) d`, `d = x₀ − XᵀΣ⁻¹c₀`.
//!
//! The cross-covariance `c₀` never includes the nugget, so a noiseless
//! geostatistical model reproduces the observed value at an observed location.
//!
//! New areal units are not part of the fitted neighbourhood, so they are
//! predicted from the CAR full conditional at the fitted parameters instead.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::config::{ArealSpec, CovarianceSpec, IntervalKind, PredictionOptions};
use crate::covariance::{GeostatFamily, KernelParams};
use crate::distance::{cross_distances, Coordinate};
use crate::estimate::EstimationError;
use crate::faer_ndarray::FaerCholesky;
use crate::model::{FittedModel, SpatialSupport};
use crate::neighborhood::Neighborhood;
use crate::structure::{car_covariance, CovarianceParameters};

/// Where to predict.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionTargets {
    /// The held-out units of the training data.
    Missing,
    /// New point locations; `predictors` has one column per configured predictor,
    /// without intercept.
    Points {
        predictors: Array2<f64>,
        coordinates: Vec<Coordinate>,
    },
    /// New areal units; `neighbors[k]` lists fitted units adjacent to new unit `k`.
    AreaUnits {
        predictors: Array2<f64>,
        neighbors: Vec<Vec<usize>>,
    },
}

/// Predictions with standard errors and, optionally, interval bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    pub fit: Array1<f64>,
    /// Standard error of a new observation, or of the mean for confidence intervals.
    pub std_error: Array1<f64>,
    pub lower: Option<Array1<f64>>,
    pub upper: Option<Array1<f64>>,
    pub interval: IntervalKind,
    pub level: f64,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.fit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fit.is_empty()
    }
}

/// Covariance blocks needed for prediction at `m` targets.
struct TargetCovariance {
    /// Covariance of the observed units the predictor conditions on (n × n).
    observed: Array2<f64>,
    /// Cross-covariance observed × targets (n × m).
    cross: Array2<f64>,
    /// Marginal variances of the targets.
    marginal: Array1<f64>,
}

impl FittedModel {
    /// Predicts at `targets`. Fails with `InvalidInput` when the targets do
    /// not match the model's support or predictor count.
    pub fn predict(
        &self,
        targets: &PredictionTargets,
        options: &PredictionOptions,
    ) -> Result<Predictions, EstimationError> {
        options
            .validate()
            .map_err(|e| EstimationError::InvalidInput(e.to_string()))?;

        let (fit, std_error) = match (targets, self.support(), self.spec()) {
            (
                PredictionTargets::Missing,
                SpatialSupport::Points(coords),
                CovarianceSpec::Geostatistical(_),
            ) => {
                let held_out: Vec<Coordinate> =
                    self.data().held_out.iter().map(|&i| coords[i]).collect();
                let blocks = self.point_covariance(coords, &held_out)?;
                self.krige(&self.data().x_held_out, &blocks, options.interval)?
            }
            (
                PredictionTargets::Points {
                    predictors,
                    coordinates,
                },
                SpatialSupport::Points(coords),
                CovarianceSpec::Geostatistical(_),
            ) => {
                if coordinates.len() != predictors.nrows() {
                    return Err(EstimationError::InvalidInput(format!(
                        "{} coordinates supplied for {} prediction rows",
                        coordinates.len(),
                        predictors.nrows()
                    )));
                }
                if coordinates.iter().any(|c| !c.is_finite()) {
                    return Err(EstimationError::InvalidInput(
                        "prediction coordinates must be finite".to_string(),
                    ));
                }
                let design = self.design_with_intercept(predictors.view())?;
                let blocks = self.point_covariance(coords, coordinates)?;
                self.krige(&design, &blocks, options.interval)?
            }
            (
                PredictionTargets::Missing,
                SpatialSupport::Areal(neighborhood),
                CovarianceSpec::Areal(spec),
            ) => {
                let blocks = self.areal_covariance(neighborhood, spec, &self.data().held_out)?;
                self.krige(&self.data().x_held_out, &blocks, options.interval)?
            }
            (
                PredictionTargets::AreaUnits {
                    predictors,
                    neighbors,
                },
                SpatialSupport::Areal(neighborhood),
                CovarianceSpec::Areal(spec),
            ) => {
                if neighbors.len() != predictors.nrows() {
                    return Err(EstimationError::InvalidInput(format!(
                        "{} neighbour lists supplied for {} prediction rows",
                        neighbors.len(),
                        predictors.nrows()
                    )));
                }
                let design = self.design_with_intercept(predictors.view())?;
                self.car_conditional(neighborhood, spec, &design, neighbors, options.interval)?
            }
            _ => {
                return Err(EstimationError::InvalidInput(
                    "prediction targets do not match the model's spatial support".to_string(),
                ));
            }
        };

        let (lower, upper) = match options.interval {
            IntervalKind::None => (None, None),
            IntervalKind::Confidence | IntervalKind::Prediction => {
                let z = Normal::new(0.0, 1.0)
                    .map(|d| d.inverse_cdf(1.0 - (1.0 - options.level) / 2.0))
                    .map_err(|e| EstimationError::InvalidInput(e.to_string()))?;
                (Some(&fit - &(&std_error * z)), Some(&fit + &(&std_error * z)))
            }
        };
        log::debug!("Predicted {} targets.", fit.len());

        Ok(Predictions {
            fit,
            std_error,
            lower,
            upper,
            interval: options.interval,
            level: options.level,
        })
    }

    fn design_with_intercept(
        &self,
        predictors: ArrayView2<f64>,
    ) -> Result<Array2<f64>, EstimationError> {
        let p = self.data().n_coefficients();
        if predictors.ncols() + 1 != p {
            return Err(EstimationError::InvalidInput(format!(
                "prediction rows have {} predictors but the model has {}",
                predictors.ncols(),
                p - 1
            )));
        }
        if predictors.iter().any(|v| !v.is_finite()) {
            return Err(EstimationError::InvalidInput(
                "prediction predictors must be finite".to_string(),
            ));
        }
        let mut design = Array2::<f64>::ones((predictors.nrows(), p));
        design.slice_mut(ndarray::s![.., 1..]).assign(&predictors);
        Ok(design)
    }

    fn point_covariance(
        &self,
        coords: &[Coordinate],
        targets: &[Coordinate],
    ) -> Result<TargetCovariance, EstimationError> {
        let CovarianceParameters::Geostatistical {
            nugget,
            partial_sill,
            range,
            smoothness,
        } = *self.parameters()
        else {
            return Err(EstimationError::InvalidInput(
                "point prediction requires a geostatistical model".to_string(),
            ));
        };
        let family = match self.spec() {
            CovarianceSpec::Geostatistical(spec) => spec.family,
            CovarianceSpec::Areal(_) => GeostatFamily::None,
        };
        let mut params = KernelParams::new(partial_sill, range);
        if let Some(nu) = smoothness {
            params = params.with_smoothness(nu);
        }
        let observed: Vec<Coordinate> = self.data().observed.iter().map(|&i| coords[i]).collect();
        let cross = if family.is_spatial() {
            family.evaluate_matrix(&cross_distances(&observed, targets), &params)
        } else {
            Array2::zeros((observed.len(), targets.len()))
        };
        Ok(TargetCovariance {
            observed: self.covariance_matrix().clone(),
            cross,
            marginal: Array1::from_elem(targets.len(), nugget + partial_sill),
        })
    }

    /// Variance given to units without neighbours: `extra` when estimated,
    /// otherwise the largest marginal variance of the fitted units.
    fn isolated_variance(&self, extra: Option<f64>) -> f64 {
        extra.unwrap_or_else(|| {
            self.covariance_matrix()
                .diag()
                .iter()
                .fold(0.0_f64, |acc, &v| acc.max(v))
        })
    }

    /// Blocks of the fitted CAR covariance for the observed units and `targets`.
    fn areal_covariance(
        &self,
        neighborhood: &Neighborhood,
        spec: &ArealSpec,
        targets: &[usize],
    ) -> Result<TargetCovariance, EstimationError> {
        let CovarianceParameters::Car {
            partial_sill,
            rho,
            extra,
        } = *self.parameters()
        else {
            return Err(EstimationError::InvalidInput(
                "areal prediction requires a CAR model".to_string(),
            ));
        };
        let full = car_covariance(
            neighborhood,
            spec.row_standardize,
            partial_sill,
            rho,
            Some(self.isolated_variance(extra)),
        )?;
        let observed = &self.data().observed;
        let observed_block = full.select(Axis(0), observed).select(Axis(1), observed);
        let cross = full.select(Axis(0), observed).select(Axis(1), targets);
        let marginal = Array1::from_shape_fn(targets.len(), |k| full[(targets[k], targets[k])]);
        Ok(TargetCovariance {
            observed: observed_block,
            cross,
            marginal,
        })
    }

    /// Residuals `y − Xβ̂` over every fitted unit. Held-out units take their
    /// kriged residual.
    fn unit_residuals(
        &self,
        neighborhood: &Neighborhood,
        spec: &ArealSpec,
    ) -> Result<Array1<f64>, EstimationError> {
        let data = self.data();
        let mut residuals = Array1::<f64>::zeros(data.n_units());
        for (a, &i) in data.observed.iter().enumerate() {
            residuals[i] = self.residuals()[a];
        }
        if !data.held_out.is_empty() {
            let blocks = self.areal_covariance(neighborhood, spec, &data.held_out)?;
            let weights = blocks
                .observed
                .checked_cholesky()
                .map_err(|e| EstimationError::SingularCovariance(e.to_string()))?
                .solve_mat(&blocks.cross);
            let kriged = weights.t().dot(self.residuals());
            for (b, &i) in data.held_out.iter().enumerate() {
                residuals[i] = kriged[b];
            }
        }
        Ok(residuals)
    }

    /// Design rows of every fitted unit, observed and held out, in unit order.
    fn unit_design(&self) -> Array2<f64> {
        let data = self.data();
        let mut design = Array2::<f64>::zeros((data.n_units(), data.n_coefficients()));
        for (a, &i) in data.observed.iter().enumerate() {
            design.row_mut(i).assign(&data.x.row(a));
        }
        for (b, &i) in data.held_out.iter().enumerate() {
            design.row_mut(i).assign(&data.x_held_out.row(b));
        }
        design
    }

    /// Predicts new areal units from the CAR full conditional at the fitted
    /// parameters: `ŷ₀ = x₀ᵀβ̂ + ρ Σⱼ w₀ⱼ (yⱼ − xⱼᵀβ̂) / s₀` with conditional
    /// variance `σ²/s₀`, where `s₀` is the new unit's weight total under row
    /// standardisation and 1 otherwise. Units without neighbours fall back to
    /// the mean structure and the isolated-unit variance.
    fn car_conditional(
        &self,
        neighborhood: &Neighborhood,
        spec: &ArealSpec,
        design: &Array2<f64>,
        neighbors: &[Vec<usize>],
        interval: IntervalKind,
    ) -> Result<(Array1<f64>, Array1<f64>), EstimationError> {
        let CovarianceParameters::Car {
            partial_sill,
            rho,
            extra,
        } = *self.parameters()
        else {
            return Err(EstimationError::InvalidInput(
                "areal prediction requires a CAR model".to_string(),
            ));
        };
        let n = neighborhood.len();
        let extended = neighborhood.with_new_units(neighbors)?;
        let residuals = self.unit_residuals(neighborhood, spec)?;
        let unit_design = self.unit_design();
        let beta = self.coefficients();
        let coefficient_covariance = self.coefficient_covariance();
        let isolated_variance = self.isolated_variance(extra);

        let m = design.nrows();
        let mut fit = Array1::<f64>::zeros(m);
        let mut std_error = Array1::<f64>::zeros(m);
        for k in 0..m {
            let x0 = design.row(k);
            let links = extended.weights().slice(ndarray::s![n + k, ..n]);
            let total = links.sum();
            let (mean, conditional_variance, d) = if total > 0.0 {
                let (scale, variance) = if spec.row_standardize {
                    (rho / total, partial_sill / total)
                } else {
                    (rho, partial_sill)
                };
                let d = &x0 - &(unit_design.t().dot(&links) * scale);
                (x0.dot(beta) + scale * links.dot(&residuals), variance, d)
            } else {
                (x0.dot(beta), isolated_variance, x0.to_owned())
            };
            let variance = match interval {
                IntervalKind::Confidence => x0.dot(&coefficient_covariance.dot(&x0)),
                IntervalKind::Prediction | IntervalKind::None => {
                    conditional_variance + d.dot(&coefficient_covariance.dot(&d))
                }
            };
            fit[k] = mean;
            std_error[k] = variance.max(0.0).sqrt();
        }
        Ok((fit, std_error))
    }

    /// Universal kriging of `design` rows given the covariance blocks.
    fn krige(
        &self,
        design: &Array2<f64>,
        blocks: &TargetCovariance,
        interval: IntervalKind,
    ) -> Result<(Array1<f64>, Array1<f64>), EstimationError> {
        let x = &self.data().x;
        let factor = blocks
            .observed
            .checked_cholesky()
            .map_err(|e| EstimationError::SingularCovariance(e.to_string()))?;
        let coefficient_covariance = self.coefficient_covariance();
        let weights = factor.solve_mat(&blocks.cross);
        let fit = design.dot(self.coefficients()) + weights.t().dot(self.residuals());

        let m = design.nrows();
        let mut std_error = Array1::<f64>::zeros(m);
        for k in 0..m {
            let x0 = design.row(k);
            let variance = match interval {
                IntervalKind::Confidence => x0.dot(&coefficient_covariance.dot(&x0)),
                IntervalKind::Prediction | IntervalKind::None => {
                    let c0 = blocks.cross.column(k);
                    let w = weights.column(k);
                    let d = &x0 - &x.t().dot(&w);
                    blocks.marginal[k] - c0.dot(&w) + d.dot(&coefficient_covariance.dot(&d))
                }
            };
            std_error[k] = variance.max(0.0).sqrt();
        }
        Ok((fit, std_error))
    }
}
