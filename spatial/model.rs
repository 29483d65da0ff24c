use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::sync::OnceLock;

use crate::config::{CovarianceSpec, EstimationMethod};
use crate::data::TrainingData;
use crate::distance::Coordinate;
use crate::faer_ndarray::forward_substitute;
use crate::neighborhood::{IsolatedUnitWarning, Neighborhood};
use crate::structure::CovarianceParameters;

/// Observations with `1 − hᵢᵢ` at or below this are treated as having leverage one.
const LEVERAGE_ONE_TOLERANCE: f64 = 1e-10;

// --- Public Data Structures ---
// These structs define the human-readable output of a fitted model and all
// serialize with serde for export.

/// Where the units of a fit live: point locations or areal units of a neighbourhood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialSupport {
    Points(Vec<Coordinate>),
    Areal(Neighborhood),
}

/// How the covariance parameter search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerSummary {
    /// BFGS iterations of the successful attempt. `None` when the search
    /// stopped early and its best point was accepted as stationary.
    pub iterations: Option<usize>,
    /// Cost and gradient evaluations over all attempts.
    pub evaluations: usize,
    /// Starting points tried, including the successful one.
    pub attempts: usize,
    pub converged: bool,
}

/// One fixed-effect coefficient. The z statistic and p-value use the standard
/// normal reference distribution and are large-sample approximations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRow {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z_value: f64,
    pub p_value: f64,
}

/// One covariance parameter; `estimated` is false for fixed or implied values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRow {
    pub name: String,
    pub value: f64,
    pub estimated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitStatistics {
    pub method: EstimationMethod,
    /// Number of observations used in estimation.
    pub n: usize,
    /// Number of fixed-effect coefficients.
    pub p: usize,
    /// Number of estimated parameters entering the information criteria.
    pub k: usize,
    pub log_likelihood: f64,
    pub minus_two_loglik: f64,
    pub aic: f64,
    pub aicc: f64,
}

/// Share of the total variability attributed to one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponent {
    pub name: String,
    pub proportion: f64,
}

/// Leave-one-out predictions at the observed units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveOneOut {
    pub predictions: Array1<f64>,
    pub std_errors: Array1<f64>,
    /// Mean squared prediction error.
    pub mspe: f64,
}

/// Everything the estimator hands over to build a [`FittedModel`].
pub(crate) struct ModelParts {
    pub(crate) spec: CovarianceSpec,
    pub(crate) method: EstimationMethod,
    pub(crate) data: TrainingData,
    pub(crate) support: SpatialSupport,
    pub(crate) coefficients: Array1<f64>,
    pub(crate) coefficient_covariance: Array2<f64>,
    pub(crate) parameters: CovarianceParameters,
    pub(crate) covariance: Array2<f64>,
    pub(crate) covariance_inverse: Array2<f64>,
    pub(crate) cholesky_lower: Array2<f64>,
    pub(crate) log_likelihood: f64,
    pub(crate) n_covariance_parameters: usize,
    pub(crate) optimizer: OptimizerSummary,
    pub(crate) warnings: Vec<IsolatedUnitWarning>,
}

#[derive(Debug, Clone)]
struct Diagnostics {
    standardized_residuals: Array1<f64>,
    leverage: Array1<f64>,
}

/// A fitted spatial linear model. Parameters are immutable once estimated;
/// derived quantities are computed on first use and cached.
#[derive(Debug, Clone)]
pub struct FittedModel {
    spec: CovarianceSpec,
    method: EstimationMethod,
    data: TrainingData,
    support: SpatialSupport,
    coefficients: Array1<f64>,
    coefficient_covariance: Array2<f64>,
    parameters: CovarianceParameters,
    covariance: Array2<f64>,
    covariance_inverse: Array2<f64>,
    cholesky_lower: Array2<f64>,
    log_likelihood: f64,
    n_covariance_parameters: usize,
    optimizer: OptimizerSummary,
    warnings: Vec<IsolatedUnitWarning>,
    fitted: OnceLock<Array1<f64>>,
    residuals: OnceLock<Array1<f64>>,
    diagnostics: OnceLock<Diagnostics>,
}

impl FittedModel {
    pub(crate) fn from_parts(parts: ModelParts) -> Self {
        Self {
            spec: parts.spec,
            method: parts.method,
            data: parts.data,
            support: parts.support,
            coefficients: parts.coefficients,
            coefficient_covariance: parts.coefficient_covariance,
            parameters: parts.parameters,
            covariance: parts.covariance,
            covariance_inverse: parts.covariance_inverse,
            cholesky_lower: parts.cholesky_lower,
            log_likelihood: parts.log_likelihood,
            n_covariance_parameters: parts.n_covariance_parameters,
            optimizer: parts.optimizer,
            warnings: parts.warnings,
            fitted: OnceLock::new(),
            residuals: OnceLock::new(),
            diagnostics: OnceLock::new(),
        }
    }

    pub fn spec(&self) -> &CovarianceSpec {
        &self.spec
    }

    pub fn method(&self) -> EstimationMethod {
        self.method
    }

    pub fn data(&self) -> &TrainingData {
        &self.data
    }

    pub fn support(&self) -> &SpatialSupport {
        &self.support
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    /// `cov(β̂) = (XᵀΣ⁻¹X)⁻¹` at the estimated covariance.
    pub fn coefficient_covariance(&self) -> &Array2<f64> {
        &self.coefficient_covariance
    }

    pub fn parameters(&self) -> &CovarianceParameters {
        &self.parameters
    }

    /// Covariance matrix `Σ` of the observed units.
    pub fn covariance_matrix(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn covariance_inverse(&self) -> &Array2<f64> {
        &self.covariance_inverse
    }

    /// Lower Cholesky factor `L` with `Σ = L Lᵀ`.
    pub fn cholesky_lower(&self) -> &Array2<f64> {
        &self.cholesky_lower
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn optimizer_summary(&self) -> &OptimizerSummary {
        &self.optimizer
    }

    /// Non-fatal notices raised while fitting, such as units without neighbours.
    pub fn warnings(&self) -> &[IsolatedUnitWarning] {
        &self.warnings
    }

    pub fn fitted_values(&self) -> &Array1<f64> {
        self.fitted.get_or_init(|| self.data.x.dot(&self.coefficients))
    }

    pub fn residuals(&self) -> &Array1<f64> {
        self.residuals
            .get_or_init(|| &self.data.y - self.fitted_values())
    }

    pub fn coefficient_table(&self) -> Vec<CoefficientRow> {
        let normal = Normal::new(0.0, 1.0).ok();
        self.data
            .terms
            .iter()
            .enumerate()
            .map(|(j, term)| {
                let estimate = self.coefficients[j];
                let std_error = self.coefficient_covariance[(j, j)].max(0.0).sqrt();
                let z_value = estimate / std_error;
                let p_value = normal
                    .as_ref()
                    .map_or(f64::NAN, |d| 2.0 * (1.0 - d.cdf(z_value.abs())));
                CoefficientRow {
                    term: term.clone(),
                    estimate,
                    std_error,
                    z_value,
                    p_value,
                }
            })
            .collect()
    }

    pub fn covariance_table(&self) -> Vec<ParameterRow> {
        let row = |name: &str, value: f64, estimated: bool| ParameterRow {
            name: name.to_string(),
            value,
            estimated,
        };
        match (&self.parameters, &self.spec) {
            (
                CovarianceParameters::Geostatistical {
                    nugget,
                    partial_sill,
                    range,
                    smoothness,
                },
                CovarianceSpec::Geostatistical(spec),
            ) => {
                let spatial = spec.family.is_spatial();
                let nugget_free = spatial && spec.nugget == crate::config::NuggetSpec::Estimate;
                let mut rows = vec![
                    row("partial_sill", *partial_sill, spatial),
                    row("nugget", *nugget, nugget_free || !spatial),
                    row("range", *range, spatial && spec.range.is_none()),
                ];
                if let Some(nu) = smoothness {
                    rows.push(row("smoothness", *nu, spec.family.estimates_smoothness()));
                }
                rows
            }
            (
                CovarianceParameters::Car {
                    partial_sill,
                    rho,
                    extra,
                },
                _,
            ) => {
                let mut rows = vec![
                    row("partial_sill", *partial_sill, true),
                    row("rho", *rho, true),
                ];
                if let Some(extra) = extra {
                    rows.push(row("extra", *extra, true));
                }
                rows
            }
            (parameters, _) => vec![row("total_variance", parameters.total_variance(), true)],
        }
    }

    pub fn fit_statistics(&self) -> FitStatistics {
        let n = self.data.n_observed();
        let p = self.data.n_coefficients();
        let (k, effective_n) = match self.method {
            EstimationMethod::Reml => (self.n_covariance_parameters, n - p),
            EstimationMethod::Ml => (self.n_covariance_parameters + p, n),
        };
        let minus_two_loglik = -2.0 * self.log_likelihood;
        let aic = minus_two_loglik + 2.0 * k as f64;
        let denominator = effective_n as f64 - k as f64 - 1.0;
        let aicc = if denominator > 0.0 {
            aic + 2.0 * (k * (k + 1)) as f64 / denominator
        } else {
            f64::INFINITY
        };
        FitStatistics {
            method: self.method,
            n,
            p,
            k,
            log_likelihood: self.log_likelihood,
            minus_two_loglik,
            aic,
            aicc,
        }
    }

    fn diagnostics(&self) -> &Diagnostics {
        self.diagnostics.get_or_init(|| {
            // Whitened quantities: e* = L⁻¹r and X* = L⁻¹X.
            let whitened_residuals = forward_substitute(&self.cholesky_lower, self.residuals());
            let p = self.data.n_coefficients();
            let n = self.data.n_observed();
            let mut whitened_x = Array2::<f64>::zeros((n, p));
            for j in 0..p {
                let column = self.data.x.column(j).to_owned();
                whitened_x
                    .column_mut(j)
                    .assign(&forward_substitute(&self.cholesky_lower, &column));
            }
            let projected = whitened_x.dot(&self.coefficient_covariance);
            let leverage = Array1::from_shape_fn(n, |i| {
                projected.row(i).dot(&whitened_x.row(i)).clamp(0.0, 1.0)
            });
            let standardized_residuals = Array1::from_shape_fn(n, |i| {
                let room = 1.0 - leverage[i];
                if room > LEVERAGE_ONE_TOLERANCE {
                    whitened_residuals[i] / room.sqrt()
                } else {
                    f64::NAN
                }
            });
            Diagnostics {
                standardized_residuals,
                leverage,
            }
        })
    }

    /// Cholesky-whitened residuals divided by `√(1 − hᵢᵢ)`; `NaN` where the
    /// leverage is one.
    pub fn standardized_residuals(&self) -> &Array1<f64> {
        &self.diagnostics().standardized_residuals
    }

    /// Diagonal of the hat matrix of the whitened regression.
    pub fn leverage(&self) -> &Array1<f64> {
        &self.diagnostics().leverage
    }

    /// Cook's distance of every observation. Undefined (`NaN`) where the
    /// leverage is one, since the observation is then fitted exactly.
    pub fn cooks_distance(&self) -> Array1<f64> {
        let p = self.data.n_coefficients() as f64;
        let diagnostics = self.diagnostics();
        ndarray::Zip::from(&diagnostics.standardized_residuals)
            .and(&diagnostics.leverage)
            .map_collect(|&r, &h| {
                let room = 1.0 - h;
                if room > LEVERAGE_ONE_TOLERANCE {
                    r * r * h / (p * room)
                } else {
                    f64::NAN
                }
            })
    }

    /// Generalized R²: one minus the ratio of the GLS residual quadratic form
    /// to that of the intercept-only model under the same covariance.
    pub fn pseudo_r_squared(&self) -> f64 {
        if self.data.n_coefficients() == 1 {
            return 0.0;
        }
        let sinv = &self.covariance_inverse;
        let ones = Array1::<f64>::ones(self.data.n_observed());
        let sinv_ones = sinv.dot(&ones);
        let mean = sinv_ones.dot(&self.data.y) / sinv_ones.dot(&ones);
        let null_residuals = self.data.y.mapv(|v| v - mean);
        let null_form = null_residuals.dot(&sinv.dot(&null_residuals));
        let residuals = self.residuals();
        let full_form = residuals.dot(&sinv.dot(residuals));
        if null_form > 0.0 {
            1.0 - full_form / null_form
        } else {
            0.0
        }
    }

    /// Proportions of variability explained by the covariates, the spatially
    /// dependent errors and the independent errors. They sum to one.
    pub fn variance_components(&self) -> Vec<VarianceComponent> {
        let explained = self.pseudo_r_squared().clamp(0.0, 1.0);
        let remaining = 1.0 - explained;
        let component = |name: &str, proportion: f64| VarianceComponent {
            name: name.to_string(),
            proportion,
        };
        let mut components = vec![component("covariates", explained)];
        match self.parameters {
            CovarianceParameters::Geostatistical {
                nugget,
                partial_sill,
                ..
            } => {
                let total = nugget + partial_sill;
                components.push(component("dependent", remaining * partial_sill / total));
                components.push(component("independent", remaining * nugget / total));
            }
            CovarianceParameters::Car { .. } => {
                components.push(component("dependent", remaining));
            }
        }
        components
    }

    /// Leave-one-out predictions with the covariance parameters held fixed,
    /// using `P = Σ⁻¹ − Σ⁻¹X cov(β̂) XᵀΣ⁻¹`: the left-out residual is
    /// `(Py)ᵢ / Pᵢᵢ` and its variance `1 / Pᵢᵢ`.
    pub fn loocv(&self) -> LeaveOneOut {
        let sinv = &self.covariance_inverse;
        let sinv_x = sinv.dot(&self.data.x);
        let projection = sinv - &sinv_x.dot(&self.coefficient_covariance).dot(&sinv_x.t());
        let py = projection.dot(&self.data.y);
        let n = self.data.n_observed();
        let mut predictions = Array1::<f64>::zeros(n);
        let mut std_errors = Array1::<f64>::zeros(n);
        for i in 0..n {
            let pii = projection[(i, i)];
            predictions[i] = self.data.y[i] - py[i] / pii;
            std_errors[i] = (1.0 / pii).sqrt();
        }
        let mspe = (&self.data.y - &predictions)
            .mapv(|e| e * e)
            .mean()
            .unwrap_or(f64::NAN);
        LeaveOneOut {
            predictions,
            std_errors,
            mspe,
        }
    }
}
