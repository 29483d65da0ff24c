//! # Covariance structures over the observed units
//!
//! A fitted covariance is always written as `Σ = σ² R(θ)`: the overall
//! variance `σ²` is profiled out of the likelihood and only the correlation
//! parameters `θ` are searched numerically. This module owns the mapping from
//! an unconstrained vector `θ` to `R(θ)` for each supported family, the starting
//! grid for the search, and the conversion back to reported parameters.
//!
//! - Geostatistical: `R = π I + (1 − π) K(H; φ, ν)` with free `logit π`,
//!   `log(φ / d_max)` and, for an estimated Matérn smoothness, `logit` of `ν`
//!   on its admissible interval.
//! - CAR: for units with neighbours, `R = (D − ρ W)⁻¹` when row standardised
//!   (equal to `(I − ρ W_st)⁻¹ M`) or `(I − ρ W)⁻¹` otherwise; units without
//!   neighbours are independent with variance `κ`.

use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::{ArealSpec, GeostatSpec, NuggetSpec};
use crate::covariance::{GeostatFamily, MATERN_SMOOTHNESS_BOUNDS};
use crate::estimate::EstimationError;
use crate::faer_ndarray::{FaerCholesky, FaerEigh, FaerLinalgError};
use crate::neighborhood::{IsolatedUnitWarning, Neighborhood};
use faer::Side;

/// Fraction of the admissible `ρ` interval kept away from each end.
const RHO_BOUNDARY_SHRINK: f64 = 1e-3;

/// Estimated covariance parameters, on their natural scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CovarianceParameters {
    Geostatistical {
        nugget: f64,
        partial_sill: f64,
        range: f64,
        /// Present for Matérn models only.
        smoothness: Option<f64>,
    },
    Car {
        partial_sill: f64,
        rho: f64,
        /// Variance of units without neighbours; `None` when no such unit was observed.
        extra: Option<f64>,
    },
}

impl CovarianceParameters {
    /// Marginal variance of a unit that is not isolated.
    pub fn total_variance(&self) -> f64 {
        match *self {
            CovarianceParameters::Geostatistical {
                nugget,
                partial_sill,
                ..
            } => nugget + partial_sill,
            CovarianceParameters::Car { partial_sill, .. } => partial_sill,
        }
    }
}

#[inline]
pub(crate) fn logistic(t: f64) -> f64 {
    1.0 / (1.0 + (-t).exp())
}

#[inline]
pub(crate) fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// The covariance family of one fit, prepared over the observed units.
#[derive(Debug, Clone)]
pub(crate) enum CovarianceStructure {
    Geostatistical(GeostatStructure),
    Car(CarStructure),
}

impl CovarianceStructure {
    pub(crate) fn n_free(&self) -> usize {
        match self {
            CovarianceStructure::Geostatistical(s) => s.n_free(),
            CovarianceStructure::Car(s) => s.n_free(),
        }
    }

    pub(crate) fn fill_correlation(
        &self,
        theta: &Array1<f64>,
        out: &mut Array2<f64>,
    ) -> Result<(), FaerLinalgError> {
        match self {
            CovarianceStructure::Geostatistical(s) => {
                s.fill_correlation(theta, out);
                Ok(())
            }
            CovarianceStructure::Car(s) => s.fill_correlation(theta, out),
        }
    }

    /// Parameters on the natural scale for correlation parameters `theta`
    /// and profiled variance `sigma2`.
    pub(crate) fn parameters(&self, theta: &Array1<f64>, sigma2: f64) -> CovarianceParameters {
        match self {
            CovarianceStructure::Geostatistical(s) => s.parameters(theta, sigma2),
            CovarianceStructure::Car(s) => s.parameters(theta, sigma2),
        }
    }

    /// Candidate starting points, in no particular order.
    pub(crate) fn initial_grid(&self) -> Vec<Array1<f64>> {
        match self {
            CovarianceStructure::Geostatistical(s) => s.initial_grid(),
            CovarianceStructure::Car(s) => s.initial_grid(),
        }
    }
}

/// Geostatistical structure over the observed distance matrix.
#[derive(Debug, Clone)]
pub(crate) struct GeostatStructure {
    spec: GeostatSpec,
    distances: Array2<f64>,
    scale: f64,
}

impl GeostatStructure {
    pub(crate) fn new(spec: GeostatSpec, distances: Array2<f64>, scale: f64) -> Self {
        Self {
            spec,
            distances,
            scale,
        }
    }

    fn estimates_nugget(&self) -> bool {
        self.spec.family.is_spatial() && self.spec.nugget == NuggetSpec::Estimate
    }

    fn estimates_range(&self) -> bool {
        self.spec.family.is_spatial() && self.spec.range.is_none()
    }

    fn n_free(&self) -> usize {
        usize::from(self.estimates_nugget())
            + usize::from(self.estimates_range())
            + usize::from(self.spec.family.estimates_smoothness())
    }

    /// `(π, φ, ν)` decoded from the free vector.
    fn decode(&self, theta: &Array1<f64>) -> (f64, f64, f64) {
        let mut free = theta.iter().copied();
        let family = self.spec.family;
        let nugget_share = if !family.is_spatial() {
            1.0
        } else if self.estimates_nugget() {
            free.next().map_or(0.5, logistic)
        } else {
            0.0
        };
        let range = match self.spec.range {
            Some(range) => range,
            None if family.is_spatial() => free.next().map_or(self.scale, |t| self.scale * t.exp()),
            None => 0.0,
        };
        let smoothness = match family {
            GeostatFamily::Matern {
                smoothness: Some(nu),
            } => nu,
            GeostatFamily::Matern { smoothness: None } => {
                let (lo, hi) = MATERN_SMOOTHNESS_BOUNDS;
                free.next().map_or(0.5, |t| lo + (hi - lo) * logistic(t))
            }
            _ => crate::covariance::DEFAULT_MATERN_SMOOTHNESS,
        };
        (nugget_share, range, smoothness)
    }

    fn fill_correlation(&self, theta: &Array1<f64>, out: &mut Array2<f64>) {
        let (nugget_share, range, smoothness) = self.decode(theta);
        if !self.spec.family.is_spatial() {
            out.fill(0.0);
            out.diag_mut().fill(1.0);
            return;
        }
        self.spec
            .family
            .fill_correlation(out, &self.distances, range, smoothness);
        if nugget_share > 0.0 {
            out.mapv_inplace(|v| (1.0 - nugget_share) * v);
            out.diag_mut().mapv_inplace(|v| v + nugget_share);
        }
    }

    fn parameters(&self, theta: &Array1<f64>, sigma2: f64) -> CovarianceParameters {
        let (nugget_share, range, smoothness) = self.decode(theta);
        CovarianceParameters::Geostatistical {
            nugget: sigma2 * nugget_share,
            partial_sill: sigma2 * (1.0 - nugget_share),
            range,
            smoothness: matches!(self.spec.family, GeostatFamily::Matern { .. })
                .then_some(smoothness),
        }
    }

    fn initial_grid(&self) -> Vec<Array1<f64>> {
        let mut axes: Vec<Vec<f64>> = Vec::new();
        if self.estimates_nugget() {
            axes.push([0.05, 0.25, 0.5].iter().map(|&p| logit(p)).collect());
        }
        if self.estimates_range() {
            axes.push([0.05, 0.15, 0.35, 0.75].iter().map(|&f: &f64| f.ln()).collect());
        }
        if self.spec.family.estimates_smoothness() {
            let (lo, hi) = MATERN_SMOOTHNESS_BOUNDS;
            axes.push(
                [0.5, 1.0, 2.5]
                    .iter()
                    .map(|&nu| logit((nu - lo) / (hi - lo)))
                    .collect(),
            );
        }
        cartesian_grid(axes)
    }
}

fn cartesian_grid(axes: Vec<Vec<f64>>) -> Vec<Array1<f64>> {
    if axes.is_empty() {
        return vec![Array1::zeros(0)];
    }
    axes.into_iter()
        .multi_cartesian_product()
        .map(Array1::from)
        .collect()
}

/// CAR precision pieces for a neighbourhood, prepared once per fit.
#[derive(Debug, Clone)]
pub(crate) struct CarOperator {
    n_units: usize,
    connected: Vec<usize>,
    isolated: Vec<usize>,
    /// Weights among connected units.
    weights: Array2<f64>,
    /// Diagonal of the precision at `ρ = 0`: row sums when row standardised, ones otherwise.
    base: Array1<f64>,
    rho_bounds: (f64, f64),
    warnings: Vec<IsolatedUnitWarning>,
}

impl CarOperator {
    pub(crate) fn new(
        neighborhood: &Neighborhood,
        row_standardize: bool,
    ) -> Result<Self, EstimationError> {
        let n_units = neighborhood.len();
        let isolated = neighborhood.isolated_units();
        let warnings: Vec<IsolatedUnitWarning> = if row_standardize {
            neighborhood.row_standardize().warnings
        } else {
            isolated
                .iter()
                .map(|&unit| {
                    log::warn!(
                        "Areal unit {} has no neighbours; it is treated as isolated.",
                        unit
                    );
                    IsolatedUnitWarning { unit }
                })
                .collect()
        };
        let connected: Vec<usize> = (0..n_units).filter(|i| !isolated.contains(i)).collect();

        let full = neighborhood.weights();
        let m = connected.len();
        let weights = Array2::from_shape_fn((m, m), |(a, b)| full[(connected[a], connected[b])]);
        let sums = weights.sum_axis(ndarray::Axis(1));
        let base = if row_standardize {
            sums.clone()
        } else {
            Array1::ones(m)
        };

        let rho_bounds = if m == 0 {
            (0.0, 0.0)
        } else {
            // Eigenvalues of D^{-1/2} W D^{-1/2} (row standardised) or W.
            let scaled = if row_standardize {
                Array2::from_shape_fn((m, m), |(a, b)| {
                    weights[(a, b)] / (sums[a] * sums[b]).sqrt()
                })
            } else {
                weights.clone()
            };
            let (eigenvalues, _) = scaled.eigh(Side::Lower)?;
            let min = eigenvalues.iter().fold(f64::INFINITY, |acc, &v| acc.min(v));
            let max = eigenvalues.iter().fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
            if !(min < 0.0 && max > 0.0) {
                return Err(EstimationError::InvalidInput(
                    "weight matrix spectrum does not bracket zero; rho has no admissible range"
                        .to_string(),
                ));
            }
            (1.0 / min, 1.0 / max)
        };
        log::debug!(
            "CAR operator: {} connected and {} isolated units, rho in ({:.4}, {:.4}).",
            m,
            isolated.len(),
            rho_bounds.0,
            rho_bounds.1
        );

        Ok(Self {
            n_units,
            connected,
            isolated,
            weights,
            base,
            rho_bounds,
            warnings,
        })
    }

    pub(crate) fn rho_bounds(&self) -> (f64, f64) {
        self.rho_bounds
    }

    pub(crate) fn warnings(&self) -> &[IsolatedUnitWarning] {
        &self.warnings
    }

    pub(crate) fn is_isolated(&self, unit: usize) -> bool {
        self.isolated.contains(&unit)
    }

    fn rho_from_free(&self, t: f64) -> f64 {
        let (lo, hi) = self.rho_bounds;
        let width = hi - lo;
        let (lo, hi) = (lo + RHO_BOUNDARY_SHRINK * width, hi - RHO_BOUNDARY_SHRINK * width);
        lo + (hi - lo) * logistic(t)
    }

    fn rho_to_free(&self, rho: f64) -> f64 {
        let (lo, hi) = self.rho_bounds;
        let width = hi - lo;
        let (lo, hi) = (lo + RHO_BOUNDARY_SHRINK * width, hi - RHO_BOUNDARY_SHRINK * width);
        logit(((rho - lo) / (hi - lo)).clamp(1e-9, 1.0 - 1e-9))
    }

    /// Unit-scale correlation over all units. Isolated units get `kappa`, or
    /// the largest marginal variance of the connected units when `kappa` is `None`.
    pub(crate) fn correlation(
        &self,
        rho: f64,
        kappa: Option<f64>,
    ) -> Result<Array2<f64>, FaerLinalgError> {
        let mut out = Array2::<f64>::zeros((self.n_units, self.n_units));
        let mut largest = 1.0;
        if !self.connected.is_empty() {
            let mut precision = self.weights.mapv(|w| -rho * w);
            precision
                .diag_mut()
                .zip_mut_with(&self.base, |d, &b| *d += b);
            let inverse = precision.checked_cholesky()?.inverse();
            for (a, &i) in self.connected.iter().enumerate() {
                for (b, &j) in self.connected.iter().enumerate() {
                    out[(i, j)] = inverse[(a, b)];
                }
            }
            largest = inverse.diag().iter().fold(0.0_f64, |acc, &v| acc.max(v));
        }
        let isolated_variance = kappa.unwrap_or(largest);
        for &i in &self.isolated {
            out[(i, i)] = isolated_variance;
        }
        Ok(out)
    }
}

/// CAR structure restricted to the observed units.
#[derive(Debug, Clone)]
pub(crate) struct CarStructure {
    operator: CarOperator,
    observed: Vec<usize>,
    estimate_extra: bool,
}

impl CarStructure {
    pub(crate) fn new(
        spec: &ArealSpec,
        neighborhood: &Neighborhood,
        observed: &[usize],
    ) -> Result<Self, EstimationError> {
        let operator = CarOperator::new(neighborhood, spec.row_standardize)?;
        if observed.iter().all(|&i| operator.is_isolated(i)) {
            return Err(EstimationError::InvalidInput(
                "no observed areal unit has a neighbour; a CAR model cannot be identified"
                    .to_string(),
            ));
        }
        let estimate_extra = observed.iter().any(|&i| operator.is_isolated(i));
        Ok(Self {
            operator,
            observed: observed.to_vec(),
            estimate_extra,
        })
    }

    pub(crate) fn warnings(&self) -> &[IsolatedUnitWarning] {
        self.operator.warnings()
    }

    fn n_free(&self) -> usize {
        1 + usize::from(self.estimate_extra)
    }

    fn decode(&self, theta: &Array1<f64>) -> (f64, Option<f64>) {
        let rho = theta.get(0).map_or(0.0, |&t| self.operator.rho_from_free(t));
        let kappa = if self.estimate_extra {
            Some(theta.get(1).map_or(1.0, |t| t.exp()))
        } else {
            None
        };
        (rho, kappa)
    }

    fn fill_correlation(
        &self,
        theta: &Array1<f64>,
        out: &mut Array2<f64>,
    ) -> Result<(), FaerLinalgError> {
        let (rho, kappa) = self.decode(theta);
        let full = self.operator.correlation(rho, kappa)?;
        for (a, &i) in self.observed.iter().enumerate() {
            for (b, &j) in self.observed.iter().enumerate() {
                out[(a, b)] = full[(i, j)];
            }
        }
        Ok(())
    }

    fn parameters(&self, theta: &Array1<f64>, sigma2: f64) -> CovarianceParameters {
        let (rho, kappa) = self.decode(theta);
        CovarianceParameters::Car {
            partial_sill: sigma2,
            rho,
            extra: kappa.map(|k| sigma2 * k),
        }
    }

    fn initial_grid(&self) -> Vec<Array1<f64>> {
        let (lo, hi) = self.operator.rho_bounds();
        let mut axes = vec![
            [0.1, 0.3, 0.5, 0.7, 0.9]
                .iter()
                .map(|&u| self.operator.rho_to_free(lo + u * (hi - lo)))
                .collect::<Vec<f64>>(),
        ];
        if self.estimate_extra {
            axes.push(vec![0.5_f64.ln(), 0.0, 2.0_f64.ln()]);
        }
        cartesian_grid(axes)
    }
}

/// Covariance `σ² R` of a CAR model over every unit of `neighborhood`.
///
/// `rho` must lie strictly inside the admissible interval of the
/// neighbourhood. Units without neighbours get variance `extra`, or the
/// largest marginal variance of the connected units when `extra` is `None`.
pub fn car_covariance(
    neighborhood: &Neighborhood,
    row_standardize: bool,
    partial_sill: f64,
    rho: f64,
    extra: Option<f64>,
) -> Result<Array2<f64>, EstimationError> {
    if !(partial_sill.is_finite() && partial_sill > 0.0) {
        return Err(EstimationError::InvalidInput(format!(
            "partial sill must be positive, got {partial_sill}"
        )));
    }
    if let Some(extra) = extra {
        if !(extra.is_finite() && extra > 0.0) {
            return Err(EstimationError::InvalidInput(format!(
                "extra variance must be positive, got {extra}"
            )));
        }
    }
    let operator = CarOperator::new(neighborhood, row_standardize)?;
    let (lo, hi) = operator.rho_bounds();
    if !operator.connected.is_empty() && !(rho > lo && rho < hi) {
        return Err(EstimationError::InvalidInput(format!(
            "rho = {rho} is outside the admissible interval ({lo:.6}, {hi:.6})"
        )));
    }
    let correlation = operator
        .correlation(rho, extra.map(|e| e / partial_sill))
        .map_err(|e| EstimationError::SingularCovariance(e.to_string()))?;
    Ok(correlation * partial_sill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{distance_matrix, max_distance, Coordinate};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn path(n: usize) -> Neighborhood {
        let lists: Vec<Vec<usize>> = (0..n)
            .map(|i| if i + 1 < n { vec![i + 1] } else { vec![] })
            .collect();
        Neighborhood::from_adjacency(&lists).unwrap()
    }

    #[test]
    fn geostatistical_correlation_has_unit_diagonal() {
        let coords: Vec<Coordinate> = (0..5).map(|i| Coordinate::new(i as f64, 0.0)).collect();
        let distances = distance_matrix(&coords);
        let scale = max_distance(&distances);
        let structure = GeostatStructure::new(
            GeostatSpec::new(GeostatFamily::Exponential),
            distances,
            scale,
        );
        assert_eq!(structure.n_free(), 2);
        let theta = array![logit(0.2), 0.5_f64.ln()];
        let mut r = Array2::zeros((5, 5));
        structure.fill_correlation(&theta, &mut r);
        for i in 0..5 {
            assert_abs_diff_eq!(r[(i, i)], 1.0, epsilon = 1e-14);
        }
        // range = 0.5 * 4 = 2
        assert_abs_diff_eq!(r[(0, 1)], 0.8 * (-0.5_f64).exp(), epsilon = 1e-14);

        match structure.parameters(&theta, 3.0) {
            CovarianceParameters::Geostatistical {
                nugget,
                partial_sill,
                range,
                smoothness,
            } => {
                assert_abs_diff_eq!(nugget, 0.6, epsilon = 1e-12);
                assert_abs_diff_eq!(partial_sill, 2.4, epsilon = 1e-12);
                assert_abs_diff_eq!(range, 2.0, epsilon = 1e-12);
                assert_eq!(smoothness, None);
            }
            other => panic!("unexpected parameters {other:?}"),
        }
    }

    #[test]
    fn fixed_parameters_leave_nothing_free() {
        let distances = distance_matrix(&[Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0)]);
        let fixed = GeostatStructure::new(
            GeostatSpec::new(GeostatFamily::Spherical)
                .with_zero_nugget()
                .with_range(3.0),
            distances.clone(),
            1.0,
        );
        assert_eq!(fixed.n_free(), 0);
        assert_eq!(fixed.initial_grid(), vec![Array1::<f64>::zeros(0)]);

        let none = GeostatStructure::new(GeostatSpec::new(GeostatFamily::None), distances, 1.0);
        assert_eq!(none.n_free(), 0);
        let mut r = Array2::from_elem((2, 2), 7.0);
        none.fill_correlation(&Array1::zeros(0), &mut r);
        assert_eq!(r, Array2::<f64>::eye(2));

        let matern = GeostatStructure::new(
            GeostatSpec::new(GeostatFamily::Matern { smoothness: None }),
            Array2::zeros((1, 1)),
            1.0,
        );
        assert_eq!(matern.n_free(), 3);
        assert_eq!(matern.initial_grid().len(), 3 * 4 * 3);
    }

    #[test]
    fn row_standardized_car_matches_symmetric_precision() {
        let neighborhood = path(3);
        let sigma = car_covariance(&neighborhood, true, 1.0, 0.5, None).unwrap();
        // (D − ρW)⁻¹ for D = diag(1, 2, 1)
        let precision = array![[1.0, -0.5, 0.0], [-0.5, 2.0, -0.5], [0.0, -0.5, 1.0]];
        let identity = precision.dot(&sigma);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(identity[(i, j)], expected, epsilon = 1e-10);
            }
        }
        assert_abs_diff_eq!(sigma[(1, 1)], 1.0 / 1.5, epsilon = 1e-12);
    }

    #[test]
    fn rho_bounds_follow_the_spectrum() {
        let neighborhood = path(2);
        let standardized = CarOperator::new(&neighborhood, true).unwrap();
        let (lo, hi) = standardized.rho_bounds();
        assert_abs_diff_eq!(lo, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hi, 1.0, epsilon = 1e-12);
        assert!(car_covariance(&neighborhood, true, 1.0, 1.0, None).is_err());
        assert!(car_covariance(&neighborhood, true, 1.0, 0.99, None).is_ok());

        let star = Neighborhood::from_adjacency(&[vec![1, 2, 3, 4], vec![], vec![], vec![], vec![]])
            .unwrap();
        let raw = CarOperator::new(&star, false).unwrap();
        let (lo, hi) = raw.rho_bounds();
        assert_abs_diff_eq!(lo, -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(hi, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn isolated_units_take_extra_or_largest_variance() {
        let neighborhood = Neighborhood::from_adjacency(&[vec![1], vec![], vec![]]).unwrap();
        let with_extra = car_covariance(&neighborhood, true, 2.0, 0.3, Some(5.0)).unwrap();
        assert_abs_diff_eq!(with_extra[(2, 2)], 5.0, epsilon = 1e-12);
        assert_eq!(with_extra[(0, 2)], 0.0);
        assert_eq!(with_extra[(2, 1)], 0.0);

        let fallback = car_covariance(&neighborhood, true, 2.0, 0.3, None).unwrap();
        let largest = fallback[(0, 0)].max(fallback[(1, 1)]);
        assert_abs_diff_eq!(fallback[(2, 2)], largest, epsilon = 1e-12);
    }

    #[test]
    fn car_structure_requires_an_observed_connected_unit() {
        let neighborhood = Neighborhood::from_adjacency(&[vec![1], vec![], vec![]]).unwrap();
        let spec = ArealSpec::car(true);
        assert!(CarStructure::new(&spec, &neighborhood, &[2]).is_err());

        let structure = CarStructure::new(&spec, &neighborhood, &[0, 2]).unwrap();
        assert_eq!(structure.n_free(), 2);
        assert_eq!(structure.warnings(), &[IsolatedUnitWarning { unit: 2 }]);
        let mut r = Array2::zeros((2, 2));
        structure
            .fill_correlation(&array![0.0, 3.0_f64.ln()], &mut r)
            .unwrap();
        assert_abs_diff_eq!(r[(1, 1)], 3.0, epsilon = 1e-12);
        assert_eq!(r[(0, 1)], 0.0);
    }
}
