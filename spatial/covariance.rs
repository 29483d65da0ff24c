//! # Parametric covariance kernels
//!
//! Each kernel maps a separation distance `h ≥ 0` to the covariance of the
//! spatially *dependent* error component. The value at `h = 0` is exactly the
//! partial sill; the independent (nugget) variance is added on the diagonal by
//! the composing model and never inside a kernel.
//!
//! Kernels are written in terms of a unit-sill correlation so that the
//! estimator can profile the overall variance out of the likelihood.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

/// Bounds on the Matérn smoothness when it is estimated.
pub const MATERN_SMOOTHNESS_BOUNDS: (f64, f64) = (0.2, 5.0);

/// Smoothness used when a Matérn kernel is evaluated without an explicit value.
pub const DEFAULT_MATERN_SMOOTHNESS: f64 = 0.5;

/// The closed set of geostatistical covariance families.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeostatFamily {
    /// Independent errors only; the dependent part is identically zero for `h > 0`.
    None,
    Exponential,
    Spherical,
    Gaussian,
    Triangular,
    /// Matérn with a fixed smoothness, or an estimated one when `smoothness` is `None`.
    Matern { smoothness: Option<f64> },
}

/// Parameters of the dependent error component.
///
/// `smoothness` is only read by the Matérn kernel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelParams {
    pub partial_sill: f64,
    pub range: f64,
    pub smoothness: f64,
}

impl KernelParams {
    pub fn new(partial_sill: f64, range: f64) -> Self {
        Self {
            partial_sill,
            range,
            smoothness: DEFAULT_MATERN_SMOOTHNESS,
        }
    }

    pub fn with_smoothness(mut self, smoothness: f64) -> Self {
        self.smoothness = smoothness;
        self
    }
}

impl GeostatFamily {
    pub fn name(&self) -> &'static str {
        match self {
            GeostatFamily::None => "none",
            GeostatFamily::Exponential => "exponential",
            GeostatFamily::Spherical => "spherical",
            GeostatFamily::Gaussian => "gaussian",
            GeostatFamily::Triangular => "triangular",
            GeostatFamily::Matern { .. } => "matern",
        }
    }

    /// `false` only for the pure independent-error model.
    pub fn is_spatial(&self) -> bool {
        !matches!(self, GeostatFamily::None)
    }

    /// Whether the smoothness is a free parameter of the fit.
    pub fn estimates_smoothness(&self) -> bool {
        matches!(self, GeostatFamily::Matern { smoothness: None })
    }

    /// Unit-sill correlation at distance `h`.
    pub fn correlation(&self, h: f64, range: f64, smoothness: f64) -> f64 {
        let h = h.abs();
        if h == 0.0 {
            return 1.0;
        }
        let r = h / range;
        match self {
            GeostatFamily::None => 0.0,
            GeostatFamily::Exponential => (-r).exp(),
            GeostatFamily::Gaussian => (-(r * r)).exp(),
            GeostatFamily::Spherical => {
                if r <= 1.0 {
                    (1.0 - 1.5 * r + 0.5 * r * r * r).max(0.0)
                } else {
                    0.0
                }
            }
            GeostatFamily::Triangular => {
                if r <= 1.0 {
                    (1.0 - r).max(0.0)
                } else {
                    0.0
                }
            }
            GeostatFamily::Matern { .. } => matern_correlation(r, smoothness),
        }
    }

    /// Covariance of the dependent component at distance `h`.
    pub fn evaluate(&self, h: f64, params: &KernelParams) -> f64 {
        params.partial_sill * self.correlation(h, params.range, params.smoothness)
    }

    /// Kernel evaluated element-wise over a whole distance matrix.
    pub fn evaluate_matrix(&self, distances: &Array2<f64>, params: &KernelParams) -> Array2<f64> {
        distances.mapv(|h| self.evaluate(h, params))
    }

    /// Writes unit-sill correlations for `distances` into `out` without allocating.
    pub fn fill_correlation(
        &self,
        out: &mut Array2<f64>,
        distances: &Array2<f64>,
        range: f64,
        smoothness: f64,
    ) {
        Zip::from(out)
            .and(distances)
            .for_each(|o, &h| *o = self.correlation(h, range, smoothness));
    }
}

/// Matérn correlation `2^{1-ν}/Γ(ν) · a^ν K_ν(a)` with `a = √(2ν)·r`.
fn matern_correlation(r: f64, nu: f64) -> f64 {
    let a = (2.0 * nu).sqrt() * r;
    if a > 745.0 {
        return 0.0;
    }
    let log_value = (1.0 - nu) * std::f64::consts::LN_2 - ln_gamma(nu) + nu * a.ln()
        + bessel_k_scaled(nu, a).ln()
        - a;
    log_value.exp().clamp(0.0, 1.0)
}

/// Exponentially scaled modified Bessel function of the second kind, `eˣ K_ν(x)`.
///
/// Evaluated with the trapezoidal rule on
/// `eˣ K_ν(x) = ∫₀^∞ exp(−x(cosh t − 1)) cosh(νt) dt`; the integrand is entire
/// and decays doubly exponentially, so a fixed step converges to machine precision.
pub(crate) fn bessel_k_scaled(nu: f64, x: f64) -> f64 {
    const STEP: f64 = 0.1;
    const MAX_STEPS: usize = 20_000;

    let mut sum = 0.5;
    for k in 1..MAX_STEPS {
        let t = k as f64 * STEP;
        let base = -x * (t.cosh() - 1.0);
        let term = 0.5 * ((base + nu * t).exp() + (base - nu * t).exp());
        sum += term;
        // Past the peak of the integrand and negligible from here on.
        if x * t.sinh() > nu && term < sum * 1e-17 {
            break;
        }
    }
    sum * STEP
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const MONOTONE_FAMILIES: [GeostatFamily; 4] = [
        GeostatFamily::Exponential,
        GeostatFamily::Gaussian,
        GeostatFamily::Spherical,
        GeostatFamily::Triangular,
    ];

    #[test]
    fn value_at_zero_is_partial_sill() {
        let params = KernelParams::new(2.5, 3.0).with_smoothness(1.3);
        for family in MONOTONE_FAMILIES.iter().chain(
            [
                GeostatFamily::Matern { smoothness: None },
                GeostatFamily::Matern {
                    smoothness: Some(2.0),
                },
            ]
            .iter(),
        ) {
            assert_eq!(family.evaluate(0.0, &params), 2.5, "{}", family.name());
        }
    }

    #[test]
    fn kernels_are_non_increasing_and_depend_on_absolute_distance() {
        let params = KernelParams::new(1.7, 2.0);
        for family in MONOTONE_FAMILIES {
            let mut previous = family.evaluate(0.0, &params);
            for step in 1..200 {
                let h = step as f64 * 0.05;
                let value = family.evaluate(h, &params);
                assert!(
                    value <= previous + 1e-15,
                    "{} increased at h = {h}: {previous} -> {value}",
                    family.name()
                );
                assert_eq!(value, family.evaluate(-h, &params));
                assert!(value >= 0.0);
                previous = value;
            }
        }
    }

    #[test]
    fn bounded_support_kernels_vanish_beyond_range() {
        let params = KernelParams::new(1.0, 2.0);
        assert_abs_diff_eq!(
            GeostatFamily::Spherical.evaluate(2.0, &params),
            0.0,
            epsilon = 1e-15
        );
        assert_eq!(GeostatFamily::Spherical.evaluate(2.5, &params), 0.0);
        assert_eq!(GeostatFamily::Triangular.evaluate(2.5, &params), 0.0);
        assert_abs_diff_eq!(
            GeostatFamily::Triangular.evaluate(1.0, &params),
            0.5,
            epsilon = 1e-15
        );
    }

    #[test]
    fn none_family_is_zero_away_from_origin() {
        let params = KernelParams::new(3.0, 1.0);
        assert_eq!(GeostatFamily::None.evaluate(1e-9, &params), 0.0);
        assert_eq!(GeostatFamily::None.evaluate(10.0, &params), 0.0);
    }

    #[test]
    fn matern_half_is_exponential() {
        let matern = GeostatFamily::Matern {
            smoothness: Some(0.5),
        };
        let params = KernelParams::new(1.0, 1.5).with_smoothness(0.5);
        for step in 1..60 {
            let h = step as f64 * 0.1;
            assert_abs_diff_eq!(
                matern.evaluate(h, &params),
                GeostatFamily::Exponential.evaluate(h, &params),
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn matern_three_halves_matches_closed_form() {
        let matern = GeostatFamily::Matern {
            smoothness: Some(1.5),
        };
        let params = KernelParams::new(2.0, 0.8).with_smoothness(1.5);
        for step in 1..40 {
            let h = step as f64 * 0.07;
            let a = 3.0_f64.sqrt() * h / 0.8;
            let expected = 2.0 * (1.0 + a) * (-a).exp();
            assert_abs_diff_eq!(matern.evaluate(h, &params), expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn matrix_evaluation_matches_scalar_evaluation() {
        let distances = ndarray::array![[0.0, 1.0], [1.0, 0.0]];
        let params = KernelParams::new(4.0, 2.0);
        let k = GeostatFamily::Gaussian.evaluate_matrix(&distances, &params);
        assert_eq!(k[(0, 0)], 4.0);
        assert_abs_diff_eq!(k[(0, 1)], 4.0 * (-0.25_f64).exp(), epsilon = 1e-14);

        let mut buffer = Array2::zeros((2, 2));
        GeostatFamily::Gaussian.fill_correlation(&mut buffer, &distances, 2.0, 0.5);
        assert_abs_diff_eq!(buffer[(1, 0)], (-0.25_f64).exp(), epsilon = 1e-14);
    }

    #[test]
    fn family_serializes_with_kind_tag() {
        let json = serde_json::to_string(&GeostatFamily::Matern {
            smoothness: Some(1.0),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"matern\""));
        let back: GeostatFamily = serde_json::from_str("{\"kind\":\"spherical\"}").unwrap();
        assert_eq!(back, GeostatFamily::Spherical);
    }
}
