//! Empirical semivariogram: half the mean squared difference of the response
//! over pairs of locations grouped into distance bins.

use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::distance::Coordinate;
use crate::estimate::{design_condition_number, EstimationError};
use crate::faer_ndarray::FaerCholesky;

/// How pair distances are grouped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinSpec {
    /// Equal-width bins over `[0, cutoff]`.
    Count(usize),
    /// Explicit increasing bin edges; bin `k` is `[edges[k], edges[k + 1])`
    /// and the last bin also contains its upper edge.
    Edges(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SemivariogramOptions {
    pub bins: BinSpec,
    /// Largest pair distance considered; defaults to the largest pair distance.
    /// Ignored for explicit edges.
    pub cutoff: Option<f64>,
    /// Predictors (without intercept) whose OLS trend is removed first.
    pub predictors: Option<Array2<f64>>,
}

impl Default for SemivariogramOptions {
    fn default() -> Self {
        Self {
            bins: BinSpec::Count(15),
            cutoff: None,
            predictors: None,
        }
    }
}

impl SemivariogramOptions {
    pub fn with_bins(mut self, bins: BinSpec) -> Self {
        self.bins = bins;
        self
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    pub fn with_predictors(mut self, predictors: Array2<f64>) -> Self {
        self.predictors = Some(predictors);
        self
    }
}

/// One non-empty distance bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemivarianceBin {
    pub bin: usize,
    pub lower: f64,
    pub upper: f64,
    /// Mean distance of the pairs in the bin.
    pub distance: f64,
    pub gamma: f64,
    pub pairs: usize,
}

/// Non-empty bins in increasing distance order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Semivariogram {
    bins: Vec<SemivarianceBin>,
}

impl Semivariogram {
    pub fn bins(&self) -> &[SemivarianceBin] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SemivarianceBin> {
        self.bins.iter()
    }
}

impl<'a> IntoIterator for &'a Semivariogram {
    type Item = &'a SemivarianceBin;
    type IntoIter = std::slice::Iter<'a, SemivarianceBin>;

    fn into_iter(self) -> Self::IntoIter {
        self.bins.iter()
    }
}

/// Computes the empirical semivariogram of `values` at `coords`.
///
/// Too few observations give an empty or partial result rather than an error.
pub fn semivariogram(
    values: &[f64],
    coords: &[Coordinate],
    options: &SemivariogramOptions,
) -> Result<Semivariogram, EstimationError> {
    if values.len() != coords.len() {
        return Err(EstimationError::InvalidInput(format!(
            "{} values supplied for {} locations",
            values.len(),
            coords.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) || coords.iter().any(|c| !c.is_finite()) {
        return Err(EstimationError::InvalidInput(
            "semivariogram input must be finite".to_string(),
        ));
    }

    let values = match &options.predictors {
        Some(predictors) => match detrend(values, predictors)? {
            Some(residuals) => residuals,
            None => return Ok(Semivariogram::default()),
        },
        None => Array1::from(values.to_vec()),
    };

    let pairs: Vec<(f64, f64)> = (0..coords.len())
        .tuple_combinations()
        .map(|(i, j)| {
            let diff = values[i] - values[j];
            (coords[i].distance(&coords[j]), diff * diff)
        })
        .collect();
    if pairs.is_empty() {
        return Ok(Semivariogram::default());
    }

    let edges = bin_edges(&options.bins, options.cutoff, &pairs)?;
    let n_bins = edges.len() - 1;
    let last = edges[n_bins];

    let mut sums = vec![(0.0_f64, 0.0_f64, 0_usize); n_bins];
    for &(h, squared) in &pairs {
        if h < edges[0] || h > last {
            continue;
        }
        // Index of the last edge not above h, with the upper edge folded into the last bin.
        let bin = edges
            .partition_point(|&edge| edge <= h)
            .saturating_sub(1)
            .min(n_bins - 1);
        let entry = &mut sums[bin];
        entry.0 += h;
        entry.1 += squared;
        entry.2 += 1;
    }

    let bins = sums
        .into_iter()
        .enumerate()
        .filter(|(_, (_, _, count))| *count > 0)
        .map(|(bin, (distance_sum, squared_sum, count))| SemivarianceBin {
            bin,
            lower: edges[bin],
            upper: edges[bin + 1],
            distance: distance_sum / count as f64,
            gamma: squared_sum / (2.0 * count as f64),
            pairs: count,
        })
        .collect();
    Ok(Semivariogram { bins })
}

fn bin_edges(
    spec: &BinSpec,
    cutoff: Option<f64>,
    pairs: &[(f64, f64)],
) -> Result<Vec<f64>, EstimationError> {
    match spec {
        BinSpec::Count(n) => {
            if *n == 0 {
                return Err(EstimationError::InvalidInput(
                    "at least one semivariogram bin is required".to_string(),
                ));
            }
            let cutoff = match cutoff {
                Some(c) if c.is_finite() && c > 0.0 => c,
                Some(c) => {
                    return Err(EstimationError::InvalidInput(format!(
                        "semivariogram cutoff must be positive, got {c}"
                    )));
                }
                None => pairs.iter().fold(0.0_f64, |acc, &(h, _)| acc.max(h)),
            };
            if cutoff == 0.0 {
                // Every pair is at distance zero.
                return Ok(vec![0.0, 0.0]);
            }
            let width = cutoff / *n as f64;
            let mut edges: Vec<f64> = (0..*n).map(|k| k as f64 * width).collect();
            edges.push(cutoff);
            Ok(edges)
        }
        BinSpec::Edges(edges) => {
            let increasing = edges.windows(2).all(|w| w[0] < w[1]);
            if edges.len() < 2 || !increasing || edges.iter().any(|e| !e.is_finite() || *e < 0.0)
            {
                return Err(EstimationError::InvalidInput(
                    "bin edges must be at least two finite, non-negative, increasing values"
                        .to_string(),
                ));
            }
            Ok(edges.clone())
        }
    }
}

/// OLS residuals of `values` on an intercept plus `predictors`; `None` when
/// there are not enough observations to estimate the trend.
fn detrend(
    values: &[f64],
    predictors: &Array2<f64>,
) -> Result<Option<Array1<f64>>, EstimationError> {
    let n = values.len();
    if predictors.nrows() != n {
        return Err(EstimationError::InvalidInput(format!(
            "predictor matrix has {} rows for {} values",
            predictors.nrows(),
            n
        )));
    }
    let p = predictors.ncols() + 1;
    if n <= p {
        return Ok(None);
    }
    let mut x = Array2::<f64>::ones((n, p));
    x.slice_mut(ndarray::s![.., 1..]).assign(predictors);
    let condition_number = design_condition_number(&x)?;
    if !(condition_number <= 1e12) {
        return Err(EstimationError::RankDeficientDesign { condition_number });
    }
    let y = Array1::from(values.to_vec());
    let beta = x
        .t()
        .dot(&x)
        .checked_cholesky()?
        .solve_vec(&x.t().dot(&y));
    Ok(Some(&y - &x.dot(&beta)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn square() -> (Vec<f64>, Vec<Coordinate>) {
        (
            vec![9.0, 7.0, 6.0, 1.0],
            vec![
                Coordinate::new(1.0, 1.0),
                Coordinate::new(1.0, 2.0),
                Coordinate::new(2.0, 1.0),
                Coordinate::new(2.0, 2.0),
            ],
        )
    }

    #[test]
    fn four_point_square_matches_hand_computation() {
        let (values, coords) = square();
        let options = SemivariogramOptions::default().with_bins(BinSpec::Count(4));
        let result = semivariogram(&values, &coords, &options).unwrap();

        assert_eq!(result.len(), 2);
        let side = &result.bins()[0];
        assert_eq!(side.pairs, 4);
        assert_abs_diff_eq!(side.distance, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(side.gamma, 9.25, epsilon = 1e-12);

        let diagonal = &result.bins()[1];
        assert_eq!(diagonal.pairs, 2);
        assert_abs_diff_eq!(diagonal.distance, 2.0_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(diagonal.gamma, 16.25, epsilon = 1e-12);
        assert!(side.bin < diagonal.bin);
    }

    #[test]
    fn explicit_edges_and_cutoff_limit_the_pairs() {
        let (values, coords) = square();
        let edges = SemivariogramOptions::default().with_bins(BinSpec::Edges(vec![0.5, 1.2]));
        let result = semivariogram(&values, &coords, &edges).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.bins()[0].pairs, 4);

        let cut = SemivariogramOptions::default()
            .with_bins(BinSpec::Count(2))
            .with_cutoff(1.0);
        let result = semivariogram(&values, &coords, &cut).unwrap();
        let total: usize = result.iter().map(|b| b.pairs).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn too_few_points_give_an_empty_result() {
        let result = semivariogram(
            &[1.0],
            &[Coordinate::new(0.0, 0.0)],
            &SemivariogramOptions::default(),
        )
        .unwrap();
        assert!(result.is_empty());

        let detrended = semivariogram(
            &[1.0, 2.0],
            &[Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0)],
            &SemivariogramOptions::default().with_predictors(Array2::from_elem((2, 1), 1.0)),
        )
        .unwrap();
        assert!(detrended.is_empty());
    }

    #[test]
    fn linear_trend_is_removed_before_binning() {
        let coords: Vec<Coordinate> = (0..10).map(|i| Coordinate::new(i as f64, 0.0)).collect();
        let trend: Vec<f64> = (0..10).map(|i| 3.0 + 2.0 * i as f64).collect();
        let predictors = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let options = SemivariogramOptions::default().with_predictors(predictors);
        let result = semivariogram(&trend, &coords, &options).unwrap();
        for bin in &result {
            assert_abs_diff_eq!(bin.gamma, 0.0, epsilon = 1e-16);
        }
    }

    #[test]
    fn mismatched_lengths_are_invalid() {
        let result = semivariogram(
            &[1.0, 2.0],
            &[Coordinate::new(0.0, 0.0)],
            &SemivariogramOptions::default(),
        );
        assert!(matches!(result, Err(EstimationError::InvalidInput(_))));
    }
}
