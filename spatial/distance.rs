//! Pairwise Euclidean distances between point-referenced units.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A planar location. Coordinates are used as given; no projection is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

impl Coordinate {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn distance(&self, other: &Coordinate) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Coordinate {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Symmetric distance matrix with an exact zero diagonal.
///
/// Repeated locations are valid (repeated sampling) and simply produce zero
/// off-diagonal entries.
pub fn distance_matrix(coords: &[Coordinate]) -> Array2<f64> {
    let n = coords.len();
    let mut out = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = coords[i].distance(&coords[j]);
            out[(i, j)] = d;
            out[(j, i)] = d;
        }
    }
    out
}

/// Distances from every `from` location (rows) to every `to` location (columns).
pub fn cross_distances(from: &[Coordinate], to: &[Coordinate]) -> Array2<f64> {
    Array2::from_shape_fn((from.len(), to.len()), |(i, j)| from[i].distance(&to[j]))
}

/// Largest entry of a distance matrix, `0.0` when empty.
pub fn max_distance(distances: &Array2<f64>) -> f64 {
    distances.iter().fold(0.0_f64, |acc, &d| acc.max(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn distance_matrix_is_symmetric_with_zero_diagonal() {
        let coords = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(3.0, 4.0),
            Coordinate::new(-1.0, 2.0),
        ];
        let d = distance_matrix(&coords);
        assert_eq!(d.dim(), (3, 3));
        for i in 0..3 {
            assert_eq!(d[(i, i)], 0.0);
            for j in 0..3 {
                assert_eq!(d[(i, j)], d[(j, i)]);
                assert!(d[(i, j)] >= 0.0);
            }
        }
        assert_abs_diff_eq!(d[(0, 1)], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(max_distance(&d), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn duplicate_locations_are_zero_off_diagonal() {
        let coords = vec![Coordinate::new(1.0, 1.0), Coordinate::new(1.0, 1.0)];
        let d = distance_matrix(&coords);
        assert_eq!(d[(0, 1)], 0.0);
        assert_eq!(d[(1, 0)], 0.0);
    }

    #[test]
    fn cross_distances_have_rectangular_shape() {
        let from = vec![Coordinate::new(0.0, 0.0)];
        let to = vec![Coordinate::new(1.0, 0.0), Coordinate::new(0.0, 2.0)];
        let d = cross_distances(&from, &to);
        assert_eq!(d.dim(), (1, 2));
        assert_abs_diff_eq!(d[(0, 1)], 2.0, epsilon = 1e-12);
    }
}
