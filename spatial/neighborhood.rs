//! # Neighbourhood structures for areal data
//!
//! Builds the binary contiguity matrix `W` from polygon boundaries or an
//! adjacency list, validates user-supplied weight matrices, and performs row
//! standardisation. Units without any neighbour are never divided by zero:
//! they keep an all-zero row and are reported as [`IsolatedUnitWarning`]s so
//! that the CAR model can give them their own independent variance.

use ahash::AHashMap;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::distance::Coordinate;

/// Default grid used to decide that two polygon vertices coincide.
pub const DEFAULT_SNAP_TOLERANCE: f64 = 1e-9;

/// A polygon given by its boundary rings. Only vertex positions matter for
/// contiguity, so holes may be supplied as further rings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub rings: Vec<Vec<Coordinate>>,
}

impl Polygon {
    pub fn new(exterior: Vec<Coordinate>) -> Self {
        Self {
            rings: vec![exterior],
        }
    }

    /// Axis-aligned rectangle `[x0, x1] × [y0, y1]`.
    pub fn rectangle(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self::new(vec![
            Coordinate::new(x0, y0),
            Coordinate::new(x1, y0),
            Coordinate::new(x1, y1),
            Coordinate::new(x0, y1),
            Coordinate::new(x0, y0),
        ])
    }
}

/// Rule that turns shared boundary vertices into adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contiguity {
    /// Polygons touching in at least one boundary point.
    Queen,
    /// Polygons sharing at least two boundary points, i.e. a boundary segment.
    Rook,
}

#[derive(Error, Debug)]
pub enum NeighborhoodError {
    #[error("Weight matrix must be square, found {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },
    #[error("Weight matrix is not symmetric at ({row}, {col}): {upper} vs {lower}.")]
    NotSymmetric {
        row: usize,
        col: usize,
        upper: f64,
        lower: f64,
    },
    #[error("Unit {0} lists itself as a neighbour; the diagonal of W must be zero.")]
    SelfNeighbor(usize),
    #[error("Weight ({row}, {col}) = {value} is negative or non-finite.")]
    InvalidWeight { row: usize, col: usize, value: f64 },
    #[error("Unit {unit} references neighbour {neighbor}, but only {len} units exist.")]
    NeighborOutOfRange {
        unit: usize,
        neighbor: usize,
        len: usize,
    },
    #[error("Polygon {0} has no vertices.")]
    EmptyPolygon(usize),
    #[error("Polygon {0} contains a non-finite vertex.")]
    NonFiniteVertex(usize),
    #[error("Snap tolerance must be positive and finite, got {0}.")]
    InvalidSnapTolerance(f64),
}

/// Non-fatal notice that an areal unit has no neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedUnitWarning {
    pub unit: usize,
}

impl fmt::Display for IsolatedUnitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit {} has no neighbours; it receives an independent extra variance",
            self.unit
        )
    }
}

/// Result of [`Neighborhood::row_standardize`].
#[derive(Debug, Clone)]
pub struct RowStandardized {
    /// `W_st = D⁻¹ W`; isolated rows stay zero.
    pub weights: Array2<f64>,
    /// Diagonal of the symmetry matrix `M = D⁻¹` (zero for isolated units).
    pub symmetry: Array1<f64>,
    pub warnings: Vec<IsolatedUnitWarning>,
}

/// A validated symmetric, non-negative weight matrix with zero diagonal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighborhood {
    weights: Array2<f64>,
}

impl Neighborhood {
    /// Validates an arbitrary weight matrix.
    pub fn from_matrix(weights: Array2<f64>) -> Result<Self, NeighborhoodError> {
        let (rows, cols) = weights.dim();
        if rows != cols {
            return Err(NeighborhoodError::NotSquare { rows, cols });
        }
        for i in 0..rows {
            if weights[(i, i)] != 0.0 {
                return Err(NeighborhoodError::SelfNeighbor(i));
            }
            for j in 0..cols {
                let value = weights[(i, j)];
                if !value.is_finite() || value < 0.0 {
                    return Err(NeighborhoodError::InvalidWeight {
                        row: i,
                        col: j,
                        value,
                    });
                }
                if j > i && value != weights[(j, i)] {
                    return Err(NeighborhoodError::NotSymmetric {
                        row: i,
                        col: j,
                        upper: value,
                        lower: weights[(j, i)],
                    });
                }
            }
        }
        Ok(Self { weights })
    }

    /// Binary weights from a list of neighbour indices per unit. A link listed
    /// on one side only is added symmetrically.
    pub fn from_adjacency(neighbors: &[Vec<usize>]) -> Result<Self, NeighborhoodError> {
        let n = neighbors.len();
        let mut weights = Array2::<f64>::zeros((n, n));
        for (unit, list) in neighbors.iter().enumerate() {
            for &neighbor in list {
                if neighbor >= n {
                    return Err(NeighborhoodError::NeighborOutOfRange {
                        unit,
                        neighbor,
                        len: n,
                    });
                }
                if neighbor == unit {
                    return Err(NeighborhoodError::SelfNeighbor(unit));
                }
                weights[(unit, neighbor)] = 1.0;
                weights[(neighbor, unit)] = 1.0;
            }
        }
        Ok(Self { weights })
    }

    /// Binary contiguity weights from polygon boundaries with the default snap tolerance.
    pub fn from_polygons(
        polygons: &[Polygon],
        contiguity: Contiguity,
    ) -> Result<Self, NeighborhoodError> {
        Self::from_polygons_with_tolerance(polygons, contiguity, DEFAULT_SNAP_TOLERANCE)
    }

    /// Binary contiguity weights; vertices closer than `tolerance` on a snapping
    /// grid are treated as the same boundary point.
    pub fn from_polygons_with_tolerance(
        polygons: &[Polygon],
        contiguity: Contiguity,
        tolerance: f64,
    ) -> Result<Self, NeighborhoodError> {
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(NeighborhoodError::InvalidSnapTolerance(tolerance));
        }

        // vertex key -> polygons touching it (each polygon recorded once)
        let mut owners: AHashMap<(i64, i64), Vec<usize>> = AHashMap::new();
        for (id, polygon) in polygons.iter().enumerate() {
            if polygon.rings.iter().all(|ring| ring.is_empty()) {
                return Err(NeighborhoodError::EmptyPolygon(id));
            }
            for vertex in polygon.rings.iter().flatten() {
                if !vertex.is_finite() {
                    return Err(NeighborhoodError::NonFiniteVertex(id));
                }
                let key = (
                    (vertex.x / tolerance).round() as i64,
                    (vertex.y / tolerance).round() as i64,
                );
                let entry = owners.entry(key).or_default();
                if !entry.contains(&id) {
                    entry.push(id);
                }
            }
        }

        let mut shared: AHashMap<(usize, usize), usize> = AHashMap::new();
        for ids in owners.values().filter(|ids| ids.len() > 1) {
            for (a, &i) in ids.iter().enumerate() {
                for &j in &ids[a + 1..] {
                    let pair = if i < j { (i, j) } else { (j, i) };
                    *shared.entry(pair).or_insert(0) += 1;
                }
            }
        }

        let required = match contiguity {
            Contiguity::Queen => 1,
            Contiguity::Rook => 2,
        };
        let n = polygons.len();
        let mut weights = Array2::<f64>::zeros((n, n));
        for (&(i, j), &count) in &shared {
            if count >= required {
                weights[(i, j)] = 1.0;
                weights[(j, i)] = 1.0;
            }
        }
        log::debug!(
            "Built {:?} contiguity for {} polygons with {} links.",
            contiguity,
            n,
            weights.iter().filter(|&&w| w > 0.0).count() / 2
        );
        Ok(Self { weights })
    }

    pub fn len(&self) -> usize {
        self.weights.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.nrows() == 0
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    /// Row sums of `W` (the neighbour counts for binary weights).
    pub fn row_sums(&self) -> Array1<f64> {
        self.weights.sum_axis(ndarray::Axis(1))
    }

    pub fn neighbor_counts(&self) -> Vec<usize> {
        self.weights
            .rows()
            .into_iter()
            .map(|row| row.iter().filter(|&&w| w > 0.0).count())
            .collect()
    }

    pub fn neighbors_of(&self, unit: usize) -> Vec<usize> {
        self.weights
            .row(unit)
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0.0)
            .map(|(j, _)| j)
            .collect()
    }

    /// Units whose row of `W` is entirely zero.
    pub fn isolated_units(&self) -> Vec<usize> {
        self.row_sums()
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Divides every row with at least one neighbour by its row sum.
    ///
    /// Each row with neighbours sums to one afterwards. Isolated rows are left
    /// at zero and reported, never divided.
    pub fn row_standardize(&self) -> RowStandardized {
        let sums = self.row_sums();
        let mut weights = self.weights.clone();
        let mut symmetry = Array1::<f64>::zeros(self.len());
        let mut warnings = Vec::new();
        for (i, mut row) in weights.rows_mut().into_iter().enumerate() {
            let total = sums[i];
            if total > 0.0 {
                row.mapv_inplace(|w| w / total);
                symmetry[i] = 1.0 / total;
            } else {
                log::warn!("Areal unit {} has no neighbours; it is treated as isolated.", i);
                warnings.push(IsolatedUnitWarning { unit: i });
            }
        }
        RowStandardized {
            weights,
            symmetry,
            warnings,
        }
    }

    /// Neighbourhood extended by new units. `new_neighbors[k]` lists existing
    /// units adjacent to new unit `len() + k`.
    pub fn with_new_units(&self, new_neighbors: &[Vec<usize>]) -> Result<Self, NeighborhoodError> {
        let n = self.len();
        let total = n + new_neighbors.len();
        let mut weights = Array2::<f64>::zeros((total, total));
        weights
            .slice_mut(ndarray::s![..n, ..n])
            .assign(&self.weights);
        for (k, list) in new_neighbors.iter().enumerate() {
            let unit = n + k;
            for &neighbor in list {
                if neighbor >= n {
                    return Err(NeighborhoodError::NeighborOutOfRange {
                        unit,
                        neighbor,
                        len: n,
                    });
                }
                weights[(unit, neighbor)] = 1.0;
                weights[(neighbor, unit)] = 1.0;
            }
        }
        Ok(Self { weights })
    }
}
