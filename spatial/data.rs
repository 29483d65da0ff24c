//! # Data Containers and Validation
//!
//! This module is the entry point for user-provided, in-memory tabular data.
//! A [`SpatialFrame`] holds named numeric columns; [`TrainingData`] is the
//! validated form consumed by the estimator: an intercept-first design matrix
//! and response vector for the units with an observed response, plus the
//! design rows of held-out units (missing response) kept for prediction.
//!
//! - Missing responses are encoded as `NaN` in a frame column, or `None` in
//!   the raw constructor. Predictors and coordinates must be finite.
//! - Failures are assumed to be user-input errors and are reported through
//!   [`DataError`] with the offending column named.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::distance::Coordinate;

/// Name given to the intercept column of every design matrix.
pub const INTERCEPT_TERM: &str = "(Intercept)";

/// A comprehensive error type for all data validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("The required column '{0}' was not found. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("A column named '{0}' already exists in the frame.")]
    DuplicateColumn(String),
    #[error("Column '{column}' has {found} values, but the frame has {expected} rows.")]
    LengthMismatch {
        column: String,
        found: usize,
        expected: usize,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in column '{0}'. Predictors and coordinates must be finite."
    )]
    NonFiniteValuesFound(String),
    #[error(
        "Only {found} units have an observed response, but at least {required} are needed to estimate {required_minus_one} coefficients."
    )]
    InsufficientRows {
        found: usize,
        required: usize,
        required_minus_one: usize,
    },
}

/// A named numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<f64>,
}

/// An ordered collection of equally long named numeric columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialFrame {
    columns: Vec<Column>,
}

impl SpatialFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column, checking its length against the existing ones.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, DataError> {
        let name = name.into();
        if self.columns.iter().any(|c| c.name == name) {
            return Err(DataError::DuplicateColumn(name));
        }
        if let Some(first) = self.columns.first() {
            if first.values.len() != values.len() {
                return Err(DataError::LengthMismatch {
                    column: name,
                    found: values.len(),
                    expected: first.values.len(),
                });
            }
        }
        self.columns.push(Column { name, values });
        Ok(self)
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Result<&[f64], DataError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
    }

    /// Point coordinates assembled from two finite columns.
    pub fn coordinates(&self, x: &str, y: &str) -> Result<Vec<Coordinate>, DataError> {
        let xs = finite_column(self, x)?;
        let ys = finite_column(self, y)?;
        Ok(xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| Coordinate::new(x, y))
            .collect())
    }
}

fn finite_column<'a>(frame: &'a SpatialFrame, name: &str) -> Result<&'a [f64], DataError> {
    let values = frame.column(name)?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(name.to_string()));
    }
    Ok(values)
}

/// A container for validated data ready for model fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    /// Observed responses, in unit order.
    pub y: Array1<f64>,
    /// Design matrix of the observed units; column 0 is the intercept.
    pub x: Array2<f64>,
    /// Design rows of the units whose response is missing.
    pub x_held_out: Array2<f64>,
    /// Unit indices (into the full unit set) of the observed rows.
    pub observed: Vec<usize>,
    /// Unit indices of the held-out rows.
    pub held_out: Vec<usize>,
    /// Column names of the design matrix, intercept first.
    pub terms: Vec<String>,
}

impl TrainingData {
    /// Builds training data from a predictor matrix (without intercept) and a
    /// response with optional missing values. `names` labels the predictor columns.
    pub fn new(
        predictors: ArrayView2<f64>,
        response: &[Option<f64>],
        names: &[&str],
    ) -> Result<Self, DataError> {
        let n = response.len();
        if predictors.nrows() != n {
            return Err(DataError::LengthMismatch {
                column: "predictors".to_string(),
                found: predictors.nrows(),
                expected: n,
            });
        }
        if names.len() != predictors.ncols() {
            return Err(DataError::LengthMismatch {
                column: "predictor names".to_string(),
                found: names.len(),
                expected: predictors.ncols(),
            });
        }
        for (j, column) in predictors.columns().into_iter().enumerate() {
            if column.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(names[j].to_string()));
            }
        }
        if response.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound("response".to_string()));
        }

        let (observed, held_out): (Vec<usize>, Vec<usize>) =
            (0..n).partition(|&i| response[i].is_some());

        let p = predictors.ncols() + 1;
        if observed.len() <= p {
            return Err(DataError::InsufficientRows {
                found: observed.len(),
                required: p + 1,
                required_minus_one: p,
            });
        }

        let design_rows = |rows: &[usize]| {
            let mut out = Array2::<f64>::ones((rows.len(), p));
            for (r, &unit) in rows.iter().enumerate() {
                for j in 0..predictors.ncols() {
                    out[(r, j + 1)] = predictors[(unit, j)];
                }
            }
            out
        };

        let y = observed
            .iter()
            .filter_map(|&i| response[i])
            .collect::<Array1<f64>>();
        let mut terms = Vec::with_capacity(p);
        terms.push(INTERCEPT_TERM.to_string());
        terms.extend(names.iter().map(|s| s.to_string()));

        Ok(Self {
            y,
            x: design_rows(&observed),
            x_held_out: design_rows(&held_out),
            observed,
            held_out,
            terms,
        })
    }

    /// Builds training data from named frame columns. `NaN` in the response
    /// column marks a held-out unit.
    pub fn from_frame(
        frame: &SpatialFrame,
        response: &str,
        predictors: &[String],
    ) -> Result<Self, DataError> {
        let y_column = frame.column(response)?;
        if y_column.iter().any(|v| v.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound(response.to_string()));
        }
        let n = frame.n_rows();
        let mut matrix = Array2::<f64>::zeros((n, predictors.len()));
        for (j, name) in predictors.iter().enumerate() {
            let values = finite_column(frame, name)?;
            matrix.column_mut(j).assign(&Array1::from(values.to_vec()));
        }
        let y: Vec<Option<f64>> = y_column
            .iter()
            .map(|&v| if v.is_nan() { None } else { Some(v) })
            .collect();
        let names: Vec<&str> = predictors.iter().map(String::as_str).collect();
        Self::new(matrix.view(), &y, &names)
    }

    /// Total number of units, observed and held out.
    pub fn n_units(&self) -> usize {
        self.observed.len() + self.held_out.len()
    }

    pub fn n_observed(&self) -> usize {
        self.observed.len()
    }

    pub fn n_coefficients(&self) -> usize {
        self.x.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn missing_responses_are_held_out() {
        let predictors = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        let response = vec![Some(1.0), None, Some(2.5), Some(3.0), Some(4.5)];
        let data = TrainingData::new(predictors.view(), &response, &["elev"]).unwrap();

        assert_eq!(data.observed, vec![0, 2, 3, 4]);
        assert_eq!(data.held_out, vec![1]);
        assert_eq!(data.y, array![1.0, 2.5, 3.0, 4.5]);
        assert_eq!(data.x.dim(), (4, 2));
        assert_eq!(data.x_held_out, array![[1.0, 2.0]]);
        assert_eq!(data.terms, vec!["(Intercept)", "elev"]);
        assert_eq!(data.n_units(), 5);
    }

    #[test]
    fn frame_round_trip_uses_nan_as_missing() {
        let frame = SpatialFrame::new()
            .with_column("z", vec![1.0, f64::NAN, 3.0, 4.0])
            .unwrap()
            .with_column("cov", vec![0.1, 0.2, 0.3, 0.5])
            .unwrap();
        let data = TrainingData::from_frame(&frame, "z", &[]).unwrap();
        assert_eq!(data.held_out, vec![1]);
        assert_eq!(data.x.ncols(), 1);

        let with_cov = TrainingData::from_frame(&frame, "z", &["cov".to_string()]).unwrap();
        assert_eq!(with_cov.x[(2, 1)], 0.5);
    }

    #[test]
    fn invalid_columns_are_reported_by_name() {
        let frame = SpatialFrame::new()
            .with_column("z", vec![1.0, 2.0, 3.0])
            .unwrap()
            .with_column("bad", vec![1.0, f64::NAN, 0.0])
            .unwrap();
        match TrainingData::from_frame(&frame, "z", &["bad".to_string()]) {
            Err(DataError::NonFiniteValuesFound(name)) => assert_eq!(name, "bad"),
            other => panic!("expected NonFiniteValuesFound, got {other:?}"),
        }
        assert!(matches!(
            TrainingData::from_frame(&frame, "missing", &[]),
            Err(DataError::ColumnNotFound(_))
        ));
        assert!(matches!(
            frame.clone().with_column("short", vec![1.0]),
            Err(DataError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn too_few_observed_rows_fail() {
        let predictors = array![[1.0], [2.0], [3.0]];
        let response = vec![Some(1.0), Some(2.0), None];
        assert!(matches!(
            TrainingData::new(predictors.view(), &response, &["a"]),
            Err(DataError::InsufficientRows { found: 2, .. })
        ));
    }
}
