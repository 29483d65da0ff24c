use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

/// Smallest admissible ratio between the smallest and largest Cholesky pivot.
/// The squared ratio bounds the reciprocal condition number of the factored matrix.
pub const MIN_PIVOT_RATIO: f64 = 1e-7;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error(
        "Matrix is numerically singular: pivot ratio {ratio:.3e} is below the admissible {min:.1e}"
    )]
    IllConditioned { ratio: f64, min: f64 },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy `faer` view of a standard- or Fortran-layout `ndarray` matrix.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = if let Some(slice) = array.as_slice() {
            FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1))
        } else {
            FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerEigh {
    /// Eigenvalues (ascending) and eigenvectors of a symmetric matrix.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

/// Lower Cholesky factor `A = L Lᵀ` of a symmetric positive definite matrix.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }

    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    pub fn lower(&self) -> Array2<f64> {
        mat_to_array(self.factor.L())
    }

    /// `ln |A| = 2 Σ ln Lᵢᵢ`.
    pub fn log_det(&self) -> f64 {
        2.0 * self.diag().iter().map(|d| d.ln()).sum::<f64>()
    }

    pub fn inverse(&self) -> Array2<f64> {
        let n = self.factor.L().nrows();
        self.solve_mat(&Array2::eye(n))
    }

    /// Ratio of the smallest to the largest pivot of `L`.
    pub fn pivot_ratio(&self) -> f64 {
        let diag = self.diag();
        let max = diag.iter().fold(0.0_f64, |acc, &d| acc.max(d));
        let min = diag.iter().fold(f64::INFINITY, |acc, &d| acc.min(d));
        if max > 0.0 && min.is_finite() {
            min / max
        } else {
            0.0
        }
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;

    /// Cholesky factorization that also rejects numerically singular input
    /// by inspecting the pivots before the factor is handed out.
    fn checked_cholesky(&self) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let factor = self.cholesky(Side::Lower)?;
        let ratio = factor.pivot_ratio();
        if !(ratio >= MIN_PIVOT_RATIO) {
            return Err(FaerLinalgError::IllConditioned {
                ratio,
                min: MIN_PIVOT_RATIO,
            });
        }
        Ok(factor)
    }
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// Solves `L x = b` for a lower-triangular `L` by forward substitution.
pub fn forward_substitute(lower: &Array2<f64>, rhs: &Array1<f64>) -> Array1<f64> {
    let n = rhs.len();
    let mut out = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut acc = rhs[i];
        for j in 0..i {
            acc -= lower[(i, j)] * out[j];
        }
        out[i] = acc / lower[(i, i)];
    }
    out
}
