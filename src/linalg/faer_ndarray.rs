use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, ArrayViewMut1, Data, Ix1, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factor has a non-positive or non-finite pivot at index {index}: {value:e}")]
    DegeneratePivot { index: usize, value: f64 },
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];

    // SAFETY: dimensions and strides come straight from the owning Array2,
    // and the mutable borrow is held for the lifetime of the view.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: same contract as array2_to_mat_mut, viewed as a single column.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

/// Borrowed faer view over an ndarray matrix.
///
/// Layouts with non-positive strides are copied into a compact owned buffer
/// first, since faer kernels assume forward traversal.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from the owned compact copy stored in
        // this wrapper, which outlives the returned view.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

pub trait FaerEigh {
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

/// Lower Cholesky factor `L` of a symmetric positive-definite matrix, `A = L L^T`.
///
/// Every solve goes through the triangular factor; no inverse is ever formed.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn dim(&self) -> usize {
        self.factor.L().nrows()
    }

    pub fn solve_vec<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix1>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn solve_mat<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    /// `L^-1 b`: maps `b` to coordinates where the covariance is the identity.
    pub fn whiten_vec<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix1>) -> Array1<f64> {
        let mut out = rhs.to_owned();
        forward_substitute(self.factor.L(), out.view_mut());
        out
    }

    /// `L^-1 B`, column by column.
    pub fn whiten_mat<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        let mut out = rhs.to_owned();
        let l = self.factor.L();
        for col in out.columns_mut() {
            forward_substitute(l, col);
        }
        out
    }

    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    pub fn lower_triangular(&self) -> Array2<f64> {
        mat_to_array(self.factor.L())
    }

    /// `ln det(A) = 2 * sum(ln L_ii)`, accumulated with compensation.
    pub fn log_determinant(&self) -> f64 {
        let l = self.factor.L();
        let mut acc = crate::linalg::utils::KahanSum::default();
        for i in 0..l.nrows() {
            acc.add(l[(i, i)].ln());
        }
        2.0 * acc.sum()
    }
}

fn forward_substitute(l: MatRef<'_, f64>, mut rhs: ArrayViewMut1<'_, f64>) {
    let n = l.nrows();
    debug_assert_eq!(rhs.len(), n);
    for i in 0..n {
        let mut v = rhs[i];
        for j in 0..i {
            v -= l[(i, j)] * rhs[j];
        }
        rhs[i] = v / l[(i, i)];
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        // faer accepts tiny positive pivots that overflow once inverted; a usable
        // factor needs a strictly positive, finite diagonal.
        let l = factor.L();
        for i in 0..l.nrows() {
            let value = l[(i, i)];
            if !value.is_finite() || value <= 0.0 {
                return Err(FaerLinalgError::DegeneratePivot { index: i, value });
            }
        }
        Ok(FaerCholeskyFactor { factor })
    }
}

pub trait FaerQr {
    /// Householder QR, returning only the upper-trapezoidal `R`
    /// (`min(rows, cols) x cols`).
    fn qr_r(&self) -> Array2<f64>;
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    fn qr_r(&self) -> Array2<f64> {
        let faer_view = FaerArrayView::new(self);
        let qr = faer_view.as_ref().qr();
        let r = qr.R();
        let rows = r.nrows().min(self.nrows()).min(self.ncols());
        Array2::from_shape_fn((rows, r.ncols()), |(i, j)| if i <= j { r[(i, j)] } else { 0.0 })
    }
}
