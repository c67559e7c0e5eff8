pub mod cholesky;

pub use cholesky::DenseCholeskySolver;

use faer::Mat;
use nalgebra::DMatrix;
use thiserror::Error;
use tracing::error;

/// Linear algebra specific error types for apex-ddp
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Cholesky hit a non-positive pivot
    #[error("Matrix is not positive definite: {0}")]
    NotPositiveDefinite(String),

    /// Operand shapes are incompatible
    #[error("Matrix dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// NaN or Inf in an input or output
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// Llt::new(matrix.as_ref(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::NotPositiveDefinite("Quu".to_string()).log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Copy a nalgebra matrix into a faer matrix.
pub fn to_faer(matrix: &DMatrix<f64>) -> Mat<f64> {
    Mat::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[(i, j)])
}

/// Copy a faer matrix into a nalgebra matrix.
pub fn to_nalgebra(matrix: &Mat<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[(i, j)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_conversion_roundtrip() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let f = to_faer(&m);
        assert_eq!(f.nrows(), 2);
        assert_eq!(f.ncols(), 3);
        assert_eq!(f[(1, 2)], 6.0);
        assert_eq!(to_nalgebra(&f), m);
    }

    #[test]
    fn test_linalg_error_display() {
        let err = LinAlgError::DimensionMismatch("2x3 is not square".to_string());
        assert!(err.to_string().contains("2x3"));
    }
}
