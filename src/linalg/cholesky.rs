use faer::{
    Side,
    linalg::solvers::{Llt, Solve},
};
use nalgebra::{DMatrix, DVector};

use crate::linalg::{LinAlgError, LinAlgResult, to_faer, to_nalgebra};

/// Dense LLᵀ factorization of a small symmetric matrix.
///
/// The solver factorizes one matrix at a time; calling [`factorize`](Self::factorize)
/// again replaces the previous factor. The backward pass reuses one instance
/// for every stage of the horizon.
#[derive(Debug, Default)]
pub struct DenseCholeskySolver {
    factor: Option<Llt<f64>>,
    dimension: usize,
}

impl DenseCholeskySolver {
    pub fn new() -> Self {
        DenseCholeskySolver {
            factor: None,
            dimension: 0,
        }
    }

    /// Dimension of the last factorized matrix.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Factorize a symmetric positive-definite matrix.
    ///
    /// # Errors
    /// - `DimensionMismatch` if the matrix is not square
    /// - `NumericalInstability` if it contains NaN or Inf
    /// - `NotPositiveDefinite` if a pivot is not strictly positive
    pub fn factorize(&mut self, matrix: &DMatrix<f64>) -> LinAlgResult<()> {
        self.factor = None;
        if matrix.nrows() != matrix.ncols() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "{}x{} matrix is not square",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if !matrix.iter().all(|v| v.is_finite()) {
            return Err(LinAlgError::NumericalInstability(
                "matrix to factorize contains NaN or Inf".to_string(),
            ));
        }

        // Indefinite matrices are expected while regularization is still small,
        // so the faer error is folded into the message rather than logged.
        let llt = Llt::new(to_faer(matrix).as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::NotPositiveDefinite(format!("{e:?}")))?;

        self.dimension = matrix.nrows();
        self.factor = Some(llt);
        Ok(())
    }

    /// Solve `A X = B` with the last factorized `A`.
    pub fn solve(&self, rhs: &DMatrix<f64>) -> LinAlgResult<DMatrix<f64>> {
        let factor = self.factor.as_ref().ok_or_else(|| {
            LinAlgError::FactorizationFailed("solve called before factorize".to_string())
        })?;
        if rhs.nrows() != self.dimension {
            return Err(LinAlgError::DimensionMismatch(format!(
                "right-hand side has {} rows, factor has dimension {}",
                rhs.nrows(),
                self.dimension
            )));
        }
        let solution = factor.solve(&to_faer(rhs));
        Ok(to_nalgebra(&solution))
    }

    /// Solve `A x = b` for a single right-hand side.
    pub fn solve_vector(&self, rhs: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        let solution = self.solve(&DMatrix::from_column_slice(rhs.len(), 1, rhs.as_slice()))?;
        Ok(DVector::from_column_slice(solution.as_slice()))
    }
}
