//! Core components of an optimal control problem
//!
//! - Action models: discrete dynamics plus stage cost, with derivatives
//! - Finite-difference wrapper for checking analytical derivatives
//! - The shooting problem tying a horizon of action models to an initial state

pub mod action;
pub mod numdiff;
pub mod problem;

use thiserror::Error;
use tracing::error;

/// Core module error types for action models and shooting problems
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// State, control or trajectory length does not match the model
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// The model does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// An iterative routine ran out of iterations
    #[error("Convergence failure: {0}")]
    ConvergenceFailure(String),

    /// NaN or Inf produced by a model evaluation
    #[error("Invalid numeric value: {0}")]
    InvalidNumericValue(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
