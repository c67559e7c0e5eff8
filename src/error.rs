//! Error types for the apex-ddp library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`ApexDdpError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`CoreError`, `OptimizerError`, etc.) are wrapped inside ApexDdpError
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! ApexDdpError::Core(
//!     CoreError::DimensionMismatch(
//!         "stage 3: control has 1 entries, model expects 2"
//!     )
//! )
//! ```

use crate::{
    core::CoreError, linalg::LinAlgError, manifold::ManifoldError, observers::ObserverError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the apex-ddp library
pub type ApexDdpResult<T> = Result<T, ApexDdpError>;

/// Main error type for the apex-ddp library
///
/// Wraps module-specific errors while preserving the full error chain.
///
/// ```rust,ignore
/// if let Err(e) = solver.solve(&mut problem, None, None, false, None) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum ApexDdpError {
    /// Core module errors (action models, shooting problem)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Solver errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// State manifold errors
    #[error(transparent)]
    Manifold(#[from] ManifoldError),

    /// Observer errors
    #[error(transparent)]
    Observer(#[from] ObserverError),
}

impl ApexDdpError {
    /// Get the full error chain as a multi-line string.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// ```rust,ignore
    /// error!("Solve failed: {}", err.chain_compact());
    /// ```
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
