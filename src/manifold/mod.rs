//! State manifolds for optimal control problems.
//!
//! A state lives in a representation of size `nx` while perturbations live in a
//! tangent space of size `ndx`. The solver never adds vectors to states directly;
//! it goes through [`StateManifold::diff`] and [`StateManifold::integrate`]:
//!
//! State space   | nx    | ndx | x                     | x ⊕ δx                        | x₁ ⊖ x₀
//! ------------- | ----- | --- | --------------------- | ----------------------------- | -----------------------
//! Rⁿ            | n     | n   | v ∈ Rⁿ                | v + δx                        | v₁ - v₀
//! SO(2) × R     | 3     | 2   | [cos θ, sin θ, ω]     | [R(θ)·Exp(δθ), ω + δω]        | [Log(R₀ᵀR₁), ω₁ - ω₀]
//!
//! Jacobians follow the right-perturbation convention: `jdiff` returns the
//! derivatives of `x₁ ⊖ x₀` with respect to perturbations of `x₀` and `x₁`, and
//! `jintegrate` returns the derivatives of `x ⊕ δx` with respect to `x` and `δx`,
//! both expressed in the tangent space of the result.

use nalgebra::{DMatrix, DVector};
use std::{
    error, fmt,
    fmt::{Debug, Display, Formatter},
};

pub mod rn;
pub mod so2;

pub use rn::StateVector;
pub use so2::StateSO2;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifoldError {
    /// Invalid tangent vector dimension
    InvalidTangentDimension { expected: usize, actual: usize },
    /// Invalid manifold element
    InvalidElement(String),
    /// State representation has the wrong size
    DimensionMismatch { expected: usize, actual: usize },
    /// NaN or Inf detected in manifold element
    InvalidNumber,
}

impl Display for ManifoldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldError::InvalidTangentDimension { expected, actual } => {
                write!(
                    f,
                    "Invalid tangent dimension: expected {expected}, got {actual}"
                )
            }
            ManifoldError::InvalidElement(msg) => {
                write!(f, "Invalid manifold element: {msg}")
            }
            ManifoldError::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {expected}, got {actual}")
            }
            ManifoldError::InvalidNumber => {
                write!(f, "Invalid number: NaN or Inf detected")
            }
        }
    }
}

impl error::Error for ManifoldError {}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Runtime description of a state space.
///
/// Implementations are shared between action models through `Arc<dyn StateManifold>`,
/// so they must be thread-safe and stateless.
pub trait StateManifold: Debug + Send + Sync {
    /// Size of the state representation.
    fn nx(&self) -> usize;

    /// Size of the tangent space.
    fn ndx(&self) -> usize;

    /// Neutral state.
    fn zero(&self) -> DVector<f64>;

    /// Random valid state.
    fn random(&self) -> DVector<f64>;

    /// Tangent vector taking `x0` to `x1`, i.e. `x1 ⊖ x0`.
    fn diff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DVector<f64>;

    /// State reached from `x` along the tangent vector `dx`, i.e. `x ⊕ dx`.
    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64>;

    /// Jacobians of `x1 ⊖ x0` with respect to `x0` and `x1`.
    fn jdiff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);

    /// Jacobians of `x ⊕ dx` with respect to `x` and `dx`.
    fn jintegrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);

    /// Check that `x` is a finite state of the right size.
    fn check_state(&self, x: &DVector<f64>) -> ManifoldResult<()> {
        if x.len() != self.nx() {
            return Err(ManifoldError::DimensionMismatch {
                expected: self.nx(),
                actual: x.len(),
            });
        }
        if !x.iter().all(|v| v.is_finite()) {
            return Err(ManifoldError::InvalidNumber);
        }
        Ok(())
    }

    /// Check that `dx` is a tangent vector of the right size.
    fn check_tangent(&self, dx: &DVector<f64>) -> ManifoldResult<()> {
        if dx.len() != self.ndx() {
            return Err(ManifoldError::InvalidTangentDimension {
                expected: self.ndx(),
                actual: dx.len(),
            });
        }
        Ok(())
    }
}
