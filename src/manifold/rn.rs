//! Rⁿ - Euclidean state space
//!
//! States and tangent vectors coincide: `x ⊕ δx = x + δx` and `x₁ ⊖ x₀ = x₁ - x₀`.
//! All Jacobians are (signed) identities.

use crate::manifold::StateManifold;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Euclidean state space of fixed dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateVector {
    nx: usize,
}

impl Display for StateVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "StateVector(nx: {})", self.nx)
    }
}

impl StateVector {
    /// Create an `nx`-dimensional Euclidean state space.
    pub fn new(nx: usize) -> Self {
        StateVector { nx }
    }
}

impl StateManifold for StateVector {
    fn nx(&self) -> usize {
        self.nx
    }

    fn ndx(&self) -> usize {
        self.nx
    }

    fn zero(&self) -> DVector<f64> {
        DVector::zeros(self.nx)
    }

    fn random(&self) -> DVector<f64> {
        let mut rng = rand::rng();
        DVector::from_fn(self.nx, |_, _| rng.random_range(-1.0..1.0))
    }

    fn diff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DVector<f64> {
        x1 - x0
    }

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        x + dx
    }

    fn jdiff(&self, _x0: &DVector<f64>, _x1: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let identity = DMatrix::identity(self.nx, self.nx);
        (-identity.clone(), identity)
    }

    fn jintegrate(&self, _x: &DVector<f64>, _dx: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let identity = DMatrix::identity(self.nx, self.nx);
        (identity.clone(), identity)
    }
}
