//! SO(2) × R - state of a single revolute joint
//!
//! The angle is stored as a unit complex number `[cos θ, sin θ]` followed by the
//! joint velocity ω, so `nx = 3` while the tangent space `[δθ, δω]` has `ndx = 2`.
//! Angular differences are computed on the group and therefore never wrap.
//!
//! SO(2) is abelian, so every Jacobian of `diff` and `integrate` reduces to a
//! signed identity in tangent coordinates.

use crate::manifold::StateManifold;
use nalgebra::{Complex, DMatrix, DVector, UnitComplex};
use rand::Rng;
use std::f64::consts::PI;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// State space of a pendulum-like joint: orientation on the circle plus velocity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSO2;

impl Display for StateSO2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "StateSO2(nx: 3, ndx: 2)")
    }
}

impl StateSO2 {
    pub fn new() -> Self {
        StateSO2
    }

    /// Build a state from an angle and a velocity.
    pub fn from_angle(theta: f64, velocity: f64) -> DVector<f64> {
        DVector::from_vec(vec![theta.cos(), theta.sin(), velocity])
    }

    /// Rotation part of a state, renormalized.
    pub fn rotation(x: &DVector<f64>) -> UnitComplex<f64> {
        UnitComplex::new_normalize(Complex::new(x[0], x[1]))
    }

    /// Angle of a state in `(-π, π]`.
    pub fn angle(x: &DVector<f64>) -> f64 {
        Self::rotation(x).angle()
    }
}

impl StateManifold for StateSO2 {
    fn nx(&self) -> usize {
        3
    }

    fn ndx(&self) -> usize {
        2
    }

    fn zero(&self) -> DVector<f64> {
        Self::from_angle(0.0, 0.0)
    }

    fn random(&self) -> DVector<f64> {
        let mut rng = rand::rng();
        let theta = rng.random_range(-PI..PI);
        let velocity = rng.random_range(-1.0..1.0);
        Self::from_angle(theta, velocity)
    }

    fn diff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DVector<f64> {
        let r0 = Self::rotation(x0);
        let r1 = Self::rotation(x1);
        let dtheta = (r0.inverse() * r1).angle();
        DVector::from_vec(vec![dtheta, x1[2] - x0[2]])
    }

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        let rotation = Self::rotation(x) * UnitComplex::new(dx[0]);
        DVector::from_vec(vec![rotation.re, rotation.im, x[2] + dx[1]])
    }

    fn jdiff(&self, _x0: &DVector<f64>, _x1: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let identity = DMatrix::identity(2, 2);
        (-identity.clone(), identity)
    }

    fn jintegrate(&self, _x: &DVector<f64>, _dx: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let identity = DMatrix::identity(2, 2);
        (identity.clone(), identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_so2_state_zero() {
        let state = StateSO2::new();
        let zero = state.zero();
        assert_eq!(zero, DVector::from_vec(vec![1.0, 0.0, 0.0]));
        assert!(StateSO2::angle(&zero).abs() < TOLERANCE);
    }

    #[test]
    fn test_so2_state_diff_wraps_through_pi() {
        let state = StateSO2::new();
        let x0 = StateSO2::from_angle(PI - 0.1, 0.0);
        let x1 = StateSO2::from_angle(-PI + 0.1, 1.0);

        let dx = state.diff(&x0, &x1);
        assert!((dx[0] - 0.2).abs() < 1e-10);
        assert!((dx[1] - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_so2_state_integrate_inverts_diff() {
        let state = StateSO2::new();
        for _ in 0..10 {
            let x0 = state.random();
            let x1 = state.random();
            let dx = state.diff(&x0, &x1);
            let back = state.integrate(&x0, &dx);
            assert!((back - &x1).norm() < 1e-10);
        }
    }

    #[test]
    fn test_so2_state_integrate_stays_on_circle() {
        let state = StateSO2::new();
        let x = StateSO2::from_angle(0.3, -0.5);
        let dx = DVector::from_vec(vec![7.5, 2.0]);
        let y = state.integrate(&x, &dx);
        assert!((y[0] * y[0] + y[1] * y[1] - 1.0).abs() < TOLERANCE);
        assert!((y[2] - 1.5).abs() < TOLERANCE);
    }

    #[test]
    fn test_so2_state_jdiff_matches_finite_differences() {
        let state = StateSO2::new();
        let x0 = StateSO2::from_angle(0.4, 0.2);
        let x1 = StateSO2::from_angle(-1.1, 0.7);
        let (j0, j1) = state.jdiff(&x0, &x1);

        let h = 1e-7;
        let base = state.diff(&x0, &x1);
        for i in 0..2 {
            let mut e = DVector::zeros(2);
            e[i] = h;
            let d0 = (state.diff(&state.integrate(&x0, &e), &x1) - &base) / h;
            let d1 = (state.diff(&x0, &state.integrate(&x1, &e)) - &base) / h;
            for r in 0..2 {
                assert!((d0[r] - j0[(r, i)]).abs() < 1e-5);
                assert!((d1[r] - j1[(r, i)]).abs() < 1e-5);
            }
        }
    }
}
