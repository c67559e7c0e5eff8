//! Torque-driven pendulum on SO(2) × R.

use crate::core::CoreResult;
use crate::core::action::{ActionData, ActionModel, check_arguments, quasi_static_newton};
use crate::manifold::{StateManifold, StateSO2};
use nalgebra::{DMatrix, DVector, UnitComplex};
use std::f64::consts::PI;
use std::sync::Arc;

/// Damped pendulum with a torque motor at the pivot.
///
/// The angle θ is measured from the hanging position and stored on the circle, so
/// swinging through ±π never produces a jump. Dynamics use a symplectic Euler step:
///
/// ```text
/// a  = (τ − m·g·l·sin θ − b·ω) / (m·l²)
/// ω' = ω + a·dt
/// θ' = θ ⊕ ω'·dt
/// ```
///
/// The cost penalizes the angular error to a goal orientation (upright by default),
/// the velocity and the torque:
///
/// ```text
/// l(x, τ) = ½ w_θ·(θ ⊖ θ_goal)² + ½ w_ω·ω² + ½ w_τ·τ²
/// ```
#[derive(Debug, Clone)]
pub struct ActionModelPendulum {
    state: Arc<dyn StateManifold>,
    mass: f64,
    length: f64,
    gravity: f64,
    damping: f64,
    dt: f64,
    goal: UnitComplex<f64>,
    angle_weight: f64,
    velocity_weight: f64,
    torque_weight: f64,
}

impl Default for ActionModelPendulum {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionModelPendulum {
    /// Unit mass and length, light damping, 20 ms steps, swing-up cost.
    pub fn new() -> Self {
        ActionModelPendulum {
            state: Arc::new(StateSO2::new()),
            mass: 1.0,
            length: 1.0,
            gravity: 9.81,
            damping: 0.1,
            dt: 0.02,
            goal: UnitComplex::new(PI),
            angle_weight: 1.0,
            velocity_weight: 0.1,
            torque_weight: 1e-3,
        }
    }

    pub fn with_physics(mut self, mass: f64, length: f64, damping: f64) -> Self {
        self.mass = mass;
        self.length = length;
        self.damping = damping;
        self
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    /// Goal orientation, measured from the hanging position.
    pub fn with_goal(mut self, angle: f64) -> Self {
        self.goal = UnitComplex::new(angle);
        self
    }

    pub fn with_cost_weights(mut self, angle: f64, velocity: f64, torque: f64) -> Self {
        self.angle_weight = angle;
        self.velocity_weight = velocity;
        self.torque_weight = torque;
        self
    }

    fn inertia(&self) -> f64 {
        self.mass * self.length * self.length
    }

    fn acceleration(&self, sin_theta: f64, velocity: f64, torque: f64) -> f64 {
        (torque - self.mass * self.gravity * self.length * sin_theta - self.damping * velocity)
            / self.inertia()
    }

    fn angle_error(&self, x: &DVector<f64>) -> f64 {
        (self.goal.inverse() * StateSO2::rotation(x)).angle()
    }
}

impl ActionModel for ActionModelPendulum {
    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nu(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        "ActionModelPendulum"
    }

    fn calc(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        check_arguments(self, x, u)?;
        let error = self.angle_error(x);
        let velocity = x[2];
        data.cost = 0.5 * self.angle_weight * error * error
            + 0.5 * self.velocity_weight * velocity * velocity;

        match u {
            Some(u) => {
                let torque = u[0];
                let rotation = StateSO2::rotation(x);
                let a = self.acceleration(rotation.im, velocity, torque);
                let next_velocity = velocity + a * self.dt;
                let step = DVector::from_vec(vec![next_velocity * self.dt, a * self.dt]);
                data.xnext = self.state.integrate(x, &step);
                data.cost += 0.5 * self.torque_weight * torque * torque;
            }
            None => data.xnext.clone_from(x),
        }
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        check_arguments(self, x, u)?;
        let error = self.angle_error(x);
        let velocity = x[2];
        data.lx = DVector::from_vec(vec![
            self.angle_weight * error,
            self.velocity_weight * velocity,
        ]);
        data.lxx = DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.angle_weight,
            self.velocity_weight,
        ]));
        data.lxu = DMatrix::zeros(2, 1);

        match u {
            Some(u) => {
                let dt = self.dt;
                let cos_theta = StateSO2::rotation(x).re;
                let da_dtheta = -self.gravity * cos_theta / self.length;
                let da_domega = -self.damping / self.inertia();
                let da_du = 1.0 / self.inertia();

                data.fx = DMatrix::from_row_slice(
                    2,
                    2,
                    &[
                        1.0 + da_dtheta * dt * dt,
                        dt + da_domega * dt * dt,
                        da_dtheta * dt,
                        1.0 + da_domega * dt,
                    ],
                );
                data.fu = DMatrix::from_row_slice(2, 1, &[da_du * dt * dt, da_du * dt]);
                data.lu = DVector::from_vec(vec![self.torque_weight * u[0]]);
                data.luu = DMatrix::from_element(1, 1, self.torque_weight);
            }
            None => {
                data.fx = DMatrix::identity(2, 2);
                data.fu = DMatrix::zeros(2, 1);
                data.lu = DVector::zeros(1);
                data.luu = DMatrix::zeros(1, 1);
            }
        }
        Ok(())
    }

    fn quasi_static(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        max_iter: usize,
        tol: f64,
    ) -> CoreResult<DVector<f64>> {
        quasi_static_newton(self, data, x, max_iter, tol)
    }
}
