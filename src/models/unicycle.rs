//! Unicycle action model.

use crate::core::CoreResult;
use crate::core::action::{ActionData, ActionModel, check_arguments};
use crate::manifold::{StateManifold, StateVector};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Planar unicycle driven by forward and angular velocity.
///
/// State `[x, y, θ]`, control `[v, ω]`, explicit Euler step of length `dt`:
///
/// ```text
/// x' = x + v·cos θ·dt
/// y' = y + v·sin θ·dt
/// θ' = θ + ω·dt
/// l(x, u) = ½ ‖w_state·x‖² + ½ ‖w_control·u‖²
/// ```
///
/// The cost pulls the vehicle to the origin; because it cannot move sideways the
/// optimal trajectory is a curved manoeuvre.
#[derive(Debug, Clone)]
pub struct ActionModelUnicycle {
    state: Arc<dyn StateManifold>,
    dt: f64,
    state_weight: f64,
    control_weight: f64,
}

impl Default for ActionModelUnicycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionModelUnicycle {
    /// Unicycle with `dt = 0.1`, state weight 10 and control weight 1.
    pub fn new() -> Self {
        ActionModelUnicycle {
            state: Arc::new(StateVector::new(3)),
            dt: 0.1,
            state_weight: 10.0,
            control_weight: 1.0,
        }
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_cost_weights(mut self, state_weight: f64, control_weight: f64) -> Self {
        self.state_weight = state_weight;
        self.control_weight = control_weight;
        self
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn cost_weights(&self) -> (f64, f64) {
        (self.state_weight, self.control_weight)
    }
}

impl ActionModel for ActionModelUnicycle {
    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nu(&self) -> usize {
        2
    }

    fn name(&self) -> &str {
        "ActionModelUnicycle"
    }

    fn calc(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        check_arguments(self, x, u)?;
        let ws2 = self.state_weight * self.state_weight;
        data.cost = 0.5 * ws2 * x.norm_squared();
        match u {
            Some(u) => {
                let (s, c) = x[2].sin_cos();
                data.xnext = DVector::from_vec(vec![
                    x[0] + c * u[0] * self.dt,
                    x[1] + s * u[0] * self.dt,
                    x[2] + u[1] * self.dt,
                ]);
                let wc2 = self.control_weight * self.control_weight;
                data.cost += 0.5 * wc2 * u.norm_squared();
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
        let ws2 = self.state_weight * self.state_weight;
        data.lx = x * ws2;
        data.lxx = DMatrix::identity(3, 3) * ws2;
        data.lxu = DMatrix::zeros(3, 2);

        match u {
            Some(u) => {
                let (s, c) = x[2].sin_cos();
                let dt = self.dt;
                data.fx = DMatrix::from_row_slice(
                    3,
                    3,
                    &[1.0, 0.0, -s * u[0] * dt, 0.0, 1.0, c * u[0] * dt, 0.0, 0.0, 1.0],
                );
                data.fu = DMatrix::from_row_slice(3, 2, &[c * dt, 0.0, s * dt, 0.0, 0.0, dt]);

                let wc2 = self.control_weight * self.control_weight;
                data.lu = u * wc2;
                data.luu = DMatrix::identity(2, 2) * wc2;
            }
            None => {
                data.fx = DMatrix::identity(3, 3);
                data.fu = DMatrix::zeros(3, 2);
                data.lu = DVector::zeros(2);
                data.luu = DMatrix::zeros(2, 2);
            }
        }
        Ok(())
    }
}
