//! Linear-quadratic action model.

use crate::core::action::{ActionData, ActionModel, check_arguments, quasi_static_newton};
use crate::core::{CoreError, CoreResult};
use crate::manifold::{StateManifold, StateVector};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use std::sync::Arc;

/// Linear dynamics with a quadratic cost.
///
/// # Mathematical Formulation
///
/// ```text
/// x' = Fx·x + Fu·u + f0
/// l(x, u) = ½ xᵀ Lxx x + ½ uᵀ Luu u + xᵀ Lxu u + lxᵀ x + luᵀ u
/// ```
///
/// As a terminal stage the cost reduces to `½ xᵀ Lxx x + lxᵀ x` and `x' = x`.
///
/// # Example
///
/// ```
/// use apex_ddp::models::ActionModelLqr;
/// use apex_ddp::core::action::ActionModel;
/// use nalgebra::{DMatrix, DVector};
/// # fn example() -> apex_ddp::core::CoreResult<()> {
///
/// let model = ActionModelLqr::new(
///     DMatrix::identity(2, 2),
///     DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
///     DMatrix::identity(2, 2),
///     DMatrix::identity(1, 1),
/// )?;
/// let mut data = model.create_data();
/// model.calc(&mut data, &DVector::from_vec(vec![1.0, 0.0]), Some(&DVector::zeros(1)))?;
/// assert_eq!(data.cost, 0.5);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ActionModelLqr {
    state: Arc<dyn StateManifold>,
    nu: usize,
    fx: DMatrix<f64>,
    fu: DMatrix<f64>,
    f0: DVector<f64>,
    lxx: DMatrix<f64>,
    luu: DMatrix<f64>,
    lxu: DMatrix<f64>,
    lx: DVector<f64>,
    lu: DVector<f64>,
}

fn check_shape(name: &str, matrix: &DMatrix<f64>, rows: usize, cols: usize) -> CoreResult<()> {
    if matrix.shape() != (rows, cols) {
        return Err(CoreError::DimensionMismatch(format!(
            "{} is {}x{}, expected {}x{}",
            name,
            matrix.nrows(),
            matrix.ncols(),
            rows,
            cols
        )));
    }
    Ok(())
}

impl ActionModelLqr {
    /// Create a drift-free model without linear or cross cost terms.
    ///
    /// # Errors
    /// `DimensionMismatch` unless `fx` and `lxx` are `nx×nx`, `fu` is `nx×nu` and
    /// `luu` is `nu×nu`.
    pub fn new(
        fx: DMatrix<f64>,
        fu: DMatrix<f64>,
        lxx: DMatrix<f64>,
        luu: DMatrix<f64>,
    ) -> CoreResult<Self> {
        let nx = fx.nrows();
        let nu = fu.ncols();
        check_shape("Fx", &fx, nx, nx)?;
        check_shape("Fu", &fu, nx, nu)?;
        check_shape("Lxx", &lxx, nx, nx)?;
        check_shape("Luu", &luu, nu, nu)?;

        Ok(ActionModelLqr {
            state: Arc::new(StateVector::new(nx)),
            nu,
            fx,
            fu,
            f0: DVector::zeros(nx),
            lxx,
            luu,
            lxu: DMatrix::zeros(nx, nu),
            lx: DVector::zeros(nx),
            lu: DVector::zeros(nu),
        })
    }

    /// Control-free model charging `½ xᵀ Lxx x`, meant for the terminal stage.
    pub fn terminal(lxx: DMatrix<f64>) -> CoreResult<Self> {
        let nx = lxx.nrows();
        Self::new(
            DMatrix::identity(nx, nx),
            DMatrix::zeros(nx, 0),
            lxx,
            DMatrix::zeros(0, 0),
        )
    }

    /// Random well-conditioned instance with positive-definite cost Hessians.
    pub fn random(nx: usize, nu: usize, drift_free: bool) -> Self {
        let mut rng = rand::rng();
        let mut sample = |rows: usize, cols: usize| {
            DMatrix::from_fn(rows, cols, |_, _| rng.random_range(-1.0..1.0))
        };

        let fx = DMatrix::identity(nx, nx) + sample(nx, nx) * 0.1;
        let fu = sample(nx, nu);
        let mx = sample(nx, nx);
        let lxx = &mx * mx.transpose() / nx.max(1) as f64 + DMatrix::identity(nx, nx);
        let mu = sample(nu, nu);
        let luu = &mu * mu.transpose() / nu.max(1) as f64 + DMatrix::identity(nu, nu);
        let lx = sample(nx, 1).column(0).into_owned();
        let lu = sample(nu, 1).column(0).into_owned();
        let f0 = if drift_free {
            DVector::zeros(nx)
        } else {
            sample(nx, 1).column(0).into_owned()
        };

        ActionModelLqr {
            state: Arc::new(StateVector::new(nx)),
            nu,
            fx,
            fu,
            f0,
            lxx,
            luu,
            lxu: DMatrix::zeros(nx, nu),
            lx,
            lu,
        }
    }

    /// Set the constant drift `f0`.
    pub fn with_drift(mut self, f0: DVector<f64>) -> CoreResult<Self> {
        if f0.len() != self.fx.nrows() {
            return Err(CoreError::DimensionMismatch(format!(
                "drift has {} entries, expected {}",
                f0.len(),
                self.fx.nrows()
            )));
        }
        self.f0 = f0;
        Ok(self)
    }

    /// Set the state/control cross weight `Lxu`.
    pub fn with_cross_weight(mut self, lxu: DMatrix<f64>) -> CoreResult<Self> {
        check_shape("Lxu", &lxu, self.fx.nrows(), self.nu)?;
        self.lxu = lxu;
        Ok(self)
    }

    /// Set the linear cost terms `lx` and `lu`.
    pub fn with_linear_cost(mut self, lx: DVector<f64>, lu: DVector<f64>) -> CoreResult<Self> {
        if lx.len() != self.fx.nrows() || lu.len() != self.nu {
            return Err(CoreError::DimensionMismatch(format!(
                "linear cost terms have sizes ({}, {}), expected ({}, {})",
                lx.len(),
                lu.len(),
                self.fx.nrows(),
                self.nu
            )));
        }
        self.lx = lx;
        self.lu = lu;
        Ok(self)
    }

    pub fn fx(&self) -> &DMatrix<f64> {
        &self.fx
    }

    pub fn fu(&self) -> &DMatrix<f64> {
        &self.fu
    }

    pub fn f0(&self) -> &DVector<f64> {
        &self.f0
    }

    pub fn lxx(&self) -> &DMatrix<f64> {
        &self.lxx
    }

    pub fn luu(&self) -> &DMatrix<f64> {
        &self.luu
    }

    pub fn lxu(&self) -> &DMatrix<f64> {
        &self.lxu
    }

    pub fn lx(&self) -> &DVector<f64> {
        &self.lx
    }

    pub fn lu(&self) -> &DVector<f64> {
        &self.lu
    }
}

impl ActionModel for ActionModelLqr {
    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.nu
    }

    fn name(&self) -> &str {
        "ActionModelLqr"
    }

    fn calc(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        check_arguments(self, x, u)?;
        let state_cost = 0.5 * x.dot(&(&self.lxx * x)) + self.lx.dot(x);
        match u {
            Some(u) => {
                data.xnext = &self.fx * x + &self.fu * u + &self.f0;
                data.cost = state_cost
                    + 0.5 * u.dot(&(&self.luu * u))
                    + x.dot(&(&self.lxu * u))
                    + self.lu.dot(u);
            }
            None => {
                data.xnext.clone_from(x);
                data.cost = state_cost;
            }
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
        data.lxx.clone_from(&self.lxx);
        match u {
            Some(u) => {
                data.fx.clone_from(&self.fx);
                data.fu.clone_from(&self.fu);
                data.lx = &self.lxx * x + &self.lxu * u + &self.lx;
                data.lu = &self.luu * u + self.lxu.transpose() * x + &self.lu;
                data.luu.clone_from(&self.luu);
                data.lxu.clone_from(&self.lxu);
            }
            None => {
                let nx = x.len();
                data.fx = DMatrix::identity(nx, nx);
                data.fu = DMatrix::zeros(nx, self.nu);
                data.lx = &self.lxx * x + &self.lx;
                data.lu = DVector::zeros(self.nu);
                data.luu = DMatrix::zeros(self.nu, self.nu);
                data.lxu = DMatrix::zeros(nx, self.nu);
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
