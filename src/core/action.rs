//! Action models: one discrete stage of an optimal control problem.
//!
//! An action model maps a state `x` and a control `u` to the next state
//! `xnext = f(x, u)` and a stage cost `l(x, u)`. The terminal stage has no
//! control; it is evaluated with `u = None`, which by convention leaves the
//! state unchanged and charges the terminal cost only.
//!
//! Results are written into an [`ActionData`] owned by the caller. The solver
//! keeps one data per stage and reuses it across iterations.
//!
//! Derivatives are expressed in tangent coordinates of the state manifold:
//! `fx` is `ndx × ndx`, `fu` is `ndx × nu`, and cost gradients and Hessians are
//! taken with respect to the same tangent perturbations.

use crate::core::{CoreError, CoreResult};
use crate::manifold::StateManifold;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Scratch and result storage for one action model evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionData {
    /// Stage cost written by `calc`
    pub cost: f64,
    /// Next state written by `calc`
    pub xnext: DVector<f64>,
    /// Dynamics Jacobian with respect to the state
    pub fx: DMatrix<f64>,
    /// Dynamics Jacobian with respect to the control
    pub fu: DMatrix<f64>,
    /// Cost gradient with respect to the state
    pub lx: DVector<f64>,
    /// Cost gradient with respect to the control
    pub lu: DVector<f64>,
    /// Cost Hessian with respect to the state
    pub lxx: DMatrix<f64>,
    /// Cost Hessian with respect to the control
    pub luu: DMatrix<f64>,
    /// Mixed cost Hessian
    pub lxu: DMatrix<f64>,
}

impl ActionData {
    /// Zero-initialized data for a model with the given dimensions.
    pub fn new(nx: usize, ndx: usize, nu: usize) -> Self {
        ActionData {
            cost: 0.0,
            xnext: DVector::zeros(nx),
            fx: DMatrix::zeros(ndx, ndx),
            fu: DMatrix::zeros(ndx, nu),
            lx: DVector::zeros(ndx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(ndx, ndx),
            luu: DMatrix::zeros(nu, nu),
            lxu: DMatrix::zeros(ndx, nu),
        }
    }

    /// True when the values written by `calc` are finite.
    pub fn is_calc_finite(&self) -> bool {
        self.cost.is_finite() && self.xnext.iter().all(|v| v.is_finite())
    }

    /// True when every field is finite.
    pub fn is_finite(&self) -> bool {
        self.is_calc_finite()
            && self.fx.iter().all(|v| v.is_finite())
            && self.fu.iter().all(|v| v.is_finite())
            && self.lx.iter().all(|v| v.is_finite())
            && self.lu.iter().all(|v| v.is_finite())
            && self.lxx.iter().all(|v| v.is_finite())
            && self.luu.iter().all(|v| v.is_finite())
            && self.lxu.iter().all(|v| v.is_finite())
    }
}

/// One stage of a discrete-time optimal control problem.
///
/// `calc` fills `cost` and `xnext`; `calc_diff` fills the derivative fields and
/// may assume `calc` was just called with the same arguments. Passing `None` as
/// the control evaluates the model as a terminal stage.
pub trait ActionModel: Send + Sync {
    /// State space shared with the neighbouring stages.
    fn state(&self) -> &Arc<dyn StateManifold>;

    /// Control dimension.
    fn nu(&self) -> usize;

    /// Short human-readable name used in log messages.
    fn name(&self) -> &str {
        "ActionModel"
    }

    /// Allocate a data matching this model's dimensions.
    fn create_data(&self) -> ActionData {
        let state = self.state();
        ActionData::new(state.nx(), state.ndx(), self.nu())
    }

    /// Evaluate next state and cost.
    fn calc(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()>;

    /// Evaluate dynamics and cost derivatives.
    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()>;

    /// Control that keeps `x` stationary, i.e. `f(x, u) = x`.
    ///
    /// Models opt in by overriding this, usually with [`quasi_static_newton`].
    fn quasi_static(
        &self,
        _data: &mut ActionData,
        _x: &DVector<f64>,
        _max_iter: usize,
        _tol: f64,
    ) -> CoreResult<DVector<f64>> {
        Err(CoreError::UnsupportedOperation(format!(
            "{} does not provide a quasi-static control",
            self.name()
        )))
    }
}

/// Validate the state and control passed to a model evaluation.
pub fn check_arguments<M: ActionModel + ?Sized>(
    model: &M,
    x: &DVector<f64>,
    u: Option<&DVector<f64>>,
) -> CoreResult<()> {
    let nx = model.state().nx();
    if x.len() != nx {
        return Err(CoreError::DimensionMismatch(format!(
            "{}: state has {} entries, expected {}",
            model.name(),
            x.len(),
            nx
        )));
    }
    if let Some(u) = u
        && u.len() != model.nu()
    {
        return Err(CoreError::DimensionMismatch(format!(
            "{}: control has {} entries, expected {}",
            model.name(),
            u.len(),
            model.nu()
        )));
    }
    Ok(())
}

/// Newton iteration on the controls for `f(x, u) ⊖ x = 0`.
///
/// Each step solves the linearized stationarity condition with the
/// pseudo-inverse of `fu`, which gives the least-squares control when the model
/// is under-actuated. Stops once the control update norm drops below `tol`.
/// A model without controls gets the empty control right away.
pub fn quasi_static_newton<M: ActionModel + ?Sized>(
    model: &M,
    data: &mut ActionData,
    x: &DVector<f64>,
    max_iter: usize,
    tol: f64,
) -> CoreResult<DVector<f64>> {
    check_arguments(model, x, None)?;
    if model.nu() == 0 {
        return Ok(DVector::zeros(0));
    }
    let state = model.state();
    let mut u = DVector::zeros(model.nu());

    for _ in 0..max_iter {
        model.calc(data, x, Some(&u))?;
        model.calc_diff(data, x, Some(&u))?;

        let drift = state.diff(x, &data.xnext);
        let fu_pinv = data.fu.clone().pseudo_inverse(1e-12).map_err(|e| {
            CoreError::InvalidNumericValue(format!(
                "{}: pseudo-inverse of fu failed",
                model.name()
            ))
            .log_with_source(e)
        })?;
        let du = -(fu_pinv * drift);
        u += &du;

        if !u.iter().all(|v| v.is_finite()) {
            return Err(CoreError::InvalidNumericValue(format!(
                "{}: quasi-static control diverged",
                model.name()
            )));
        }
        if du.norm() <= tol {
            return Ok(u);
        }
    }

    Err(CoreError::ConvergenceFailure(format!(
        "{}: quasi-static control did not converge in {} iterations",
        model.name(),
        max_iter
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::StateVector;

    /// x' = x + B u with a quadratic cost, enough to drive the helpers.
    struct Integrator {
        state: Arc<dyn StateManifold>,
        b: DMatrix<f64>,
    }

    impl Integrator {
        fn new(b: DMatrix<f64>) -> Self {
            Integrator {
                state: Arc::new(StateVector::new(b.nrows())),
                b,
            }
        }
    }

    impl ActionModel for Integrator {
        fn state(&self) -> &Arc<dyn StateManifold> {
            &self.state
        }

        fn nu(&self) -> usize {
            self.b.ncols()
        }

        fn calc(
            &self,
            data: &mut ActionData,
            x: &DVector<f64>,
            u: Option<&DVector<f64>>,
        ) -> CoreResult<()> {
            check_arguments(self, x, u)?;
            data.xnext = match u {
                Some(u) => x + &self.b * u + DVector::repeat(x.len(), 0.5),
                None => x.clone(),
            };
            data.cost = 0.5 * x.norm_squared();
            Ok(())
        }

        fn calc_diff(
            &self,
            data: &mut ActionData,
            x: &DVector<f64>,
            _u: Option<&DVector<f64>>,
        ) -> CoreResult<()> {
            data.fx = DMatrix::identity(x.len(), x.len());
            data.fu = self.b.clone();
            data.lx = x.clone();
            data.lxx = DMatrix::identity(x.len(), x.len());
            Ok(())
        }
    }

    #[test]
    fn test_create_data_dimensions() {
        let model = Integrator::new(DMatrix::identity(3, 2));
        let data = model.create_data();
        assert_eq!(data.xnext.len(), 3);
        assert_eq!(data.fu.shape(), (3, 2));
        assert_eq!(data.lxu.shape(), (3, 2));
        assert_eq!(data.luu.shape(), (2, 2));
        assert!(data.is_finite());
    }

    #[test]
    fn test_check_arguments_rejects_bad_control() {
        let model = Integrator::new(DMatrix::identity(2, 2));
        let x = DVector::zeros(2);
        let u = DVector::zeros(3);
        let result = check_arguments(&model, &x, Some(&u));
        assert!(matches!(result, Err(CoreError::DimensionMismatch(_))));
        assert!(check_arguments(&model, &x, None).is_ok());
    }

    #[test]
    fn test_default_quasi_static_is_unsupported() {
        let model = Integrator::new(DMatrix::identity(2, 2));
        let mut data = model.create_data();
        let result = model.quasi_static(&mut data, &DVector::zeros(2), 10, 1e-9);
        assert!(matches!(result, Err(CoreError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_quasi_static_newton_fully_actuated() -> Result<(), Box<dyn std::error::Error>> {
        let b = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 1.0, 1.0]);
        let model = Integrator::new(b);
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![0.3, -0.7]);

        let u = quasi_static_newton(&model, &mut data, &x, 10, 1e-9)?;
        model.calc(&mut data, &x, Some(&u))?;
        assert!((&data.xnext - &x).norm() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_quasi_static_newton_zero_iterations_fails() {
        let model = Integrator::new(DMatrix::identity(2, 2));
        let mut data = model.create_data();
        let result = quasi_static_newton(&model, &mut data, &DVector::zeros(2), 0, 1e-9);
        assert!(matches!(result, Err(CoreError::ConvergenceFailure(_))));
    }

    #[test]
    fn test_data_finiteness_checks() {
        let mut data = ActionData::new(2, 2, 1);
        assert!(data.is_calc_finite());
        data.luu[(0, 0)] = f64::INFINITY;
        assert!(data.is_calc_finite());
        assert!(!data.is_finite());
        data.cost = f64::NAN;
        assert!(!data.is_calc_finite());
    }
}
