//! Finite-difference action model.
//!
//! [`ActionModelNumDiff`] wraps another action model and replaces its derivatives with
//! finite-difference approximations computed from `calc` alone. It serves two purposes:
//! checking hand-written `calc_diff` implementations, and solving problems whose models
//! only provide `calc`.
//!
//! Perturbations are applied in the tangent space of the state manifold:
//!
//! ```text
//! Fx[:, i] ≈ (f(x ⊕ h·eᵢ, u) ⊖ f(x, u)) / h
//! Lx[i]    ≈ (l(x ⊕ h·eᵢ, u) − l(x, u)) / h
//! ```
//!
//! with `h = √ε`. The cost Hessian uses second differences over the stacked
//! perturbation `z = [δx; δu]` with the larger step `h₂ = ε^¼`:
//!
//! ```text
//! H[i, j] ≈ (l(z + h₂eᵢ + h₂eⱼ) − l(z + h₂eᵢ) − l(z + h₂eⱼ) + l(z)) / h₂²
//! ```

use crate::core::action::{ActionData, ActionModel, check_arguments};
use crate::core::{CoreError, CoreResult};
use crate::manifold::StateManifold;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Action model whose derivatives are obtained by finite differences.
pub struct ActionModelNumDiff {
    model: Arc<dyn ActionModel>,
    disturbance: f64,
}

impl ActionModelNumDiff {
    /// Wrap `model` with the default disturbance `√ε`.
    pub fn new(model: Arc<dyn ActionModel>) -> Self {
        ActionModelNumDiff {
            model,
            disturbance: f64::EPSILON.sqrt(),
        }
    }

    /// Override the first-order disturbance.
    ///
    /// # Errors
    /// `InvalidInput` if the disturbance is not strictly positive and finite.
    pub fn with_disturbance(mut self, disturbance: f64) -> CoreResult<Self> {
        if !(disturbance.is_finite() && disturbance > 0.0) {
            return Err(CoreError::InvalidInput(format!(
                "finite-difference disturbance must be positive, got {disturbance}"
            )));
        }
        self.disturbance = disturbance;
        Ok(self)
    }

    pub fn model(&self) -> &Arc<dyn ActionModel> {
        &self.model
    }

    pub fn disturbance(&self) -> f64 {
        self.disturbance
    }

    /// Accuracy to expect when comparing against analytical derivatives.
    pub fn tolerance(&self) -> f64 {
        self.disturbance.cbrt()
    }

    /// Cost at `x ⊕ z[..ndx]` and `u + z[ndx..]`.
    fn perturbed_cost(
        &self,
        scratch: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
        z: &DVector<f64>,
    ) -> CoreResult<f64> {
        let state = self.model.state();
        let ndx = state.ndx();
        let xp = state.integrate(x, &z.rows(0, ndx).into_owned());
        match u {
            Some(u) => {
                let up = u + z.rows(ndx, u.len());
                self.model.calc(scratch, &xp, Some(&up))?;
            }
            None => self.model.calc(scratch, &xp, None)?,
        }
        Ok(scratch.cost)
    }
}

impl ActionModel for ActionModelNumDiff {
    fn state(&self) -> &Arc<dyn StateManifold> {
        self.model.state()
    }

    fn nu(&self) -> usize {
        self.model.nu()
    }

    fn name(&self) -> &str {
        "ActionModelNumDiff"
    }

    fn calc(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        self.model.calc(data, x, u)
    }

    /// Finite-difference derivatives around `(x, u)`.
    ///
    /// Perturbed evaluations go through a scratch data allocated on each call, so
    /// this wrapper does not keep the allocation-free iteration of analytic models.
    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        check_arguments(self, x, u)?;
        let state = self.model.state();
        let ndx = state.ndx();
        let nu = if u.is_some() { self.nu() } else { 0 };
        let h = self.disturbance;

        let mut scratch = self.model.create_data();
        self.model.calc(&mut scratch, x, u)?;
        let xnext0 = scratch.xnext.clone();
        let cost0 = scratch.cost;

        let mut fx = DMatrix::zeros(ndx, ndx);
        let mut lx = DVector::zeros(ndx);
        for i in 0..ndx {
            let mut dx = DVector::zeros(ndx);
            dx[i] = h;
            let xp = state.integrate(x, &dx);
            self.model.calc(&mut scratch, &xp, u)?;
            fx.set_column(i, &(state.diff(&xnext0, &scratch.xnext) / h));
            lx[i] = (scratch.cost - cost0) / h;
        }

        let mut fu = DMatrix::zeros(ndx, self.nu());
        let mut lu = DVector::zeros(self.nu());
        if let Some(u) = u {
            for j in 0..nu {
                let mut up = u.clone();
                up[j] += h;
                self.model.calc(&mut scratch, x, Some(&up))?;
                fu.set_column(j, &(state.diff(&xnext0, &scratch.xnext) / h));
                lu[j] = (scratch.cost - cost0) / h;
            }
        }

        // Second differences over z = [δx; δu]
        let n = ndx + nu;
        let h2 = f64::EPSILON.powf(0.25);
        let mut single = DVector::zeros(n);
        for i in 0..n {
            let mut z = DVector::zeros(n);
            z[i] = h2;
            single[i] = self.perturbed_cost(&mut scratch, x, u, &z)?;
        }
        let mut hessian = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let mut z = DVector::zeros(n);
                z[i] += h2;
                z[j] += h2;
                let both = self.perturbed_cost(&mut scratch, x, u, &z)?;
                let value = (both - single[i] - single[j] + cost0) / (h2 * h2);
                hessian[(i, j)] = value;
                hessian[(j, i)] = value;
            }
        }

        data.fx = fx;
        data.fu = fu;
        data.lx = lx;
        data.lu = lu;
        data.lxx = hessian.view((0, 0), (ndx, ndx)).into_owned();
        data.lxu = DMatrix::zeros(ndx, self.nu());
        data.luu = DMatrix::zeros(self.nu(), self.nu());
        if nu > 0 {
            data.lxu = hessian.view((0, ndx), (ndx, nu)).into_owned();
            data.luu = hessian.view((ndx, ndx), (nu, nu)).into_owned();
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
        self.model.quasi_static(data, x, max_iter, tol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionModelLqr, ActionModelUnicycle};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_numdiff_delegates_calc() -> TestResult {
        let inner = Arc::new(ActionModelUnicycle::new());
        let numdiff = ActionModelNumDiff::new(inner.clone());
        assert_eq!(numdiff.nu(), 2);
        assert_eq!(numdiff.state().nx(), 3);

        let x = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let u = DVector::from_vec(vec![1.0, 0.0]);
        let mut a = inner.create_data();
        let mut b = numdiff.create_data();
        inner.calc(&mut a, &x, Some(&u))?;
        numdiff.calc(&mut b, &x, Some(&u))?;
        assert_eq!(a.xnext, b.xnext);
        assert_eq!(a.cost, b.cost);
        Ok(())
    }

    #[test]
    fn test_numdiff_terminal_hessian() -> TestResult {
        let lxx = DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 1.0, 2.0]);
        let terminal = ActionModelLqr::terminal(lxx.clone())?;
        let numdiff = ActionModelNumDiff::new(Arc::new(terminal));

        let x = DVector::from_vec(vec![0.5, -1.5]);
        let mut data = numdiff.create_data();
        numdiff.calc(&mut data, &x, None)?;
        numdiff.calc_diff(&mut data, &x, None)?;

        assert!((&data.lxx - &lxx).amax() < numdiff.tolerance());
        assert!((&data.lx - &lxx * &x).amax() < numdiff.tolerance());
        assert!((&data.fx - DMatrix::<f64>::identity(2, 2)).amax() < numdiff.tolerance());
        assert_eq!(data.lu.len(), 0);
        Ok(())
    }

    #[test]
    fn test_numdiff_rejects_bad_disturbance() {
        let numdiff = ActionModelNumDiff::new(Arc::new(ActionModelUnicycle::new()));
        assert!(numdiff.with_disturbance(0.0).is_err());
    }

    #[test]
    fn test_numdiff_tolerance_scales_with_disturbance() -> TestResult {
        let numdiff =
            ActionModelNumDiff::new(Arc::new(ActionModelUnicycle::new())).with_disturbance(1e-6)?;
        assert!((numdiff.tolerance() - 1e-2).abs() < 1e-12);
        Ok(())
    }
}
