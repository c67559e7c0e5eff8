//! Shooting problem: an initial state plus one action model per stage.
//!
//! The problem owns one [`ActionData`] per stage, allocated once at construction and
//! overwritten by every evaluation. Stage evaluations are independent, so with the
//! `parallel` feature enabled `calc` and `calc_diff` fan out one rayon task per
//! running stage. Totals are always summed sequentially in stage order, which makes
//! parallel and sequential evaluation produce identical numbers.
//!
//! # Example
//!
//! ```
//! use apex_ddp::core::problem::ShootingProblem;
//! use apex_ddp::core::action::ActionModel;
//! use apex_ddp::models::ActionModelUnicycle;
//! use nalgebra::DVector;
//! use std::sync::Arc;
//! # use apex_ddp::error::ApexDdpResult;
//! # fn example() -> ApexDdpResult<()> {
//!
//! let model: Arc<dyn ActionModel> = Arc::new(ActionModelUnicycle::new());
//! let x0 = DVector::from_vec(vec![-1.0, -1.0, 1.0]);
//! let mut problem = ShootingProblem::new(x0, vec![model.clone(); 20], model)?;
//!
//! let us = vec![DVector::zeros(2); problem.horizon()];
//! let xs = problem.rollout(&us)?;
//! let cost = problem.calc(&xs, &us)?;
//! assert!(cost > 0.0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;

use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::warn;

use crate::core::action::{ActionData, ActionModel, check_arguments};
use crate::core::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Evaluation {
    Calc,
    CalcDiff,
}

impl Evaluation {
    fn apply(
        self,
        model: &dyn ActionModel,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        match self {
            Evaluation::Calc => model.calc(data, x, u),
            Evaluation::CalcDiff => model.calc_diff(data, x, u),
        }
    }
}

/// Discrete-time optimal control problem over a fixed horizon.
pub struct ShootingProblem {
    /// Initial state, never modified by the solver
    x0: DVector<f64>,

    /// Models of stages `0..N`
    running_models: Vec<Arc<dyn ActionModel>>,

    /// Model of the final stage, evaluated without a control
    terminal_model: Arc<dyn ActionModel>,

    /// One data per running stage, indexed like `running_models`
    running_datas: Vec<ActionData>,

    terminal_data: ActionData,

    /// Evaluate running stages on the rayon pool (needs the `parallel` feature)
    parallel: bool,
}

impl ShootingProblem {
    /// Create a problem and allocate its stage data.
    ///
    /// # Errors
    /// `DimensionMismatch` if `x0` does not fit the first stage, or if two consecutive
    /// stages disagree on the state dimensions.
    pub fn new(
        x0: DVector<f64>,
        running_models: Vec<Arc<dyn ActionModel>>,
        terminal_model: Arc<dyn ActionModel>,
    ) -> CoreResult<Self> {
        let stages: Vec<&Arc<dyn ActionModel>> = running_models
            .iter()
            .chain(std::iter::once(&terminal_model))
            .collect();

        for (t, pair) in stages.windows(2).enumerate() {
            let (current, next) = (pair[0].state(), pair[1].state());
            if current.nx() != next.nx() || current.ndx() != next.ndx() {
                return Err(CoreError::DimensionMismatch(format!(
                    "stage {} has state (nx {}, ndx {}) but stage {} has (nx {}, ndx {})",
                    t,
                    current.nx(),
                    current.ndx(),
                    t + 1,
                    next.nx(),
                    next.ndx()
                )));
            }
        }

        let first = stages[0];
        if x0.len() != first.state().nx() {
            return Err(CoreError::DimensionMismatch(format!(
                "initial state has {} entries, first stage expects {}",
                x0.len(),
                first.state().nx()
            )));
        }

        let running_datas = running_models.iter().map(|m| m.create_data()).collect();
        let terminal_data = terminal_model.create_data();

        Ok(ShootingProblem {
            x0,
            running_models,
            terminal_model,
            running_datas,
            terminal_data,
            parallel: cfg!(feature = "parallel"),
        })
    }

    /// Enable or disable parallel stage evaluation.
    ///
    /// Without the `parallel` feature this flag has no effect.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Number of running stages N.
    pub fn horizon(&self) -> usize {
        self.running_models.len()
    }

    pub fn x0(&self) -> &DVector<f64> {
        &self.x0
    }

    /// Replace the initial state, e.g. when shifting a receding horizon.
    pub fn set_x0(&mut self, x0: DVector<f64>) -> CoreResult<()> {
        let nx = self.stage_model(0).state().nx();
        if x0.len() != nx {
            return Err(CoreError::DimensionMismatch(format!(
                "initial state has {} entries, first stage expects {}",
                x0.len(),
                nx
            )));
        }
        self.x0 = x0;
        Ok(())
    }

    pub fn running_models(&self) -> &[Arc<dyn ActionModel>] {
        &self.running_models
    }

    pub fn terminal_model(&self) -> &Arc<dyn ActionModel> {
        &self.terminal_model
    }

    pub fn running_datas(&self) -> &[ActionData] {
        &self.running_datas
    }

    pub fn terminal_data(&self) -> &ActionData {
        &self.terminal_data
    }

    /// Model of stage `t`, where `t == N` is the terminal stage.
    fn stage_model(&self, t: usize) -> &Arc<dyn ActionModel> {
        self.running_models.get(t).unwrap_or(&self.terminal_model)
    }

    /// Check trajectory lengths and every state/control dimension.
    pub fn check_trajectory(&self, xs: &[DVector<f64>], us: &[DVector<f64>]) -> CoreResult<()> {
        let horizon = self.horizon();
        if xs.len() != horizon + 1 {
            return Err(CoreError::DimensionMismatch(format!(
                "expected {} states, got {}",
                horizon + 1,
                xs.len()
            )));
        }
        self.check_controls(us)?;
        for (t, x) in xs.iter().enumerate() {
            let nx = self.stage_model(t).state().nx();
            if x.len() != nx {
                return Err(CoreError::DimensionMismatch(format!(
                    "stage {}: state has {} entries, expected {}",
                    t,
                    x.len(),
                    nx
                )));
            }
        }
        Ok(())
    }

    fn check_controls(&self, us: &[DVector<f64>]) -> CoreResult<()> {
        if us.len() != self.horizon() {
            return Err(CoreError::DimensionMismatch(format!(
                "expected {} controls, got {}",
                self.horizon(),
                us.len()
            )));
        }
        for (t, (u, model)) in us.iter().zip(&self.running_models).enumerate() {
            if u.len() != model.nu() {
                return Err(CoreError::DimensionMismatch(format!(
                    "stage {}: control has {} entries, expected {}",
                    t,
                    u.len(),
                    model.nu()
                )));
            }
        }
        Ok(())
    }

    /// Evaluate every stage's next state and cost. Returns the total cost.
    pub fn calc(&mut self, xs: &[DVector<f64>], us: &[DVector<f64>]) -> CoreResult<f64> {
        self.check_trajectory(xs, us)?;
        self.evaluate(xs, us, Evaluation::Calc)
    }

    /// Evaluate every stage's derivatives. Returns the total cost.
    ///
    /// Must follow a `calc` with the same trajectory; the returned cost is the one
    /// that `calc` left in the stage data.
    pub fn calc_diff(&mut self, xs: &[DVector<f64>], us: &[DVector<f64>]) -> CoreResult<f64> {
        self.check_trajectory(xs, us)?;
        self.evaluate(xs, us, Evaluation::CalcDiff)
    }

    fn evaluate(
        &mut self,
        xs: &[DVector<f64>],
        us: &[DVector<f64>],
        evaluation: Evaluation,
    ) -> CoreResult<f64> {
        let horizon = self.horizon();

        #[cfg(feature = "parallel")]
        let result: CoreResult<()> = if self.parallel {
            self.running_models
                .par_iter()
                .zip(self.running_datas.par_iter_mut())
                .zip(xs[..horizon].par_iter().zip(us.par_iter()))
                .try_for_each(|((model, data), (x, u))| {
                    evaluation.apply(model.as_ref(), data, x, Some(u))
                })
        } else {
            self.evaluate_sequential(xs, us, evaluation)
        };

        #[cfg(not(feature = "parallel"))]
        let result: CoreResult<()> = self.evaluate_sequential(xs, us, evaluation);

        result?;

        evaluation.apply(
            self.terminal_model.as_ref(),
            &mut self.terminal_data,
            &xs[horizon],
            None,
        )?;

        Ok(self.total_cost())
    }

    fn evaluate_sequential(
        &mut self,
        xs: &[DVector<f64>],
        us: &[DVector<f64>],
        evaluation: Evaluation,
    ) -> CoreResult<()> {
        self.running_models
            .iter()
            .zip(self.running_datas.iter_mut())
            .zip(xs.iter().zip(us.iter()))
            .try_for_each(|((model, data), (x, u))| {
                evaluation.apply(model.as_ref(), data, x, Some(u))
            })
    }

    /// Sum of the costs currently stored in the stage data, in stage order.
    pub fn total_cost(&self) -> f64 {
        self.running_datas.iter().map(|d| d.cost).sum::<f64>() + self.terminal_data.cost
    }

    /// Evaluate a single running stage.
    pub fn calc_stage(
        &mut self,
        t: usize,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> CoreResult<&ActionData> {
        let model = self.running_models.get(t).ok_or_else(|| {
            CoreError::InvalidInput(format!("stage {} is outside horizon {}", t, self.horizon()))
        })?;
        check_arguments(model.as_ref(), x, Some(u))?;
        let data = &mut self.running_datas[t];
        model.calc(data, x, Some(u))?;
        Ok(data)
    }

    /// Evaluate the terminal stage.
    pub fn calc_terminal(&mut self, x: &DVector<f64>) -> CoreResult<&ActionData> {
        check_arguments(self.terminal_model.as_ref(), x, None)?;
        self.terminal_model
            .calc(&mut self.terminal_data, x, None)?;
        Ok(&self.terminal_data)
    }

    /// Simulate the dynamics from `x0` under the given controls.
    ///
    /// The returned states are dynamically feasible by construction. The stage data
    /// holds the evaluation of the rollout afterwards, terminal stage included.
    pub fn rollout(&mut self, us: &[DVector<f64>]) -> CoreResult<Vec<DVector<f64>>> {
        self.check_controls(us)?;
        let mut xs = Vec::with_capacity(us.len() + 1);
        xs.push(self.x0.clone());
        for (t, u) in us.iter().enumerate() {
            let xnext = self.calc_stage(t, &xs[t], u)?.xnext.clone();
            xs.push(xnext);
        }
        if let Some(x_final) = xs.last() {
            self.terminal_model
                .calc(&mut self.terminal_data, x_final, None)?;
        }
        Ok(xs)
    }

    /// Gaps between the stored stage predictions and the trajectory states.
    ///
    /// `fs[0] = x0 ⊖ xs[0]` and `fs[t + 1] = f(xs[t], us[t]) ⊖ xs[t + 1]`, taken from
    /// the `xnext` left by the last `calc` at `xs`.
    pub fn feasibility_gaps(&self, xs: &[DVector<f64>]) -> CoreResult<Vec<DVector<f64>>> {
        if xs.len() != self.horizon() + 1 {
            return Err(CoreError::DimensionMismatch(format!(
                "expected {} states, got {}",
                self.horizon() + 1,
                xs.len()
            )));
        }
        let mut gaps = Vec::with_capacity(xs.len());
        gaps.push(self.stage_model(0).state().diff(&xs[0], &self.x0));
        for (t, (model, data)) in self
            .running_models
            .iter()
            .zip(&self.running_datas)
            .enumerate()
        {
            gaps.push(model.state().diff(&xs[t + 1], &data.xnext));
        }
        Ok(gaps)
    }

    /// Control keeping stage `t` stationary at `x`.
    ///
    /// # Errors
    /// `UnsupportedOperation` if the model does not provide one, `ConvergenceFailure`
    /// if its root find runs out of iterations. Neither is fatal to a solve.
    pub fn quasi_static(
        &mut self,
        t: usize,
        x: &DVector<f64>,
        max_iter: usize,
        tol: f64,
    ) -> CoreResult<DVector<f64>> {
        let model = self.running_models.get(t).ok_or_else(|| {
            CoreError::InvalidInput(format!("stage {} is outside horizon {}", t, self.horizon()))
        })?;
        check_arguments(model.as_ref(), x, None)?;
        model.quasi_static(&mut self.running_datas[t], x, max_iter, tol)
    }

    /// Quasi-static controls along a state trajectory, for warm-starting a solve.
    ///
    /// Stages whose model cannot provide one fall back to a zero control.
    pub fn quasi_static_controls(
        &mut self,
        xs: &[DVector<f64>],
        max_iter: usize,
        tol: f64,
    ) -> CoreResult<Vec<DVector<f64>>> {
        if xs.len() < self.horizon() {
            return Err(CoreError::DimensionMismatch(format!(
                "expected at least {} states, got {}",
                self.horizon(),
                xs.len()
            )));
        }
        let mut us = Vec::with_capacity(self.horizon());
        for (t, x) in xs.iter().take(self.horizon()).enumerate() {
            let u = match self.quasi_static(t, x, max_iter, tol) {
                Ok(u) => u,
                Err(e @ CoreError::DimensionMismatch(_)) => return Err(e),
                Err(e) => {
                    warn!("Stage {}: {}, using zero control", t, e);
                    DVector::zeros(self.running_models[t].nu())
                }
            };
            us.push(u);
        }
        Ok(us)
    }
}
