//! Feasibility-driven differential dynamic programming (FDDP).
//!
//! FDDP minimizes the total cost of a [`ShootingProblem`] over the controls and,
//! when started from an infeasible guess, over the states as well:
//!
//! ```text
//! min  Σₜ lₜ(xₜ, uₜ) + l_N(x_N)
//! s.t. x₀ = x̂₀,  xₜ₊₁ = fₜ(xₜ, uₜ)
//! ```
//!
//! # Algorithm Overview
//!
//! Each iteration linearizes the dynamics and takes a quadratic expansion of the
//! cost around the current trajectory, then:
//!
//! 1. **Backward pass**: a Riccati-like recursion from the terminal stage computes the
//!    local value function `(Vx, Vxx)` and the affine policy `δu = −k − K·δx`. The
//!    defects `fs` between the trajectory and the dynamics enter the recursion, so the
//!    policy accounts for gaps that are still open.
//! 2. **Forward pass**: a nonlinear rollout applies the policy scaled by a step length
//!    `α`. Only a fraction `α` of each gap is closed, so an infeasible trajectory
//!    becomes feasible as soon as a full step is accepted.
//! 3. **Line search**: step lengths `1, ½, ¼, …` are tried until the actual cost
//!    reduction matches the predicted one `α(d1 + ½αd2)` well enough.
//!
//! ## Regularization
//!
//! `preg` is added to the diagonal of `Vxx` and `ureg` to that of `Quu`. Both grow by
//! `reg_incfactor` when `Quu` is not positive definite or a step is too short, and
//! shrink by `reg_decfactor` after long steps. A failed backward pass counts as a
//! rejected iteration. Hitting `reg_max` without progress ends the solve with
//! [`OptimizationStatus::RegularizationSaturated`].
//!
//! ## Convergence
//!
//! Checked right after each backward pass: the trajectory must be feasible and either
//! `Σ‖Qu‖²` is below `th_stop` or the expected improvement is below `th_grad`. For an
//! LQ problem the first full Newton step is exact, so the solver reports convergence
//! after a single accepted iteration.
//!
//! # Example
//!
//! ```
//! use apex_ddp::core::action::ActionModel;
//! use apex_ddp::core::problem::ShootingProblem;
//! use apex_ddp::models::ActionModelUnicycle;
//! use apex_ddp::optimizer::{Fddp, FddpConfig};
//! use nalgebra::DVector;
//! use std::sync::Arc;
//! # fn example() -> apex_ddp::error::ApexDdpResult<()> {
//!
//! let model: Arc<dyn ActionModel> = Arc::new(ActionModelUnicycle::new());
//! let x0 = DVector::from_vec(vec![-1.0, -1.0, 1.0]);
//! let mut problem = ShootingProblem::new(x0, vec![model.clone(); 20], model)?;
//!
//! let mut solver = Fddp::with_config(FddpConfig::new().with_max_iterations(50));
//! let result = solver.solve(&mut problem, None, None, false, None)?;
//! assert!(result.converged);
//! assert!(result.final_cost < result.initial_cost);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};
use web_time::{Duration, Instant};

use crate::core::CoreResult;
use crate::core::problem::ShootingProblem;
use crate::error::ApexDdpResult;
use crate::linalg::{DenseCholeskySolver, LinAlgError};
use crate::manifold::StateManifold;
use crate::observers::IterationMetrics;
use crate::optimizer::{
    ConvergenceInfo, OptObserver, OptObserverVec, OptimizationStatus, OptimizerError,
    OptimizerResult, SolverResult, Trajectory,
};

/// Summary statistics for an FDDP solve.
#[derive(Debug, Clone)]
pub struct FddpSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Total number of iterations performed
    pub iterations: usize,
    /// Iterations whose line search accepted a step
    pub accepted_steps: usize,
    /// Iterations whose line search accepted nothing
    pub rejected_steps: usize,
    /// Backward passes aborted because `Quu` was not positive definite
    pub backward_failures: usize,
    /// State and control regularization at exit
    pub final_regularization: (f64, f64),
    /// Σ‖Qu‖² from the last backward pass
    pub final_stop: f64,
    /// Sum of the gap norms of the final trajectory
    pub final_feasibility: f64,
    /// Total time elapsed
    pub total_time: Duration,
    /// Average time per iteration
    pub average_time_per_iteration: Duration,
    /// Per-iteration statistics, recorded when debug logging is enabled
    pub iteration_history: Vec<IterationStats>,
    /// Convergence status
    pub convergence_status: OptimizationStatus,
}

impl Display for FddpSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "FDDP Final Result")?;

        if self.convergence_status.is_converged() {
            writeln!(f, "CONVERGED ({:?})", self.convergence_status)?;
        } else {
            writeln!(f, "NOT CONVERGED ({:?})", self.convergence_status)?;
        }

        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.abs().max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(
            f,
            "  Accepted steps:     {} ({:.1}%)",
            self.accepted_steps,
            100.0 * self.accepted_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "  Rejected steps:     {} ({:.1}%)",
            self.rejected_steps,
            100.0 * self.rejected_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "  Backward failures:  {}", self.backward_failures)?;
        writeln!(f)?;
        writeln!(f, "Optimality:")?;
        writeln!(f, "  Stop:        {:.2e}", self.final_stop)?;
        writeln!(f, "  Feasibility: {:.2e}", self.final_feasibility)?;
        writeln!(
            f,
            "  Regularization: ({:.1e}, {:.1e})",
            self.final_regularization.0, self.final_regularization.1
        )?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.average_time_per_iteration.as_secs_f64() * 1000.0
        )?;

        Ok(())
    }
}

/// Per-iteration statistics for detailed logging.
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    /// Cost after the line search
    pub cost: f64,
    /// Cost reduction achieved by this iteration
    pub cost_change: f64,
    /// Σ‖Qu‖² from the backward pass
    pub stop: f64,
    /// First-order expected improvement d1
    pub expected_improvement: f64,
    /// Accepted step length, or the shortest one tried
    pub step_length: f64,
    /// State regularization after the update
    pub preg: f64,
    /// Sum of gap norms before the step
    pub feasibility: f64,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since the solve started in milliseconds
    pub total_time_ms: f64,
    /// Whether the line search accepted a step
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>11}  {:>11}  {:>9}  {:>9}  {:>11}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "stop",
            "grad",
            "step",
            "preg",
            "feas",
            "iter_time",
            "total_time",
            "status"
        );
    }

    /// Print single iteration line with scientific notation
    pub fn print_line(&self) {
        let status = if self.accepted { "✓" } else { "✗" };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>9.4}  {:>9.1e}  {:>11.2e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.stop,
            -self.expected_improvement,
            self.step_length,
            self.preg,
            self.feasibility,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Configuration parameters for the FDDP solver.
///
/// All options can be set with the builder pattern:
///
/// ```
/// use apex_ddp::optimizer::FddpConfig;
///
/// let config = FddpConfig::new()
///     .with_max_iterations(200)
///     .with_regularization_bounds(1e-9, 1e6)
///     .with_stop_threshold(1e-10)
///     .with_line_search_steps(12);
/// assert!(config.validate().is_ok());
/// ```
///
/// # Step acceptance
///
/// With `dV` the actual and `dVexp = α(d1 + ½αd2)` the expected cost reduction, a step
/// is accepted when `|d1| < th_grad` or
///
/// - `dV > th_acceptstep·dVexp` if `dVexp ≥ 0`
/// - `dV > th_acceptnegstep·dVexp` if `dVexp < 0`, which happens while gaps are being
///   closed and the cost is allowed to grow by a bounded amount
///
/// `dVexp` comes from the backward pass alone. For infeasible partial steps (`α < 1`)
/// it leaves out the trial-dependent gap term `−Σ fsᵀ·Vxx·(x_try ⊖ x)`.
#[derive(Debug, Clone)]
pub struct FddpConfig {
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Timeout duration, checked between iterations
    pub timeout: Option<Duration>,
    /// Regularization growth factor
    pub reg_incfactor: f64,
    /// Regularization shrink factor
    pub reg_decfactor: f64,
    /// Regularization lower bound, also the default initial value
    pub reg_min: f64,
    /// Regularization upper bound
    pub reg_max: f64,
    /// Accepted steps longer than this shrink the regularization
    pub th_stepdec: f64,
    /// Steps no longer than this grow the regularization
    pub th_stepinc: f64,
    /// Expected improvement below which a step is accepted unconditionally
    pub th_grad: f64,
    /// Convergence threshold on Σ‖Qu‖²
    pub th_stop: f64,
    /// Minimum ratio of actual to expected reduction
    pub th_acceptstep: f64,
    /// Maximum ratio of actual cost increase to expected increase
    pub th_acceptnegstep: f64,
    /// Number of step lengths tried, halving from 1
    pub line_search_steps: usize,
}

impl Default for FddpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            timeout: None,
            reg_incfactor: 10.0,
            reg_decfactor: 10.0,
            reg_min: 1e-9,
            reg_max: 1e9,
            th_stepdec: 0.5,
            th_stepinc: 0.01,
            th_grad: 1e-12,
            th_stop: 1e-9,
            th_acceptstep: 0.1,
            th_acceptnegstep: 2.0,
            line_search_steps: 10,
        }
    }
}

impl FddpConfig {
    /// Create a new FDDP configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the regularization range `[min, max]`.
    pub fn with_regularization_bounds(mut self, min: f64, max: f64) -> Self {
        self.reg_min = min;
        self.reg_max = max;
        self
    }

    /// Set the growth and shrink factors of the regularization.
    pub fn with_regularization_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.reg_incfactor = increase;
        self.reg_decfactor = decrease;
        self
    }

    /// Set the step lengths that shrink (`decrease`) or grow (`increase`) the
    /// regularization.
    pub fn with_step_thresholds(mut self, decrease: f64, increase: f64) -> Self {
        self.th_stepdec = decrease;
        self.th_stepinc = increase;
        self
    }

    /// Set the expected improvement below which the solve stops.
    pub fn with_gradient_threshold(mut self, th_grad: f64) -> Self {
        self.th_grad = th_grad;
        self
    }

    /// Set the convergence threshold on Σ‖Qu‖².
    pub fn with_stop_threshold(mut self, th_stop: f64) -> Self {
        self.th_stop = th_stop;
        self
    }

    /// Set the acceptance ratios for positive and negative expected improvement.
    pub fn with_acceptance_thresholds(mut self, step: f64, negative_step: f64) -> Self {
        self.th_acceptstep = step;
        self.th_acceptnegstep = negative_step;
        self
    }

    /// Set how many halvings of the step length the line search tries.
    pub fn with_line_search_steps(mut self, steps: usize) -> Self {
        self.line_search_steps = steps;
        self
    }

    /// Check that the parameters describe a usable solver.
    pub fn validate(&self) -> OptimizerResult<()> {
        if !(self.reg_min.is_finite() && self.reg_min > 0.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "reg_min must be finite and positive, got {}",
                self.reg_min
            )));
        }
        if !(self.reg_max.is_finite() && self.reg_max >= self.reg_min) {
            return Err(OptimizerError::InvalidParameters(format!(
                "reg_max must be finite and at least reg_min, got [{}, {}]",
                self.reg_min, self.reg_max
            )));
        }
        if !(self.reg_incfactor > 1.0 && self.reg_decfactor > 1.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "regularization factors must exceed 1, got increase {} and decrease {}",
                self.reg_incfactor, self.reg_decfactor
            )));
        }
        if self.line_search_steps == 0 {
            return Err(OptimizerError::InvalidParameters(
                "line search needs at least one step length".to_string(),
            ));
        }
        if !(self.th_acceptstep > 0.0 && self.th_acceptstep < 1.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "th_acceptstep must lie in (0, 1), got {}",
                self.th_acceptstep
            )));
        }
        if self.th_acceptnegstep < 1.0 {
            return Err(OptimizerError::InvalidParameters(format!(
                "th_acceptnegstep must be at least 1, got {}",
                self.th_acceptnegstep
            )));
        }
        Ok(())
    }

    /// Acceptance test of the line search.
    fn accepts_step(&self, actual: f64, expected: f64, d1: f64) -> bool {
        if d1.abs() < self.th_grad {
            return true;
        }
        if expected >= 0.0 {
            actual > self.th_acceptstep * expected
        } else {
            actual > self.th_acceptnegstep * expected
        }
    }

    /// Print configuration parameters (debug level only)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:        FDDP\n  Convergence Criteria:\n  Max iterations:      {}\n  Stop threshold:      {:.2e}\n  Gradient threshold:  {:.2e}\n  Timeout:             {:?}\n  Regularization:\n  Range:               [{:.2e}, {:.2e}]\n  Increase factor:     {:.2}\n  Decrease factor:     {:.2}\n  Step thresholds:     dec {:.2}, inc {:.2}\n  Line Search:\n  Steps:               {}\n  Accept ratios:       {:.2}, {:.2}",
            self.max_iterations,
            self.th_stop,
            self.th_grad,
            self.timeout,
            self.reg_min,
            self.reg_max,
            self.reg_incfactor,
            self.reg_decfactor,
            self.th_stepdec,
            self.th_stepinc,
            self.line_search_steps,
            self.th_acceptstep,
            self.th_acceptnegstep
        );
    }
}

/// Per-stage buffers of one solve.
///
/// Index `t` runs over `0..=N`; the running-stage quantities (`Q*`, gains) have
/// length `N`, the value function and the gaps have length `N + 1`.
#[derive(Debug, Default)]
struct Workspace {
    states: Vec<Arc<dyn StateManifold>>,
    current: Trajectory,
    trial: Trajectory,
    fs: Vec<DVector<f64>>,
    vx: Vec<DVector<f64>>,
    vxx: Vec<DMatrix<f64>>,
    qx: Vec<DVector<f64>>,
    qu: Vec<DVector<f64>>,
    qxx: Vec<DMatrix<f64>>,
    qxu: Vec<DMatrix<f64>>,
    quu: Vec<DMatrix<f64>>,
    feedforward: Vec<DVector<f64>>,
    feedback: Vec<DMatrix<f64>>,
    cholesky: DenseCholeskySolver,
    preg: f64,
    ureg: f64,
    d1: f64,
    d2: f64,
    cost: f64,
    stop: f64,
    is_feasible: bool,
}

impl Workspace {
    fn new(
        problem: &ShootingProblem,
        current: Trajectory,
        is_feasible: bool,
        regularization: f64,
    ) -> Self {
        let horizon = problem.horizon();
        let mut states: Vec<Arc<dyn StateManifold>> = problem
            .running_models()
            .iter()
            .map(|m| m.state().clone())
            .collect();
        states.push(problem.terminal_model().state().clone());

        let ndx: Vec<usize> = states.iter().map(|s| s.ndx()).collect();
        let nu: Vec<usize> = problem.running_models().iter().map(|m| m.nu()).collect();

        Workspace {
            trial: current.clone(),
            current,
            fs: ndx.iter().map(|&n| DVector::zeros(n)).collect(),
            vx: ndx.iter().map(|&n| DVector::zeros(n)).collect(),
            vxx: ndx.iter().map(|&n| DMatrix::zeros(n, n)).collect(),
            qx: (0..horizon).map(|t| DVector::zeros(ndx[t])).collect(),
            qu: (0..horizon).map(|t| DVector::zeros(nu[t])).collect(),
            qxx: (0..horizon).map(|t| DMatrix::zeros(ndx[t], ndx[t])).collect(),
            qxu: (0..horizon).map(|t| DMatrix::zeros(ndx[t], nu[t])).collect(),
            quu: (0..horizon).map(|t| DMatrix::zeros(nu[t], nu[t])).collect(),
            feedforward: (0..horizon).map(|t| DVector::zeros(nu[t])).collect(),
            feedback: (0..horizon).map(|t| DMatrix::zeros(nu[t], ndx[t])).collect(),
            states,
            cholesky: DenseCholeskySolver::new(),
            preg: regularization,
            ureg: regularization,
            d1: 0.0,
            d2: 0.0,
            cost: 0.0,
            stop: 0.0,
            is_feasible,
        }
    }

    fn horizon(&self) -> usize {
        self.current.horizon()
    }

    fn feasibility(&self) -> f64 {
        self.fs.iter().map(|f| f.norm()).sum()
    }

    /// Riccati recursion over the derivatives stored in the problem data.
    ///
    /// Returns `Ok(false)` when `Quu` is not positive definite or the value function
    /// stops being finite; the caller then raises the regularization and retries.
    fn backward_pass(&mut self, problem: &ShootingProblem) -> OptimizerResult<bool> {
        let horizon = self.horizon();
        let terminal = problem.terminal_data();

        let mut vxx_terminal = terminal.lxx.clone();
        add_to_diagonal(&mut vxx_terminal, self.preg);
        let mut vx_terminal = terminal.lx.clone();
        if !self.is_feasible {
            vx_terminal += &vxx_terminal * &self.fs[horizon];
        }
        if !is_finite_vector(&vx_terminal) {
            return Ok(false);
        }
        self.vx[horizon] = vx_terminal;
        self.vxx[horizon] = vxx_terminal;

        for (t, data) in problem.running_datas().iter().enumerate().rev() {
            let vx_next = &self.vx[t + 1];
            let vxx_next = &self.vxx[t + 1];

            let fx_t_vxx = data.fx.transpose() * vxx_next;
            self.qxx[t] = &data.lxx + &fx_t_vxx * &data.fx;
            self.qx[t] = &data.lx + data.fx.transpose() * vx_next;

            let (mut vx, mut vxx) = if data.lu.is_empty() {
                (self.qx[t].clone(), self.qxx[t].clone())
            } else {
                let fu_t_vxx = data.fu.transpose() * vxx_next;
                self.qxu[t] = &data.lxu + &fx_t_vxx * &data.fu;
                self.qu[t] = &data.lu + data.fu.transpose() * vx_next;
                let mut quu = &data.luu + &fu_t_vxx * &data.fu;
                add_to_diagonal(&mut quu, self.ureg);
                self.quu[t] = quu;

                match self.cholesky.factorize(&self.quu[t]) {
                    Ok(()) => {}
                    Err(
                        LinAlgError::NotPositiveDefinite(_) | LinAlgError::NumericalInstability(_),
                    ) => {
                        debug!("Quu at stage {} is not positive definite", t);
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                }
                self.feedforward[t] = self.cholesky.solve_vector(&self.qu[t])?;
                self.feedback[t] = self.cholesky.solve(&self.qxu[t].transpose())?;

                (
                    &self.qx[t] - self.feedback[t].transpose() * &self.qu[t],
                    &self.qxx[t] - &self.qxu[t] * &self.feedback[t],
                )
            };

            vxx = (&vxx + vxx.transpose()) * 0.5;
            add_to_diagonal(&mut vxx, self.preg);
            if !self.is_feasible {
                vx += &vxx * &self.fs[t];
            }
            if !is_finite_vector(&vx) {
                debug!("Value gradient at stage {} is not finite", t);
                return Ok(false);
            }
            self.vx[t] = vx;
            self.vxx[t] = vxx;
        }
        Ok(true)
    }

    /// Coefficients of the predicted reduction `α(d1 + ½αd2)` and the stop criterion.
    fn update_expected_improvement(&mut self) {
        let mut d1 = 0.0;
        let mut d2 = 0.0;
        let mut stop = 0.0;
        for t in 0..self.horizon() {
            let k = &self.feedforward[t];
            d1 += self.qu[t].dot(k);
            d2 -= k.dot(&(&self.quu[t] * k));
            stop += self.qu[t].norm_squared();
        }
        if !self.is_feasible {
            for (t, fs) in self.fs.iter().enumerate() {
                d1 -= self.vx[t].dot(fs);
                d2 += fs.dot(&(&self.vxx[t] * fs));
            }
        }
        self.d1 = d1;
        self.d2 = d2;
        self.stop = stop;
    }

    /// Nonlinear rollout of the current policy with step length `alpha`.
    ///
    /// The candidate lands in `self.trial`. Returns its cost, or `None` when the
    /// rollout produced a non-finite state or cost.
    fn try_step(&mut self, problem: &mut ShootingProblem, alpha: f64) -> CoreResult<Option<f64>> {
        let horizon = self.horizon();
        let close_gaps = self.is_feasible || alpha == 1.0;
        let mut xnext = problem.x0().clone();
        let mut cost = 0.0;

        for t in 0..horizon {
            let state = &self.states[t];
            let x_try = if close_gaps {
                xnext
            } else {
                state.integrate(&xnext, &(&self.fs[t] * (alpha - 1.0)))
            };
            let dx = state.diff(&self.current.xs[t], &x_try);
            let u_try =
                &self.current.us[t] - &self.feedforward[t] * alpha - &self.feedback[t] * dx;

            let data = problem.calc_stage(t, &x_try, &u_try)?;
            if !data.is_calc_finite() || !is_finite_vector(&x_try) || !is_finite_vector(&u_try)
            {
                return Ok(None);
            }
            cost += data.cost;
            xnext = data.xnext.clone();
            self.trial.xs[t] = x_try;
            self.trial.us[t] = u_try;
        }

        let x_final = if close_gaps {
            xnext
        } else {
            self.states[horizon].integrate(&xnext, &(&self.fs[horizon] * (alpha - 1.0)))
        };
        let terminal = problem.calc_terminal(&x_final)?;
        if !terminal.is_calc_finite() || !is_finite_vector(&x_final) {
            return Ok(None);
        }
        cost += terminal.cost;
        self.trial.xs[horizon] = x_final;
        Ok(Some(cost))
    }

    fn accept_trial(&mut self, cost: f64, alpha: f64) {
        std::mem::swap(&mut self.current, &mut self.trial);
        self.cost = cost;
        if alpha == 1.0 {
            self.is_feasible = true;
        }
    }

    fn increase_regularization(&mut self, config: &FddpConfig) {
        self.preg = (self.preg * config.reg_incfactor).min(config.reg_max);
        self.ureg = (self.ureg * config.reg_incfactor).min(config.reg_max);
    }

    fn decrease_regularization(&mut self, config: &FddpConfig) {
        self.preg = (self.preg / config.reg_decfactor).max(config.reg_min);
        self.ureg = (self.ureg / config.reg_decfactor).max(config.reg_min);
    }

    fn is_saturated(&self, config: &FddpConfig) -> bool {
        self.preg >= config.reg_max
    }

    /// Bring the problem data back in line with the current trajectory and return
    /// its gaps.
    fn finalize(
        &mut self,
        problem: &mut ShootingProblem,
        stale: bool,
    ) -> CoreResult<Vec<DVector<f64>>> {
        if stale {
            self.cost = problem.calc(&self.current.xs, &self.current.us)?;
        }
        let gaps = problem.feasibility_gaps(&self.current.xs)?;
        self.fs.clone_from(&gaps);
        Ok(gaps)
    }
}

fn add_to_diagonal(matrix: &mut DMatrix<f64>, value: f64) {
    for i in 0..matrix.nrows().min(matrix.ncols()) {
        matrix[(i, i)] += value;
    }
}

fn is_finite_vector(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// Counters accumulated over one solve.
#[derive(Debug, Default)]
struct SolveProgress {
    calc_evaluations: usize,
    calc_diff_evaluations: usize,
    accepted_steps: usize,
    rejected_steps: usize,
    backward_failures: usize,
    step_lengths: Vec<f64>,
    iteration_stats: Vec<IterationStats>,
}

/// Feasibility-driven DDP solver.
///
/// The solver keeps its workspace after [`solve`](Self::solve) returns, so the
/// feedback gains, value function and regularization of the last backward pass can
/// be inspected, e.g. to run the policy in closed loop.
///
/// # Examples
///
/// ```no_run
/// use apex_ddp::optimizer::{Fddp, FddpConfig};
/// use apex_ddp::observers::VerboseObserver;
///
/// let config = FddpConfig::new()
///     .with_max_iterations(200)
///     .with_stop_threshold(1e-12);
///
/// let mut solver = Fddp::with_config(config);
/// solver.add_observer(VerboseObserver::new());
/// ```
pub struct Fddp {
    config: FddpConfig,
    workspace: Workspace,
    observers: OptObserverVec,
}

impl Default for Fddp {
    fn default() -> Self {
        Self::new()
    }
}

impl Fddp {
    /// Create a new FDDP solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(FddpConfig::default())
    }

    /// Create a new FDDP solver with the given configuration.
    pub fn with_config(config: FddpConfig) -> Self {
        Self {
            config,
            workspace: Workspace::default(),
            observers: OptObserverVec::new(),
        }
    }

    /// Add an observer to monitor solver progress.
    ///
    /// Observers are notified once per iteration, after the line search.
    pub fn add_observer(&mut self, observer: impl OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Configuration used by the next solve.
    pub fn config(&self) -> &FddpConfig {
        &self.config
    }

    /// Current trajectory of the last solve.
    pub fn trajectory(&self) -> &Trajectory {
        &self.workspace.current
    }

    /// Feedback gains `K[t]` of the last backward pass.
    pub fn feedback_gains(&self) -> &[DMatrix<f64>] {
        &self.workspace.feedback
    }

    /// Feed-forward terms `k[t]` of the last backward pass.
    pub fn feedforward_terms(&self) -> &[DVector<f64>] {
        &self.workspace.feedforward
    }

    /// Value function gradients `Vx[t]`, `t = 0..=N`.
    pub fn value_gradients(&self) -> &[DVector<f64>] {
        &self.workspace.vx
    }

    /// Value function Hessians `Vxx[t]`, `t = 0..=N`.
    pub fn value_hessians(&self) -> &[DMatrix<f64>] {
        &self.workspace.vxx
    }

    /// Gaps of the current trajectory.
    pub fn gaps(&self) -> &[DVector<f64>] {
        &self.workspace.fs
    }

    /// State and control regularization `(preg, ureg)`.
    pub fn regularization(&self) -> (f64, f64) {
        (self.workspace.preg, self.workspace.ureg)
    }

    /// Expected improvement coefficients `(d1, d2)` of the last backward pass.
    pub fn expected_improvement(&self) -> (f64, f64) {
        (self.workspace.d1, self.workspace.d2)
    }

    /// Σ‖Qu‖² of the last backward pass.
    pub fn stop(&self) -> f64 {
        self.workspace.stop
    }

    /// Whether the current trajectory satisfies the dynamics.
    pub fn is_feasible(&self) -> bool {
        self.workspace.is_feasible
    }

    /// Solve with the iteration budget of the configuration.
    ///
    /// `xs0` and `us0` form the initial guess. Missing controls default to zero and
    /// missing states to a rollout of the controls from `x0`, which is feasible.
    /// `is_feasible` declares whether a given `xs0` satisfies the dynamics; the
    /// initial regularization defaults to `reg_min` and is clamped to the
    /// configured range.
    ///
    /// # Errors
    /// - `CoreError::DimensionMismatch` for a malformed initial guess, raised before
    ///   any problem data is modified
    /// - `OptimizerError::InvalidParameters` for an invalid configuration
    /// - `OptimizerError::InvalidNumericValue` when the cost or derivatives of an
    ///   accepted trajectory are not finite
    /// - errors returned by the action models
    ///
    /// Running out of iterations or regularization is not an error: it is reported
    /// through [`SolverResult::status`] with `converged == false`.
    pub fn solve(
        &mut self,
        problem: &mut ShootingProblem,
        xs0: Option<&[DVector<f64>]>,
        us0: Option<&[DVector<f64>]>,
        is_feasible: bool,
        init_reg: Option<f64>,
    ) -> ApexDdpResult<SolverResult> {
        let max_iterations = self.config.max_iterations;
        self.solve_with_budget(problem, xs0, us0, is_feasible, init_reg, max_iterations)
    }

    /// Initial trajectory, cost and regularization of a solve.
    fn initialize(
        &mut self,
        problem: &mut ShootingProblem,
        xs0: Option<&[DVector<f64>]>,
        us0: Option<&[DVector<f64>]>,
        is_feasible: bool,
        init_reg: Option<f64>,
    ) -> ApexDdpResult<()> {
        self.config.validate()?;

        let regularization = match init_reg {
            Some(r) if r.is_nan() => {
                return Err(OptimizerError::InvalidParameters(
                    "initial regularization is NaN".to_string(),
                )
                .into());
            }
            Some(r) => r.clamp(self.config.reg_min, self.config.reg_max),
            None => self.config.reg_min,
        };

        let us: Vec<DVector<f64>> = match us0 {
            Some(us) => us.to_vec(),
            None => problem
                .running_models()
                .iter()
                .map(|m| DVector::zeros(m.nu()))
                .collect(),
        };

        let (xs, is_feasible) = match xs0 {
            Some(xs) => (xs.to_vec(), is_feasible),
            None => (problem.rollout(&us)?, true),
        };
        problem.check_trajectory(&xs, &us)?;

        let current = Trajectory::new(xs, us)?;
        self.workspace = Workspace::new(problem, current, is_feasible, regularization);
        Ok(())
    }

    /// Create the solve summary
    fn create_summary(
        &self,
        initial_cost: f64,
        iterations: usize,
        total_time: Duration,
        progress: &SolveProgress,
        status: &OptimizationStatus,
    ) -> FddpSummary {
        FddpSummary {
            initial_cost,
            final_cost: self.workspace.cost,
            iterations,
            accepted_steps: progress.accepted_steps,
            rejected_steps: progress.rejected_steps,
            backward_failures: progress.backward_failures,
            final_regularization: (self.workspace.preg, self.workspace.ureg),
            final_stop: self.workspace.stop,
            final_feasibility: self.workspace.feasibility(),
            total_time,
            average_time_per_iteration: if iterations > 0 {
                total_time / iterations as u32
            } else {
                Duration::from_secs(0)
            },
            iteration_history: progress.iteration_stats.clone(),
            convergence_status: status.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        problem: &mut ShootingProblem,
        stale: bool,
        initial_cost: f64,
        iterations: usize,
        start_time: Instant,
        mut progress: SolveProgress,
        status: OptimizationStatus,
    ) -> ApexDdpResult<SolverResult> {
        if stale {
            progress.calc_evaluations += 1;
        }
        let gaps = self.workspace.finalize(problem, stale)?;
        let elapsed = start_time.elapsed();

        if tracing::enabled!(tracing::Level::DEBUG) {
            let summary = self.create_summary(initial_cost, iterations, elapsed, &progress, &status);
            debug!("{}", summary);
        }

        Ok(SolverResult {
            trajectory: self.workspace.current.clone(),
            converged: status.is_converged(),
            status,
            initial_cost,
            final_cost: self.workspace.cost,
            iterations,
            step_lengths: progress.step_lengths,
            gaps,
            elapsed_time: elapsed,
            convergence_info: Some(ConvergenceInfo {
                final_stop: self.workspace.stop,
                final_expected_improvement: self.workspace.d1,
                final_regularization: (self.workspace.preg, self.workspace.ureg),
                final_feasibility: self.workspace.feasibility(),
                calc_evaluations: progress.calc_evaluations,
                calc_diff_evaluations: progress.calc_diff_evaluations,
                rejected_iterations: progress.rejected_steps,
            }),
        })
    }

    /// Error for a non-finite evaluation of the current trajectory.
    fn invalid_numeric_value(&self, message: String) -> OptimizerError {
        OptimizerError::InvalidNumericValue {
            message,
            last_valid: Box::new(self.workspace.current.clone()),
        }
        .log()
    }

    /// Solve with an explicit iteration budget.
    ///
    /// See [`solve`](Self::solve) for the meaning of the arguments.
    pub fn solve_with_budget(
        &mut self,
        problem: &mut ShootingProblem,
        xs0: Option<&[DVector<f64>]>,
        us0: Option<&[DVector<f64>]>,
        is_feasible: bool,
        init_reg: Option<f64>,
        max_iterations: usize,
    ) -> ApexDdpResult<SolverResult> {
        let start_time = Instant::now();
        self.initialize(problem, xs0, us0, is_feasible, init_reg)?;

        let mut progress = SolveProgress {
            calc_evaluations: 1,
            step_lengths: Vec::with_capacity(max_iterations),
            ..SolveProgress::default()
        };

        let initial_cost = problem.calc(&self.workspace.current.xs, &self.workspace.current.us)?;
        if !initial_cost.is_finite() {
            return Err(self
                .invalid_numeric_value(format!("initial cost is {}", initial_cost))
                .into());
        }
        self.workspace.cost = initial_cost;

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        let mut recalc = true;
        let mut stale = false;

        for iteration in 0..max_iterations {
            let iter_start = Instant::now();

            if iteration > 0
                && let Some(timeout) = self.config.timeout
                && start_time.elapsed() >= timeout
            {
                return self.finish(
                    problem,
                    stale,
                    initial_cost,
                    iteration,
                    start_time,
                    progress,
                    OptimizationStatus::Timeout,
                );
            }

            if recalc {
                problem.calc_diff(&self.workspace.current.xs, &self.workspace.current.us)?;
                progress.calc_diff_evaluations += 1;
                let all_finite = problem.running_datas().iter().all(|d| d.is_finite())
                    && problem.terminal_data().is_finite();
                if !all_finite {
                    return Err(self
                        .invalid_numeric_value(format!(
                            "derivatives at iteration {} are not finite",
                            iteration
                        ))
                        .into());
                }
                self.workspace.fs = problem.feasibility_gaps(&self.workspace.current.xs)?;
                recalc = false;
            }

            // A failed backward pass raises the regularization and uses up the iteration
            if !self.workspace.backward_pass(problem)? {
                progress.backward_failures += 1;
                if self.workspace.is_saturated(&self.config) {
                    warn!(
                        "Backward pass failed with regularization at its upper bound {:.1e}",
                        self.config.reg_max
                    );
                    return self.finish(
                        problem,
                        stale,
                        initial_cost,
                        iteration,
                        start_time,
                        progress,
                        OptimizationStatus::RegularizationSaturated,
                    );
                }
                self.workspace.increase_regularization(&self.config);
                progress.step_lengths.push(0.0);

                if !self.observers.is_empty() {
                    let metrics = IterationMetrics {
                        iteration,
                        cost: self.workspace.cost,
                        stop: self.workspace.stop,
                        expected_improvement: self.workspace.d1,
                        step_length: 0.0,
                        accepted: false,
                        preg: self.workspace.preg,
                        ureg: self.workspace.ureg,
                        feasibility: self.workspace.feasibility(),
                    };
                    self.observers.set_iteration_metrics(&metrics);
                    self.observers.notify(&self.workspace.current, iteration);
                }
                continue;
            }
            self.workspace.update_expected_improvement();

            if self.workspace.is_feasible {
                let status = if self.workspace.stop < self.config.th_stop {
                    Some(OptimizationStatus::Converged)
                } else if self.workspace.d1.abs() < self.config.th_grad {
                    Some(OptimizationStatus::GradientToleranceReached)
                } else {
                    None
                };
                if let Some(status) = status {
                    return self.finish(
                        problem,
                        stale,
                        initial_cost,
                        iteration,
                        start_time,
                        progress,
                        status,
                    );
                }
            }

            let feasibility = self.workspace.feasibility();
            let previous_cost = self.workspace.cost;
            let mut accepted = false;
            let mut alpha = 1.0;

            for i in 0..self.config.line_search_steps {
                alpha = 0.5f64.powi(i as i32);
                progress.calc_evaluations += 1;
                let ws = &mut self.workspace;
                let Some(cost_try) = ws.try_step(problem, alpha)? else {
                    continue;
                };
                let actual = ws.cost - cost_try;
                let expected = alpha * (ws.d1 + 0.5 * alpha * ws.d2);
                if self.config.accepts_step(actual, expected, ws.d1) {
                    ws.accept_trial(cost_try, alpha);
                    accepted = true;
                    break;
                }
            }

            let mut saturated = false;
            if accepted {
                progress.accepted_steps += 1;
                progress.step_lengths.push(alpha);
                recalc = true;
                stale = false;
                if alpha > self.config.th_stepdec {
                    self.workspace.decrease_regularization(&self.config);
                }
                if alpha <= self.config.th_stepinc {
                    self.workspace.increase_regularization(&self.config);
                }
            } else {
                progress.rejected_steps += 1;
                progress.step_lengths.push(0.0);
                stale = true;
                saturated = self.workspace.is_saturated(&self.config);
                self.workspace.increase_regularization(&self.config);
            }

            let metrics = IterationMetrics {
                iteration,
                cost: self.workspace.cost,
                stop: self.workspace.stop,
                expected_improvement: self.workspace.d1,
                step_length: alpha,
                accepted,
                preg: self.workspace.preg,
                ureg: self.workspace.ureg,
                feasibility,
            };

            if tracing::enabled!(tracing::Level::DEBUG) {
                let stats = IterationStats {
                    iteration,
                    cost: metrics.cost,
                    cost_change: previous_cost - metrics.cost,
                    stop: metrics.stop,
                    expected_improvement: metrics.expected_improvement,
                    step_length: alpha,
                    preg: metrics.preg,
                    feasibility,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                    accepted,
                };
                stats.print_line();
                progress.iteration_stats.push(stats);
            }

            if !self.observers.is_empty() {
                self.observers.set_iteration_metrics(&metrics);
                self.observers.notify(&self.workspace.current, iteration);
            }

            if saturated {
                warn!(
                    "Line search rejected every step with regularization at {:.1e}",
                    self.config.reg_max
                );
                return self.finish(
                    problem,
                    stale,
                    initial_cost,
                    iteration + 1,
                    start_time,
                    progress,
                    OptimizationStatus::RegularizationSaturated,
                );
            }
        }

        self.finish(
            problem,
            stale,
            initial_cost,
            max_iterations,
            start_time,
            progress,
            OptimizationStatus::MaxIterationsReached,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreError;
    use crate::core::action::ActionModel;
    use crate::error::ApexDdpError;
    use crate::models::{ActionModelLqr, ActionModelUnicycle};
    use crate::observers::HistoryObserver;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn double_integrator(horizon: usize) -> CoreResult<ShootingProblem> {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.0, 1.0]);
        let b = DMatrix::from_row_slice(2, 1, &[0.005, 0.1]);
        let model: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::new(
            a,
            b,
            DMatrix::identity(2, 2),
            DMatrix::identity(1, 1) * 0.1,
        )?);
        let terminal: Arc<dyn ActionModel> =
            Arc::new(ActionModelLqr::terminal(DMatrix::identity(2, 2) * 10.0)?);
        ShootingProblem::new(
            DVector::from_vec(vec![1.0, -0.5]),
            vec![model; horizon],
            terminal,
        )
    }

    fn unicycle(horizon: usize) -> CoreResult<ShootingProblem> {
        let model: Arc<dyn ActionModel> = Arc::new(ActionModelUnicycle::new());
        ShootingProblem::new(
            DVector::from_vec(vec![-1.0, -1.0, 1.0]),
            vec![model.clone(); horizon],
            model,
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = FddpConfig::default();
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.reg_min, 1e-9);
        assert_eq!(config.reg_max, 1e9);
        assert_eq!(config.reg_incfactor, 10.0);
        assert_eq!(config.th_acceptstep, 0.1);
        assert_eq!(config.th_acceptnegstep, 2.0);
        assert_eq!(config.line_search_steps, 10);
        assert!(config.timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = FddpConfig::new()
            .with_max_iterations(7)
            .with_regularization_bounds(1e-6, 1e3)
            .with_regularization_factors(4.0, 2.0)
            .with_step_thresholds(0.6, 0.05)
            .with_acceptance_thresholds(0.2, 3.0)
            .with_line_search_steps(4);
        assert_eq!(config.max_iterations, 7);
        assert_eq!((config.reg_min, config.reg_max), (1e-6, 1e3));
        assert_eq!((config.reg_incfactor, config.reg_decfactor), (4.0, 2.0));
        assert_eq!((config.th_stepdec, config.th_stepinc), (0.6, 0.05));
        assert_eq!(config.line_search_steps, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let inverted = FddpConfig::new().with_regularization_bounds(1.0, 1e-3);
        assert!(matches!(
            inverted.validate(),
            Err(OptimizerError::InvalidParameters(_))
        ));
        let no_steps = FddpConfig::new().with_line_search_steps(0);
        assert!(no_steps.validate().is_err());
        let weak_factor = FddpConfig::new().with_regularization_factors(1.0, 10.0);
        assert!(weak_factor.validate().is_err());
        // a zero floor could never be raised by multiplication
        let zero_floor = FddpConfig::new().with_regularization_bounds(0.0, 1e9);
        assert!(matches!(
            zero_floor.validate(),
            Err(OptimizerError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_backward_failures_use_up_the_budget() -> TestResult {
        // x' = x + u with Luu = -5: Quu stays indefinite until ureg passes 4
        let running: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::new(
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1),
            DMatrix::from_element(1, 1, -5.0),
        )?);
        let terminal: Arc<dyn ActionModel> =
            Arc::new(ActionModelLqr::terminal(DMatrix::identity(1, 1))?);
        let mut problem =
            ShootingProblem::new(DVector::from_element(1, 1.0), vec![running; 3], terminal)?;

        let history = HistoryObserver::new();
        let mut solver = Fddp::with_config(FddpConfig::new().with_max_iterations(5));
        solver.add_observer(history.clone());
        let result = solver.solve(&mut problem, None, None, true, None)?;

        assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 5);
        assert_eq!(result.step_lengths, vec![0.0; 5]);
        assert_eq!(history.metrics()?.len(), 5);
        let (preg, _) = solver.regularization();
        assert!((preg - 1e-4).abs() < 1e-16);

        let unbounded = FddpConfig::new().with_regularization_bounds(0.0, 1e9);
        let result = Fddp::with_config(unbounded).solve(&mut problem, None, None, true, None);
        assert!(matches!(
            result,
            Err(ApexDdpError::Optimizer(OptimizerError::InvalidParameters(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_step_acceptance_rules() {
        let config = FddpConfig::default();
        // positive expected improvement: need a tenth of it
        assert!(config.accepts_step(0.5, 1.0, 1.0));
        assert!(!config.accepts_step(0.05, 1.0, 1.0));
        // negative expected improvement: cost may grow up to twice the prediction
        assert!(config.accepts_step(-1.5, -1.0, 1.0));
        assert!(!config.accepts_step(-2.5, -1.0, 1.0));
        // vanishing gradient accepts anything
        assert!(config.accepts_step(-10.0, 1.0, 1e-14));
    }

    #[test]
    fn test_lqr_converges_after_one_full_step() -> TestResult {
        let mut problem = double_integrator(10)?;
        let mut solver = Fddp::new();
        let result = solver.solve(&mut problem, None, None, false, None)?;

        assert!(result.converged);
        assert_eq!(result.status, OptimizationStatus::Converged);
        assert_eq!(result.step_lengths, vec![1.0]);
        assert_eq!(result.accepted_iterations(), 1);
        assert!(result.final_cost < result.initial_cost);
        assert!(result.max_gap() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_lqr_expected_improvement_is_exact() -> TestResult {
        let mut problem = double_integrator(5)?;
        let mut solver = Fddp::new();
        let us = vec![DVector::from_vec(vec![0.3]); 5];
        let result = solver.solve_with_budget(&mut problem, None, Some(&us), true, None, 1)?;
        assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
        assert_eq!(result.step_lengths, vec![1.0]);

        // d1 and d2 still belong to the backward pass that produced the step
        let (d1, d2) = solver.expected_improvement();
        let predicted = d1 + 0.5 * d2;
        let actual = result.initial_cost - result.final_cost;
        assert!(actual > 0.0);
        assert!((actual - predicted).abs() < 1e-6 * actual.max(1.0));
        Ok(())
    }

    #[test]
    fn test_initial_regularization_is_clamped() -> TestResult {
        let mut problem = double_integrator(3)?;
        let config = FddpConfig::new().with_regularization_bounds(1e-6, 1e-2);
        let mut solver = Fddp::with_config(config);
        solver.solve_with_budget(&mut problem, None, None, true, Some(1e3), 0)?;
        assert_eq!(solver.regularization(), (1e-2, 1e-2));

        solver.solve_with_budget(&mut problem, None, None, true, Some(0.0), 0)?;
        assert_eq!(solver.regularization(), (1e-6, 1e-6));

        let nan = solver.solve(&mut problem, None, None, true, Some(f64::NAN));
        assert!(matches!(
            nan,
            Err(ApexDdpError::Optimizer(OptimizerError::InvalidParameters(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_zero_budget_returns_initial_guess() -> TestResult {
        let mut problem = unicycle(8)?;
        let us = vec![DVector::from_vec(vec![0.5, 0.1]); 8];
        let mut solver = Fddp::new();
        let result = solver.solve_with_budget(&mut problem, None, Some(&us), true, None, 0)?;

        assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
        assert!(!result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.trajectory.us, us);
        assert_eq!(result.initial_cost, result.final_cost);
        Ok(())
    }

    #[test]
    fn test_malformed_guess_is_rejected() -> TestResult {
        let mut problem = unicycle(4)?;
        let mut solver = Fddp::new();
        let us = vec![DVector::zeros(2); 3];
        let result = solver.solve(&mut problem, None, Some(&us), true, None);
        assert!(matches!(
            result,
            Err(ApexDdpError::Core(CoreError::DimensionMismatch(_)))
        ));

        let xs = vec![DVector::zeros(3); 4];
        let result = solver.solve(&mut problem, Some(&xs), None, false, None);
        assert!(matches!(
            result,
            Err(ApexDdpError::Core(CoreError::DimensionMismatch(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_unicycle_cost_decreases_monotonically() -> TestResult {
        let mut problem = unicycle(20)?;
        let history = HistoryObserver::new();
        let mut solver = Fddp::new();
        solver.add_observer(history.clone());

        let result = solver.solve(&mut problem, None, None, true, None)?;
        assert!(result.converged);
        assert!(result.iterations > 1);

        let costs = history.costs()?;
        assert_eq!(costs.len(), result.iterations);
        assert!(costs[0] <= result.initial_cost);
        for pair in costs.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_timeout_stops_between_iterations() -> TestResult {
        let mut problem = unicycle(20)?;
        let config = FddpConfig::new().with_timeout(Duration::ZERO);
        let mut solver = Fddp::with_config(config);
        let result = solver.solve(&mut problem, None, None, true, None)?;
        assert_eq!(result.status, OptimizationStatus::Timeout);
        assert_eq!(result.iterations, 1);
        assert!(!result.converged);
        Ok(())
    }

    #[test]
    fn test_gains_have_stage_shapes() -> TestResult {
        let mut problem = unicycle(6)?;
        let mut solver = Fddp::new();
        solver.solve_with_budget(&mut problem, None, None, true, None, 1)?;
        assert_eq!(solver.feedback_gains().len(), 6);
        assert!(solver.feedback_gains().iter().all(|k| k.shape() == (2, 3)));
        assert_eq!(solver.feedforward_terms().len(), 6);
        assert_eq!(solver.value_gradients().len(), 7);
        assert_eq!(solver.value_hessians()[6].shape(), (3, 3));
        Ok(())
    }

    #[test]
    fn test_summary_display() {
        let summary = FddpSummary {
            initial_cost: 10.0,
            final_cost: 1.0,
            iterations: 4,
            accepted_steps: 3,
            rejected_steps: 1,
            backward_failures: 0,
            final_regularization: (1e-9, 1e-9),
            final_stop: 1e-12,
            final_feasibility: 0.0,
            total_time: Duration::from_millis(4),
            average_time_per_iteration: Duration::from_millis(1),
            iteration_history: Vec::new(),
            convergence_status: OptimizationStatus::Converged,
        };
        let text = summary.to_string();
        assert!(text.contains("CONVERGED"));
        assert!(text.contains("Accepted steps:     3"));
    }
}
