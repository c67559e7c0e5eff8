//! Integration tests for apex-ddp
//!
//! These tests run complete FDDP solves on the reference problems and check the
//! properties a correct solver must have.
//!
//! # Test Coverage
//!
//! - **LQR**: convergence after one accepted full step, feedback gains against the
//!   discrete Riccati recursion, a one-stage problem against its closed-form optimum
//! - **Infeasible starts**: gaps close once a full step is accepted
//! - **Nonlinear problems**: unicycle and pendulum swing-up, monotone cost decrease
//!   from feasible starts, quasi-static warm start
//! - **Robustness**: regularization bounds and saturation, malformed guesses rejected
//!   without touching the problem, non-finite derivatives reported with the last valid
//!   trajectory, parallel and sequential evaluation giving identical solves
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

use std::sync::Arc;

use apex_ddp::core::CoreError;
use apex_ddp::core::CoreResult;
use apex_ddp::core::action::{ActionData, ActionModel, check_arguments};
use apex_ddp::core::numdiff::ActionModelNumDiff;
use apex_ddp::core::problem::ShootingProblem;
use apex_ddp::error::ApexDdpError;
use apex_ddp::manifold::{StateManifold, StateSO2, StateVector};
use apex_ddp::models::{ActionModelLqr, ActionModelPendulum, ActionModelUnicycle};
use apex_ddp::observers::HistoryObserver;
use apex_ddp::optimizer::{Fddp, FddpConfig, OptimizationStatus, OptimizerError};
use nalgebra::{DMatrix, DVector};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn unicycle_problem(horizon: usize, parallel: bool) -> CoreResult<ShootingProblem> {
    let model: Arc<dyn ActionModel> = Arc::new(ActionModelUnicycle::new());
    Ok(ShootingProblem::new(
        DVector::from_vec(vec![-1.0, -1.0, 1.0]),
        vec![model.clone(); horizon],
        model,
    )?
    .with_parallel(parallel))
}

fn double_integrator(horizon: usize) -> CoreResult<ShootingProblem> {
    let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.0, 1.0]);
    let b = DMatrix::from_row_slice(2, 1, &[0.005, 0.1]);
    let running: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::new(
        a,
        b,
        DMatrix::identity(2, 2),
        DMatrix::identity(1, 1) * 0.1,
    )?);
    let terminal: Arc<dyn ActionModel> =
        Arc::new(ActionModelLqr::terminal(DMatrix::identity(2, 2) * 100.0)?);
    ShootingProblem::new(
        DVector::from_vec(vec![1.0, 0.0]),
        vec![running; horizon],
        terminal,
    )
}

/// x' = x + u with `½x² − u²`, whose control Hessian can never be made positive
/// definite within a small regularization range.
fn concave_problem(horizon: usize) -> CoreResult<ShootingProblem> {
    let running: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::new(
        DMatrix::identity(1, 1),
        DMatrix::identity(1, 1),
        DMatrix::identity(1, 1),
        DMatrix::from_element(1, 1, -2.0),
    )?);
    let terminal: Arc<dyn ActionModel> =
        Arc::new(ActionModelLqr::terminal(DMatrix::identity(1, 1))?);
    ShootingProblem::new(DVector::from_element(1, 1.0), vec![running; horizon], terminal)
}

/// Integrator whose derivatives are always NaN.
struct BrokenDerivatives {
    state: Arc<dyn StateManifold>,
}

impl ActionModel for BrokenDerivatives {
    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nu(&self) -> usize {
        1
    }

    fn calc(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        check_arguments(self, x, u)?;
        data.cost = 0.5 * x.norm_squared();
        data.xnext = match u {
            Some(u) => x + u,
            None => x.clone(),
        };
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut ActionData,
        _x: &DVector<f64>,
        _u: Option<&DVector<f64>>,
    ) -> CoreResult<()> {
        data.fx = DMatrix::identity(1, 1);
        data.fu = DMatrix::identity(1, 1);
        data.lxx = DMatrix::from_element(1, 1, f64::NAN);
        Ok(())
    }
}

#[test]
fn test_lqr_converges_in_one_iteration_with_riccati_gains() -> TestResult {
    let horizon = 15;
    let running = ActionModelLqr::random(4, 2, true);
    let terminal = ActionModelLqr::random(4, 0, true);
    let running_model: Arc<dyn ActionModel> = Arc::new(running.clone());
    let terminal_model: Arc<dyn ActionModel> = Arc::new(terminal.clone());
    let mut problem = ShootingProblem::new(
        DVector::from_vec(vec![1.0, -1.0, 0.5, 2.0]),
        vec![running_model; horizon],
        terminal_model,
    )?;

    let config = FddpConfig::new().with_regularization_bounds(1e-15, 1e9);
    let mut solver = Fddp::with_config(config);
    let result = solver.solve(&mut problem, None, None, false, None)?;
    assert!(result.converged);
    assert_eq!(result.step_lengths, vec![1.0]);
    assert_eq!(result.iterations, 1);

    // Discrete Riccati recursion
    let (a, b) = (running.fx(), running.fu());
    let (q, r, n) = (running.lxx(), running.luu(), running.lxu());
    let mut p = terminal.lxx().clone();
    for t in (0..horizon).rev() {
        let quu = r + b.transpose() * &p * b;
        let qux = n.transpose() + b.transpose() * &p * a;
        let gain = quu.try_inverse().ok_or("singular Quu")? * &qux;
        p = q + a.transpose() * &p * a - qux.transpose() * &gain;

        let error = (&solver.feedback_gains()[t] - &gain).amax();
        assert!(
            error < 1e-9 * gain.amax().max(1.0),
            "stage {}: gain error {:.3e}",
            t,
            error
        );
    }
    Ok(())
}

#[test]
fn test_single_stage_lqr_matches_closed_form() -> TestResult {
    let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.0, 1.0]);
    let b = DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.2, 1.0]);
    let r = DMatrix::identity(2, 2) * 0.5;
    let q_terminal = DMatrix::from_diagonal(&DVector::from_vec(vec![10.0, 5.0]));
    let x0 = DVector::from_vec(vec![1.0, 0.0]);

    let running: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::new(
        a.clone(),
        b.clone(),
        DMatrix::identity(2, 2),
        r.clone(),
    )?);
    let terminal: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::terminal(q_terminal.clone())?);
    let mut problem = ShootingProblem::new(x0.clone(), vec![running], terminal)?;

    let result = Fddp::new().solve(&mut problem, None, None, false, None)?;
    assert!(result.converged);

    let hessian = &r + b.transpose() * &q_terminal * &b;
    let u_star = -(hessian.try_inverse().ok_or("singular")? * b.transpose() * &q_terminal * &a * &x0);
    let x_star = &a * &x0 + &b * &u_star;

    assert!((&result.trajectory.us[0] - &u_star).amax() < 1e-8);
    assert!((&result.trajectory.xs[1] - &x_star).amax() < 1e-8);

    let optimal_cost = 0.5 * x0.norm_squared()
        + 0.5 * u_star.dot(&(&r * &u_star))
        + 0.5 * x_star.dot(&(&q_terminal * &x_star));
    assert!((result.final_cost - optimal_cost).abs() < 1e-6);
    assert_eq!(result.trajectory.xs[0], x0);
    Ok(())
}

#[test]
fn test_infeasible_lqr_start_closes_gaps() -> TestResult {
    let mut problem = double_integrator(20)?;
    let x0 = problem.x0().clone();
    let xs = vec![DVector::from_vec(vec![5.0, 5.0]); 21];
    let us = vec![DVector::zeros(1); 20];

    let mut solver = Fddp::new();
    let result = solver.solve(&mut problem, Some(&xs), Some(&us), false, None)?;

    assert!(result.converged);
    assert_eq!(result.step_lengths, vec![1.0]);
    assert!(solver.is_feasible());
    assert!(result.max_gap() < 1e-12);
    assert_eq!(result.trajectory.xs[0], x0);
    assert_eq!(problem.x0(), &x0);
    Ok(())
}

#[test]
fn test_infeasible_unicycle_start_closes_gaps() -> TestResult {
    let horizon = 20;
    let mut problem = unicycle_problem(horizon, false)?;
    let x0 = problem.x0().clone();
    let xs: Vec<DVector<f64>> = (0..=horizon)
        .map(|t| &x0 * (1.0 - t as f64 / horizon as f64))
        .collect();

    let mut solver = Fddp::with_config(FddpConfig::new().with_max_iterations(200));
    let result = solver.solve(&mut problem, Some(&xs), None, false, None)?;

    assert!(result.converged);
    assert!(result.max_gap() < 1e-10);
    assert!(result.step_lengths.contains(&1.0));

    // the returned trajectory is a rollout of its own controls
    let rollout = problem.rollout(&result.trajectory.us)?;
    for (x, y) in rollout.iter().zip(&result.trajectory.xs) {
        assert!((x - y).amax() < 1e-10);
    }
    Ok(())
}

#[test]
fn test_feasible_solve_never_increases_cost() -> TestResult {
    let mut problem = unicycle_problem(30, false)?;
    let history = HistoryObserver::new();
    let mut solver = Fddp::new();
    solver.add_observer(history.clone());

    let result = solver.solve(&mut problem, None, None, true, None)?;
    assert!(result.converged);

    let mut previous = result.initial_cost;
    for metrics in history.metrics()? {
        assert!(metrics.cost <= previous + 1e-12);
        if !metrics.accepted {
            assert_eq!(metrics.cost, previous);
        }
        previous = metrics.cost;
    }
    assert_eq!(previous, result.final_cost);
    Ok(())
}

#[test]
fn test_pendulum_swing_up_from_quasi_static_guess() -> TestResult {
    let horizon = 100;
    let running: Arc<dyn ActionModel> = Arc::new(ActionModelPendulum::new());
    let terminal: Arc<dyn ActionModel> =
        Arc::new(ActionModelPendulum::new().with_cost_weights(100.0, 10.0, 0.0));
    let x0 = StateSO2::from_angle(0.5, 0.0);
    let mut problem = ShootingProblem::new(x0.clone(), vec![running; horizon], terminal)?;

    // holding the pendulum still at its initial angle is a feasible guess
    let xs = vec![x0.clone(); horizon + 1];
    let us = problem.quasi_static_controls(&xs, 20, 1e-12)?;
    assert!((us[0][0] - 9.81 * 0.5f64.sin()).abs() < 1e-8);
    problem.calc(&xs, &us)?;
    assert!(problem.feasibility_gaps(&xs)?.iter().all(|g| g.norm() < 1e-9));

    let history = HistoryObserver::new();
    let mut solver = Fddp::with_config(FddpConfig::new().with_max_iterations(300));
    solver.add_observer(history.clone());
    let result = solver.solve(&mut problem, Some(&xs), Some(&us), true, None)?;

    assert!(result.final_cost < 0.5 * result.initial_cost);
    assert!(result.max_gap() < 1e-12);
    let costs = history.costs()?;
    for pair in costs.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-12);
    }

    // the final state is close to upright
    let final_state = result.trajectory.final_state().ok_or("empty trajectory")?;
    assert!(StateSO2::angle(final_state).abs() > 2.0);
    Ok(())
}

#[test]
fn test_regularization_stays_within_bounds() -> TestResult {
    let config = FddpConfig::new().with_regularization_bounds(1e-6, 1e2);
    let mut problem = unicycle_problem(25, false)?;
    let history = HistoryObserver::new();
    let mut solver = Fddp::with_config(config);
    solver.add_observer(history.clone());

    solver.solve(&mut problem, None, None, true, Some(1e4))?;
    for metrics in history.metrics()? {
        assert!(metrics.preg >= 1e-6 && metrics.preg <= 1e2);
        assert!(metrics.ureg >= 1e-6 && metrics.ureg <= 1e2);
    }
    let (preg, ureg) = solver.regularization();
    assert!((1e-6..=1e2).contains(&preg));
    assert!((1e-6..=1e2).contains(&ureg));
    Ok(())
}

#[test]
fn test_regularization_saturation_stops_without_convergence() -> TestResult {
    let mut problem = concave_problem(5)?;
    let config = FddpConfig::new().with_regularization_bounds(1e-9, 0.1);
    let mut solver = Fddp::with_config(config);

    let result = solver.solve(&mut problem, None, None, true, None)?;
    assert_eq!(result.status, OptimizationStatus::RegularizationSaturated);
    assert!(!result.converged);
    // each failed backward pass uses up one iteration while the regularization climbs
    assert!(result.iterations >= 8);
    assert_eq!(result.step_lengths, vec![0.0; result.iterations]);
    assert_eq!(solver.regularization(), (0.1, 0.1));
    assert_eq!(result.final_cost, result.initial_cost);
    Ok(())
}

#[test]
fn test_malformed_guess_leaves_problem_untouched() -> TestResult {
    let mut problem = unicycle_problem(10, false)?;
    let us = vec![DVector::from_vec(vec![0.2, 0.1]); 10];
    let xs = problem.rollout(&us)?;
    problem.calc(&xs, &us)?;
    let before = problem.running_datas().to_vec();
    let terminal_before = problem.terminal_data().clone();

    let mut solver = Fddp::new();

    let short_xs = &xs[..10];
    let result = solver.solve(&mut problem, Some(short_xs), Some(&us), true, None);
    assert!(matches!(
        result,
        Err(ApexDdpError::Core(CoreError::DimensionMismatch(_)))
    ));

    for len in [9, 11] {
        let us_wrong_length = vec![DVector::from_vec(vec![0.2, 0.1]); len];
        let result = solver.solve(&mut problem, Some(&xs), Some(&us_wrong_length), true, None);
        assert!(matches!(
            result,
            Err(ApexDdpError::Core(CoreError::DimensionMismatch(_)))
        ));
    }

    let wide_us = vec![DVector::zeros(3); 10];
    let result = solver.solve(&mut problem, None, Some(&wide_us), true, None);
    assert!(matches!(
        result,
        Err(ApexDdpError::Core(CoreError::DimensionMismatch(_)))
    ));

    assert_eq!(problem.running_datas(), before.as_slice());
    assert_eq!(problem.terminal_data(), &terminal_before);
    Ok(())
}

#[test]
fn test_parallel_and_sequential_solves_agree() -> TestResult {
    let mut sequential = unicycle_problem(50, false)?;
    let mut parallel = unicycle_problem(50, true)?;

    let a = Fddp::new().solve(&mut sequential, None, None, true, None)?;
    let b = Fddp::new().solve(&mut parallel, None, None, true, None)?;

    assert_eq!(a.trajectory, b.trajectory);
    assert_eq!(a.final_cost.to_bits(), b.final_cost.to_bits());
    assert_eq!(a.iterations, b.iterations);
    assert_eq!(a.step_lengths, b.step_lengths);
    Ok(())
}

#[test]
fn test_non_finite_derivatives_report_last_valid_trajectory() -> TestResult {
    let model: Arc<dyn ActionModel> = Arc::new(BrokenDerivatives {
        state: Arc::new(StateVector::new(1)),
    });
    let x0 = DVector::from_element(1, 2.0);
    let mut problem = ShootingProblem::new(x0.clone(), vec![model.clone(); 4], model)?;

    let result = Fddp::new().solve(&mut problem, None, None, false, None);
    match result {
        Err(ApexDdpError::Optimizer(OptimizerError::InvalidNumericValue {
            last_valid, ..
        })) => {
            assert_eq!(last_valid.horizon(), 4);
            assert_eq!(last_valid.xs[0], x0);
            assert!(last_valid.us.iter().all(|u| u[0] == 0.0));
        }
        other => panic!("Expected InvalidNumericValue, got {:?}", other.map(|r| r.status)),
    }
    Ok(())
}

#[test]
fn test_finite_difference_model_reaches_same_optimum() -> TestResult {
    let horizon = 20;
    let analytic: Arc<dyn ActionModel> = Arc::new(ActionModelUnicycle::new());
    let numeric: Arc<dyn ActionModel> = Arc::new(ActionModelNumDiff::new(analytic.clone()));
    let x0 = DVector::from_vec(vec![-1.0, -1.0, 1.0]);

    let mut exact = ShootingProblem::new(x0.clone(), vec![analytic.clone(); horizon], analytic)?;
    let mut approx = ShootingProblem::new(x0, vec![numeric.clone(); horizon], numeric)?;

    let config = FddpConfig::new().with_max_iterations(200);
    let a = Fddp::with_config(config.clone()).solve(&mut exact, None, None, true, None)?;
    let b = Fddp::with_config(config).solve(&mut approx, None, None, true, None)?;

    assert!(a.converged);
    assert!((a.final_cost - b.final_cost).abs() < 1e-4 * a.final_cost);
    Ok(())
}
