use std::sync::Arc;

use apex_ddp::core::action::ActionModel;
use apex_ddp::core::problem::ShootingProblem;
use apex_ddp::init_logger;
use apex_ddp::manifold::StateSO2;
use apex_ddp::models::{ActionModelLqr, ActionModelPendulum, ActionModelUnicycle};
use apex_ddp::observers::VerboseObserver;
use apex_ddp::optimizer::{Fddp, FddpConfig, SolverResult};
use clap::{Parser, ValueEnum};
use nalgebra::DVector;
use tracing::{info, warn};
use web_time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProblemKind {
    /// Random linear-quadratic regulator
    Lqr,
    /// Unicycle parking manoeuvre
    Unicycle,
    /// Pendulum swing-up on SO(2)
    Pendulum,
}

#[derive(Parser)]
#[command(name = "fddp_benchmark")]
#[command(about = "Time shooting-problem evaluation and FDDP solves on reference problems")]
struct Args {
    /// Problem to benchmark
    #[arg(short, long, value_enum, default_value = "lqr")]
    problem: ProblemKind,

    /// Number of running stages
    #[arg(long, default_value = "100")]
    horizon: usize,

    /// Number of timed repetitions per measurement
    #[arg(short, long, default_value = "100")]
    trials: usize,

    /// Iteration budget per solve
    #[arg(short, long, default_value = "100")]
    max_iterations: usize,

    /// State dimension of the LQR problem
    #[arg(long, default_value = "37")]
    nx: usize,

    /// Control dimension of the LQR problem
    #[arg(long, default_value = "12")]
    nu: usize,

    /// Evaluate stages on the rayon pool
    #[arg(long)]
    parallel: bool,

    /// Print the per-iteration table of the first solve
    #[arg(short, long)]
    verbose: bool,
}

/// Min, mean and max of a set of durations in milliseconds.
struct Timing {
    min: f64,
    mean: f64,
    max: f64,
}

impl Timing {
    fn from_samples(samples: &[f64]) -> Self {
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = samples.iter().sum::<f64>() / samples.len().max(1) as f64;
        Timing { min, mean, max }
    }

    fn report(&self, label: &str) {
        info!(
            "  {:<28} {:>10.4} ms ({:.4} - {:.4})",
            label, self.mean, self.min, self.max
        );
    }
}

fn time_trials<F>(trials: usize, mut f: F) -> Result<Timing, apex_ddp::ApexDdpError>
where
    F: FnMut() -> Result<(), apex_ddp::ApexDdpError>,
{
    let mut samples = Vec::with_capacity(trials);
    for _ in 0..trials {
        let start = Instant::now();
        f()?;
        samples.push(start.elapsed().as_secs_f64() * 1000.0);
    }
    Ok(Timing::from_samples(&samples))
}

fn build_problem(args: &Args) -> Result<ShootingProblem, apex_ddp::ApexDdpError> {
    let horizon = args.horizon;
    let problem = match args.problem {
        ProblemKind::Lqr => {
            let running: Arc<dyn ActionModel> =
                Arc::new(ActionModelLqr::random(args.nx, args.nu, false));
            let terminal: Arc<dyn ActionModel> =
                Arc::new(ActionModelLqr::random(args.nx, 0, false));
            ShootingProblem::new(DVector::zeros(args.nx), vec![running; horizon], terminal)?
        }
        ProblemKind::Unicycle => {
            let model: Arc<dyn ActionModel> = Arc::new(ActionModelUnicycle::new());
            ShootingProblem::new(
                DVector::from_vec(vec![-1.0, -1.0, 1.0]),
                vec![model.clone(); horizon],
                model,
            )?
        }
        ProblemKind::Pendulum => {
            let running: Arc<dyn ActionModel> = Arc::new(ActionModelPendulum::new());
            let terminal: Arc<dyn ActionModel> =
                Arc::new(ActionModelPendulum::new().with_cost_weights(100.0, 10.0, 0.0));
            ShootingProblem::new(
                StateSO2::from_angle(0.0, 0.0),
                vec![running; horizon],
                terminal,
            )?
        }
    };
    Ok(problem.with_parallel(args.parallel))
}

fn log_result(result: &SolverResult) {
    info!(
        "  status: {}, iterations: {}, cost: {:.6e} -> {:.6e}, max gap: {:.2e}",
        result.status,
        result.iterations,
        result.initial_cost,
        result.final_cost,
        result.max_gap()
    );
    if let Some(info) = &result.convergence_info {
        info!("  {}", info);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let args = Args::parse();

    if args.parallel && !cfg!(feature = "parallel") {
        warn!("Built without the `parallel` feature, stages are evaluated sequentially");
    }
    let mut problem = build_problem(&args)?;
    info!(
        "Problem: {:?}, horizon: {}, nx: {}, nu: {}, trials: {}",
        args.problem,
        problem.horizon(),
        problem.x0().len(),
        problem.running_models().first().map_or(0, |m| m.nu()),
        args.trials
    );

    let config = FddpConfig::new().with_max_iterations(args.max_iterations);
    let mut solver = Fddp::with_config(config.clone());
    if args.verbose {
        solver.add_observer(VerboseObserver::new());
    }
    let first = solver.solve(&mut problem, None, None, false, None)?;
    log_result(&first);

    let xs = first.trajectory.xs.clone();
    let us = first.trajectory.us.clone();

    let mut quiet = Fddp::with_config(config);
    let solve = time_trials(args.trials, || {
        quiet.solve(&mut problem, None, None, false, None)?;
        Ok(())
    })?;
    solve.report("Fddp::solve");

    let calc = time_trials(args.trials, || {
        problem.calc(&xs, &us)?;
        Ok(())
    })?;
    calc.report("ShootingProblem::calc");

    let calc_diff = time_trials(args.trials, || {
        problem.calc_diff(&xs, &us)?;
        Ok(())
    })?;
    calc_diff.report("ShootingProblem::calc_diff");

    Ok(())
}
