//! Trajectory optimization solvers.
//!
//! This module holds the types shared by solvers (trajectories, results, statuses
//! and errors) and the feasibility-driven DDP solver in [`fddp`].

use crate::core::{CoreError, CoreResult};
use crate::linalg;
use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

pub mod fddp;

pub use fddp::{Fddp, FddpConfig};

// Re-export observer types from the observers module
pub use crate::observers::{OptObserver, OptObserverVec};

/// Optimizer-specific error types for apex-ddp
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Invalid solver parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// NaN or Inf in the cost or derivatives of an accepted trajectory
    #[error("Invalid numeric value: {message}")]
    InvalidNumericValue {
        message: String,
        /// Last trajectory whose evaluation was finite
        last_valid: Box<Trajectory>,
    },

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// State and control sequences over a horizon of N stages.
///
/// `xs` holds N + 1 states and `us` holds N controls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub xs: Vec<DVector<f64>>,
    pub us: Vec<DVector<f64>>,
}

impl Trajectory {
    /// Build a trajectory, checking that there is one more state than controls.
    pub fn new(xs: Vec<DVector<f64>>, us: Vec<DVector<f64>>) -> CoreResult<Self> {
        if xs.len() != us.len() + 1 {
            return Err(CoreError::DimensionMismatch(format!(
                "trajectory has {} states and {} controls",
                xs.len(),
                us.len()
            )));
        }
        Ok(Trajectory { xs, us })
    }

    /// Number of stages N.
    pub fn horizon(&self) -> usize {
        self.us.len()
    }

    pub fn final_state(&self) -> Option<&DVector<f64>> {
        self.xs.last()
    }
}

/// Detailed convergence information.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// Σ‖Qu‖² from the last backward pass
    pub final_stop: f64,
    /// First-order expected improvement d1 from the last backward pass
    pub final_expected_improvement: f64,
    /// State and control regularization at exit
    pub final_regularization: (f64, f64),
    /// Sum of gap norms of the returned trajectory
    pub final_feasibility: f64,
    /// Number of full `calc` sweeps, line-search candidates included
    pub calc_evaluations: usize,
    /// Number of full `calc_diff` sweeps
    pub calc_diff_evaluations: usize,
    /// Iterations whose line search accepted no step
    pub rejected_iterations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final stop: {:.2e}, Expected improvement: {:.2e}, Regularization: ({:.1e}, {:.1e}), Feasibility: {:.2e}, Calc evaluations: {}, CalcDiff evaluations: {}, Rejected iterations: {}",
            self.final_stop,
            self.final_expected_improvement,
            self.final_regularization.0,
            self.final_regularization.1,
            self.final_feasibility,
            self.calc_evaluations,
            self.calc_diff_evaluations,
            self.rejected_iterations
        )
    }
}

/// Status of a solve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Feasible and Σ‖Qu‖² below `th_stop`
    Converged,
    /// Feasible and expected improvement below `th_grad`
    GradientToleranceReached,
    /// Iteration budget exhausted
    MaxIterationsReached,
    /// Wall-clock budget exhausted
    Timeout,
    /// Regularization reached its upper bound without producing an acceptable step
    RegularizationSaturated,
}

impl OptimizationStatus {
    /// True for the statuses that mean a local optimum was found.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::RegularizationSaturated => {
                write!(f, "Regularization saturated")
            }
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Final trajectory
    pub trajectory: Trajectory,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Shorthand for `status.is_converged()`
    pub converged: bool,
    /// Cost of the initial trajectory
    pub initial_cost: f64,
    /// Cost of the final trajectory
    pub final_cost: f64,
    /// Number of completed iterations (accepted or rejected)
    pub iterations: usize,
    /// Step length per iteration; 0.0 marks a rejected iteration
    pub step_lengths: Vec<f64>,
    /// Feasibility gaps of the final trajectory, one per state
    pub gaps: Vec<DVector<f64>>,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
}

impl SolverResult {
    /// Number of iterations whose step was accepted.
    pub fn accepted_iterations(&self) -> usize {
        self.step_lengths.iter().filter(|&&alpha| alpha > 0.0).count()
    }

    /// Largest gap norm of the final trajectory.
    pub fn max_gap(&self) -> f64 {
        self.gaps.iter().map(|g| g.norm()).fold(0.0, f64::max)
    }
}
