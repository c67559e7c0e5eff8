//! # Apex DDP
//!
//! A Rust library for discrete-time trajectory optimization with feasibility-driven
//! differential dynamic programming (FDDP).
//!
//! A problem is a chain of action models, each mapping a state and a control to the
//! next state and a stage cost. The solver finds a state/control trajectory that
//! locally minimizes the total cost subject to the dynamics, starting from either a
//! feasible rollout or an arbitrary (infeasible) guess.
//!
//! ## Features
//!
//! - **FDDP solver**: Riccati backward pass with gap terms, feasibility-driven forward
//!   rollout, line search and adaptive regularization
//! - **Pluggable stages**: implement [`ActionModel`] for your dynamics and cost, or wrap
//!   a `calc`-only model in [`ActionModelNumDiff`]
//! - **Manifold states**: derivatives are taken in tangent space through
//!   [`StateManifold`], so states like angles on SO(2) are handled without wrapping
//! - **Parallel evaluation**: stage evaluations run on rayon with the `parallel`
//!   feature, with results identical to sequential evaluation
//! - **Observers**: per-iteration callbacks for logging and recording
//!
//! ## Example
//!
//! ```
//! use apex_ddp::{ActionModel, ActionModelLqr, Fddp, ShootingProblem};
//! use nalgebra::DVector;
//! use std::sync::Arc;
//! # fn example() -> apex_ddp::ApexDdpResult<()> {
//!
//! let running: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::random(4, 2, true));
//! let terminal: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::random(4, 0, true));
//! let mut problem = ShootingProblem::new(DVector::from_element(4, 1.0), vec![running; 30], terminal)?;
//!
//! let result = Fddp::new().solve(&mut problem, None, None, false, None)?;
//! assert!(result.converged);
//! assert_eq!(result.accepted_iterations(), 1);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod core;
pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod models;
pub mod observers;
pub mod optimizer;

// Re-export core types
pub use core::action::{ActionData, ActionModel};
pub use core::numdiff::ActionModelNumDiff;
pub use core::problem::ShootingProblem;
pub use error::{ApexDdpError, ApexDdpResult};

pub use linalg::DenseCholeskySolver;
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{StateManifold, StateSO2, StateVector};
pub use models::{ActionModelLqr, ActionModelPendulum, ActionModelUnicycle};
pub use observers::{HistoryObserver, IterationMetrics, VerboseObserver};
pub use optimizer::{
    Fddp, FddpConfig, OptObserver, OptObserverVec, OptimizationStatus, SolverResult, Trajectory,
};
