//! Observer pattern for solver monitoring.
//!
//! Observers registered with a solver are notified once per iteration, after the
//! line search has decided whether to accept the step. They are purely observational:
//! nothing an observer does can change the solver's behavior.
//!
//! ```text
//! ┌─────────────────┐
//! │      Fddp       │
//! └────────┬────────┘
//!          │ set_iteration_metrics(metrics), notify(trajectory, iteration)
//!          ├──────────────┬──────────────┐
//!          ▼              ▼              ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │ Verbose  │  │ History  │  │  Custom  │
//!    │ Observer │  │ Observer │  │ Observer │
//!    └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! # Custom Observer
//!
//! ```no_run
//! use apex_ddp::observers::{IterationMetrics, OptObserver};
//! use apex_ddp::optimizer::Trajectory;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct RejectionCounter {
//!     rejected: AtomicUsize,
//! }
//!
//! impl OptObserver for RejectionCounter {
//!     fn set_iteration_metrics(&self, metrics: &IterationMetrics) {
//!         if !metrics.accepted {
//!             self.rejected.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//!
//!     fn on_step(&self, _trajectory: &Trajectory, _iteration: usize) {}
//! }
//! ```

use crate::optimizer::Trajectory;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, Error)]
pub enum ObserverError {
    #[error("Mutex poisoned in {context}: {reason}")]
    MutexPoisoned { context: String, reason: String },
}

impl ObserverError {
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

pub type ObserverResult<T> = Result<T, ObserverError>;

/// Solver state reported once per iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationMetrics {
    /// Zero-based iteration index
    pub iteration: usize,
    /// Total cost of the current (accepted) trajectory
    pub cost: f64,
    /// Squared norm of the control gradients Σ‖Qu‖²
    pub stop: f64,
    /// First-order expected improvement d1
    pub expected_improvement: f64,
    /// Step length of the accepted step, or the last one tried when rejected
    pub step_length: f64,
    /// Whether the line search accepted a step
    pub accepted: bool,
    /// State regularization after the update
    pub preg: f64,
    /// Control regularization after the update
    pub ureg: f64,
    /// Sum of the gap norms ‖fs‖₁ of the current trajectory
    pub feasibility: f64,
}

/// Observer for solver progress.
pub trait OptObserver: Send {
    /// Called after each iteration with the current trajectory.
    ///
    /// Keep this fast; it runs on the solver thread.
    fn on_step(&self, trajectory: &Trajectory, iteration: usize);

    /// Called before `on_step` with the iteration metrics.
    fn set_iteration_metrics(&self, _metrics: &IterationMetrics) {
        // Default implementation does nothing
    }
}

/// Collection of observers, notified in registration order.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    #[inline]
    pub fn set_iteration_metrics(&self, metrics: &IterationMetrics) {
        for observer in &self.observers {
            observer.set_iteration_metrics(metrics);
        }
    }

    /// Notify all observers. A no-op when none are registered.
    #[inline]
    pub fn notify(&self, trajectory: &Trajectory, iteration: usize) {
        for observer in &self.observers {
            observer.on_step(trajectory, iteration);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// Prints one table row per iteration at info level, repeating the header every
/// ten rows.
#[derive(Debug, Default)]
pub struct VerboseObserver {
    rows: AtomicUsize,
}

impl VerboseObserver {
    pub fn new() -> Self {
        VerboseObserver {
            rows: AtomicUsize::new(0),
        }
    }

    fn print_header() {
        info!(
            "{:>4}  {:>12}  {:>10}  {:>10}  {:>9}  {:>9}  {:>7}  {:>10}",
            "iter", "cost", "stop", "grad", "preg", "ureg", "step", "feas"
        );
    }
}

impl OptObserver for VerboseObserver {
    fn set_iteration_metrics(&self, metrics: &IterationMetrics) {
        if self.rows.fetch_add(1, Ordering::Relaxed) % 10 == 0 {
            Self::print_header();
        }
        let step = if metrics.accepted {
            format!("{:.4}", metrics.step_length)
        } else {
            "reject".to_string()
        };
        info!(
            "{:>4}  {:>12.5e}  {:>10.3e}  {:>10.3e}  {:>9.3e}  {:>9.3e}  {:>7}  {:>10.3e}",
            metrics.iteration,
            metrics.cost,
            metrics.stop,
            -metrics.expected_improvement,
            metrics.preg,
            metrics.ureg,
            step,
            metrics.feasibility
        );
    }

    fn on_step(&self, _trajectory: &Trajectory, _iteration: usize) {}
}

/// Records every iteration's metrics for later inspection.
///
/// Clones share the same history, so keep one clone and hand the other to the solver.
#[derive(Debug, Clone, Default)]
pub struct HistoryObserver {
    metrics: Arc<Mutex<Vec<IterationMetrics>>>,
}

impl HistoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded metrics.
    pub fn metrics(&self) -> ObserverResult<Vec<IterationMetrics>> {
        let guard = self.metrics.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "HistoryObserver::metrics".to_string(),
                reason: e.to_string(),
            }
            .log()
        })?;
        Ok(guard.clone())
    }

    /// Cost after each iteration.
    pub fn costs(&self) -> ObserverResult<Vec<f64>> {
        Ok(self.metrics()?.iter().map(|m| m.cost).collect())
    }
}

impl OptObserver for HistoryObserver {
    fn set_iteration_metrics(&self, metrics: &IterationMetrics) {
        if let Ok(mut guard) = self.metrics.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "HistoryObserver::set_iteration_metrics".to_string(),
                reason: e.to_string(),
            }
            .log()
        }) {
            guard.push(metrics.clone());
        }
    }

    fn on_step(&self, _trajectory: &Trajectory, _iteration: usize) {}
}
