//! Reference action models.
//!
//! These are small, self-contained stage models used by the tests, the benchmark
//! binary and as templates for user models:
//!
//! - [`ActionModelLqr`]: linear dynamics with a quadratic cost. DDP solves it exactly
//!   in one step, which makes it the reference for solver correctness.
//! - [`ActionModelUnicycle`]: nonholonomic planar vehicle, the classic nonlinear
//!   benchmark.
//! - [`ActionModelPendulum`]: torque-driven pendulum whose state lives on SO(2) × R,
//!   exercising the manifold-aware parts of the solver.
//!
//! Each model can be evaluated as a terminal stage by passing no control: the state
//! is left unchanged and only the state part of the cost is charged.

pub mod lqr;
pub mod pendulum;
pub mod unicycle;

pub use lqr::ActionModelLqr;
pub use pendulum::ActionModelPendulum;
pub use unicycle::ActionModelUnicycle;
