//! # lsq-graph
//!
//! Nonlinear least-squares optimization over graphs of manifold-valued parameter blocks.
//!
//! A [`Problem`] holds parameter blocks (each a point on a [`manifold`]: Euclidean space,
//! unit quaternions or 3D poses) and residual blocks connecting them. The
//! [`TrustRegionOptimizer`] minimizes
//!
//! ```text
//! F(x) = Σ_i ρ_i(‖S_i r_i(x)‖²)
//! ```
//!
//! by repeatedly linearizing, assembling the block-sparse normal equations, solving them and
//! applying the step on each block's manifold.
//!
//! ## Features
//!
//! - **Strategies**: Levenberg-Marquardt, Gauss-Newton with backtracking, Powell dogleg
//! - **Linear solvers**: native block Cholesky, or faer's supernodal sparse Cholesky
//! - **Robust losses**: Huber, Cauchy, Tukey biweight
//! - **Parallel assembly** with rayon (feature `parallel`)
//! - **g2o and pose file I/O** (feature `io`)
//!
//! ## Example
//!
//! ```
//! use lsq_graph::{OptimizerConfig, Problem, TrustRegionOptimizer};
//! use lsq_graph::factors::RelativePoseResidual;
//! use lsq_graph::manifold::Pose3;
//! use nalgebra::{Matrix6, UnitQuaternion, Vector3};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut problem = Problem::new();
//! let a = problem.add_pose_block(&Pose3::identity())?;
//! let b = problem.add_pose_block(&Pose3::new(
//!     UnitQuaternion::identity(),
//!     Vector3::new(0.8, 0.1, 0.0),
//! ))?;
//! problem.set_constant(a)?;
//!
//! let measurement = Pose3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));
//! problem.add_residual(
//!     &[a, b],
//!     Box::new(RelativePoseResidual::new(measurement, Matrix6::identity())),
//! )?;
//!
//! let summary = TrustRegionOptimizer::new(OptimizerConfig::new()).optimize(&mut problem)?;
//! assert!(summary.final_cost < 1e-10);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod factors;
#[cfg(feature = "io")]
pub mod io;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod optimizer;

pub use crate::core::{
    loss_functions::{CauchyLoss, HuberLoss, L2Loss, LossFunction, TukeyBiweightLoss},
    pose_graph::{PoseConstraint, PoseGraph},
    problem::Problem,
    residual_block::NumericalFailurePolicy,
};
pub use error::{LsqError, LsqResult};
pub use factors::{CurveResidual, PriorResidual, RelativePoseResidual, Residual};
pub use linalg::{BlockCholeskySolver, LinearSolver, LinearSolverType, SparseCholeskySolver};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{Euclidean, Manifold, Pose3, ProductManifold, QuaternionManifold};
pub use optimizer::{
    OptimizerConfig, OptimizerError, SolverState, SolverSummary, Strategy, TrustRegionOptimizer,
};
