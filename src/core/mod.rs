//! Problem construction: parameter blocks, residual blocks and the problem graph.
//!
//! - [`problem::Problem`] owns parameter blocks and residual blocks in two arenas addressed
//!   by stable integer ids
//! - [`residual_block::ResidualBlock`] whitens, robustifies and checks one residual
//! - [`loss_functions`] and [`corrector`] implement robust losses
//! - [`pose_graph::PoseGraph`] is the plain-data input for 3D pose-graph problems

pub mod corrector;
pub mod loss_functions;
pub mod parameter_block;
pub mod pose_graph;
pub mod problem;
pub mod residual_block;

use thiserror::Error;
use tracing::error;

/// Errors raised while building or evaluating a problem.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A parameter block id that does not exist in the problem
    #[error("Unknown parameter block id {id}")]
    UnknownBlock { id: usize },

    /// Dimension mismatch between residual, Jacobian, information matrix or value
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A residual or Jacobian evaluated to NaN or Inf
    #[error("Numerical failure in residual block {residual}: {message}")]
    NumericalFailure { residual: usize, message: String },

    /// Loss function error
    #[error("Loss function error: {0}")]
    LossFunction(String),

    /// Parallel computation error
    #[error("Parallel computation error: {0}")]
    ParallelComputation(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// problem.parameter_block(id)
    ///     .ok_or_else(|| CoreError::UnknownBlock { id }.log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error it was converted from
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
