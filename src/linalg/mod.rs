//! Linear algebra: block-sparse normal equations and the solvers that factor them.
//!
//! Every iteration solves
//!
//! ```text
//! (H + λ·D) δ = −g
//! ```
//!
//! where `H = Σ JᵢᵀJⱼ` and `g = Σ Jᵢᵀr` are assembled by [`assembler`] from the whitened,
//! robustified residual blocks, and `λ·D` is the damping chosen by the step policy
//! ([`Damping`]).
//!
//! Two backends implement [`LinearSolver`]:
//! - [`BlockCholeskySolver`] (default): right-looking block Cholesky directly on the
//!   [`BlockSparseMatrix`], natural block order; singular pivots name the parameter block
//! - [`SparseCholeskySolver`]: faer's supernodal/simplicial sparse LLᵀ on a scalar CSC copy

pub mod assembler;
pub mod block_cholesky;
pub mod block_sparse;
pub mod cholesky;

pub use assembler::{BlockLayout, LinearSystem};
pub use block_cholesky::BlockCholeskySolver;
pub use block_sparse::BlockSparseMatrix;
pub use cholesky::SparseCholeskySolver;

use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    BlockCholesky,
    SparseCholesky,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::BlockCholesky => write!(f, "Block Cholesky"),
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix; `block` names the parameter block whose pivot failed
    #[error("Singular matrix detected{}", block_suffix(.block))]
    SingularMatrix { block: Option<usize> },

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Operand sizes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

fn block_suffix(block: &Option<usize>) -> String {
    block
        .map(|id| format!(" at parameter block {id}"))
        .unwrap_or_default()
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Diagonal term added to `H` before factoring.
#[derive(Debug, Clone, Copy)]
pub enum Damping<'a> {
    /// Plain Gauss-Newton system
    None,
    /// `H + λ·I`
    Identity(f64),
    /// `H + λ·diag(d)`
    Diagonal(f64, &'a DVector<f64>),
}

impl Damping<'_> {
    /// Amount added to diagonal entry `index`.
    pub fn shift(&self, index: usize) -> f64 {
        match self {
            Damping::None => 0.0,
            Damping::Identity(lambda) => *lambda,
            Damping::Diagonal(lambda, diagonal) => lambda * diagonal[index],
        }
    }

    /// Quadratic form `δᵀ D δ` of the damping matrix without λ.
    pub fn weighted_norm_squared(&self, delta: &DVector<f64>) -> f64 {
        match self {
            Damping::None => 0.0,
            Damping::Identity(_) => delta.norm_squared(),
            Damping::Diagonal(_, diagonal) => delta
                .iter()
                .zip(diagonal.iter())
                .map(|(x, d)| d * x * x)
                .sum(),
        }
    }
}

/// Solver for the (damped) normal equations.
pub trait LinearSolver: Send {
    /// Solve `(H + λ·D) δ = −g`.
    ///
    /// # Errors
    /// `SingularMatrix` if the damped system is not positive definite, `DimensionMismatch`
    /// if `gradient` does not match `hessian`.
    fn solve(
        &mut self,
        hessian: &BlockSparseMatrix,
        gradient: &DVector<f64>,
        damping: Damping<'_>,
    ) -> LinAlgResult<DVector<f64>>;

    fn solver_type(&self) -> LinearSolverType;
}

/// Instantiate the backend for `solver_type`.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn LinearSolver> {
    match solver_type {
        LinearSolverType::BlockCholesky => Box::new(BlockCholeskySolver::new()),
        LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
    }
}
