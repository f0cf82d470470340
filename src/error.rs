//! Top-level error type of the crate.
//!
//! Each module has its own error enum; [`LsqError`] wraps them transparently so callers
//! that mix problem construction, optimization and file I/O can use one `?` type while
//! still matching on the module error:
//!
//! ```text
//! LsqError::Optimizer(
//!     OptimizerError::SingularSystem { iteration: 0, block: Some(0) }
//! )
//! ```

use crate::{
    core::CoreError, linalg::LinAlgError, manifold::ManifoldError, optimizer::OptimizerError,
};
#[cfg(feature = "io")]
use crate::io::IoError;
use std::error::Error as StdError;
use thiserror::Error;

/// Result type of the crate-level API.
pub type LsqResult<T> = Result<T, LsqError>;

#[derive(Debug, Error)]
pub enum LsqError {
    /// Problem construction and evaluation
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    #[error(transparent)]
    Manifold(#[from] ManifoldError),

    /// Graph and pose file reading/writing
    #[cfg(feature = "io")]
    #[error(transparent)]
    Io(#[from] IoError),
}

impl LsqError {
    /// The error and its sources, one per line.
    ///
    /// ```rust,ignore
    /// if let Err(e) = run() {
    ///     warn!("{}", e.chain());
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line form of [`chain`](Self::chain).
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
