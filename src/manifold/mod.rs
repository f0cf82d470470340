//! Manifold parameterizations for parameter blocks.
//!
//! A parameter block stores its value in a *global* (ambient) representation of size
//! `dimension_global()` and is updated through a *local* tangent vector of size
//! `dimension_local()`:
//!
//! Manifold      | global value             | D_global | D_local | x ⊞ δ
//! ------------- | ------------------------ | -------- | ------- | -------------------------
//! Rⁿ            | v ∈ Rⁿ                   | n        | n       | v + δ
//! SO(3)         | q = [qx, qy, qz, qw]     | 4        | 3       | q ⊗ Exp(δ), renormalized
//! Pose (R, p)   | [qx, qy, qz, qw, px, py, pz] | 7    | 6       | (R·Exp(δθ), p + δp)
//!
//! Rotations use the right perturbation model, so the tangent vector of a rotation lives
//! in the body frame. Residuals compute their Jacobians in the same local coordinates
//! (see [`crate::factors`]), which keeps the linear system at `D_local` columns per block.
//!
//! The composite pose block is a [`ProductManifold`] whose part order is part of its
//! contract: `[rotation, translation]`. Jacobians and updates must agree on it.

use nalgebra::DVector;
use std::fmt::{self, Debug, Display, Formatter};

pub mod euclidean;
pub mod pose3;
pub mod product;
pub mod so3;

pub use euclidean::Euclidean;
pub use pose3::Pose3;
pub use product::ProductManifold;
pub use so3::{QuaternionManifold, SO3};

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifoldError {
    /// Vector length does not match the manifold's global or local size
    DimensionMismatch { expected: usize, actual: usize },
    /// NaN or Inf detected in a manifold element
    InvalidNumber,
    /// Normalization failed for manifold element
    NormalizationFailed(String),
}

impl Display for ManifoldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldError::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {expected}, got {actual}")
            }
            ManifoldError::InvalidNumber => {
                write!(f, "Invalid number: NaN or Inf detected")
            }
            ManifoldError::NormalizationFailed(msg) => {
                write!(f, "Normalization failed: {msg}")
            }
        }
    }
}

impl std::error::Error for ManifoldError {}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Kind tag for the manifolds shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldType {
    Euclidean,
    SO3,
    Pose3,
    Product,
}

/// Local parameterization of a parameter block.
///
/// Implementations must be pure: `apply_update` never mutates the manifold itself, so a
/// single instance can be shared (`Arc<dyn Manifold>`) by many blocks and evaluated from
/// several threads at once.
pub trait Manifold: Send + Sync + Debug {
    /// Size of the stored value.
    fn dimension_global(&self) -> usize;

    /// Size of the tangent space (degrees of freedom).
    fn dimension_local(&self) -> usize;

    /// Compose a tangent update onto a value: `x ⊞ δ`.
    ///
    /// `x` has length `dimension_global()` and `delta` has length `dimension_local()`.
    /// A zero `delta` must return `x` unchanged.
    fn apply_update(&self, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64>;

    /// Identity element (rotations) or origin (vector spaces), used on reset.
    fn origin(&self) -> DVector<f64>;

    /// Project a value onto the manifold (e.g. renormalize a quaternion).
    fn normalize(&self, x: &DVector<f64>) -> ManifoldResult<DVector<f64>> {
        Ok(x.clone())
    }

    /// Check that a value lies on the manifold within `tolerance`.
    fn is_valid(&self, x: &DVector<f64>, tolerance: f64) -> bool;

    fn manifold_type(&self) -> ManifoldType;
}

/// Validate length and finiteness of a global value.
pub fn check_global(manifold: &dyn Manifold, x: &DVector<f64>) -> ManifoldResult<()> {
    if x.len() != manifold.dimension_global() {
        return Err(ManifoldError::DimensionMismatch {
            expected: manifold.dimension_global(),
            actual: x.len(),
        });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(ManifoldError::InvalidNumber);
    }
    Ok(())
}
