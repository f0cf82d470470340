//! Parameter blocks: a value on a manifold plus a constant flag.

use crate::core::{CoreError, CoreResult};
use crate::manifold::{Manifold, check_global};
use nalgebra::DVector;
use std::sync::Arc;

/// Tolerance used when validating values after normalization.
pub const VALIDITY_TOLERANCE: f64 = 1e-6;

/// One optimization variable.
///
/// The value is stored in the manifold's global representation. Constant blocks keep their
/// value for the whole run and take no columns in the linear system.
#[derive(Debug, Clone)]
pub struct ParameterBlock {
    id: usize,
    value: DVector<f64>,
    manifold: Arc<dyn Manifold>,
    constant: bool,
}

impl ParameterBlock {
    /// Create a block, normalizing and validating `value` against `manifold`.
    pub fn new(id: usize, value: DVector<f64>, manifold: Arc<dyn Manifold>) -> CoreResult<Self> {
        let value = Self::validated(id, &value, manifold.as_ref())?;
        Ok(Self {
            id,
            value,
            manifold,
            constant: false,
        })
    }

    fn validated(id: usize, value: &DVector<f64>, manifold: &dyn Manifold) -> CoreResult<DVector<f64>> {
        check_global(manifold, value).map_err(|e| {
            CoreError::InvalidInput(format!("parameter block {id}: {e}")).log()
        })?;
        let normalized = manifold.normalize(value).map_err(|e| {
            CoreError::InvalidInput(format!("parameter block {id}: {e}")).log()
        })?;
        if !manifold.is_valid(&normalized, VALIDITY_TOLERANCE) {
            return Err(CoreError::InvalidInput(format!(
                "parameter block {id}: value is not on its manifold"
            ))
            .log());
        }
        Ok(normalized)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn value(&self) -> &DVector<f64> {
        &self.value
    }

    pub fn manifold(&self) -> &Arc<dyn Manifold> {
        &self.manifold
    }

    pub fn dimension_global(&self) -> usize {
        self.manifold.dimension_global()
    }

    pub fn dimension_local(&self) -> usize {
        self.manifold.dimension_local()
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub(crate) fn set_constant(&mut self, constant: bool) {
        self.constant = constant;
    }

    /// Replace the value, with the same validation as on construction.
    pub fn set_value(&mut self, value: &DVector<f64>) -> CoreResult<()> {
        self.value = Self::validated(self.id, value, self.manifold.as_ref())?;
        Ok(())
    }

    /// Candidate value `x ⊞ δ`. The block itself is not modified.
    pub fn updated_value(&self, delta: &DVector<f64>) -> CoreResult<DVector<f64>> {
        if delta.len() != self.dimension_local() {
            return Err(CoreError::DimensionMismatch(format!(
                "update for parameter block {} has length {}, expected {}",
                self.id,
                delta.len(),
                self.dimension_local()
            ))
            .log());
        }
        Ok(self.manifold.apply_update(&self.value, delta))
    }

    /// Overwrite the value with an already-validated candidate.
    pub(crate) fn commit(&mut self, value: DVector<f64>) {
        debug_assert_eq!(value.len(), self.dimension_global());
        self.value = value;
    }

    /// Reset to the manifold's origin (identity rotation / zero vector).
    pub fn reset_to_origin(&mut self) {
        self.value = self.manifold.origin();
    }
}
