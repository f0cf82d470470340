//! Cartesian products of manifolds.
//!
//! Global values and tangent vectors of a product are the concatenations of the parts, in
//! part order. Each part is updated independently with its own slice of the tangent.

use crate::manifold::{
    Euclidean, Manifold, ManifoldError, ManifoldResult, ManifoldType, QuaternionManifold,
};
use nalgebra::DVector;
use std::sync::Arc;

/// Ordered product of sub-manifolds.
#[derive(Debug, Clone)]
pub struct ProductManifold {
    parts: Vec<Arc<dyn Manifold>>,
    global_offsets: Vec<usize>,
    local_offsets: Vec<usize>,
    dimension_global: usize,
    dimension_local: usize,
    kind: ManifoldType,
}

impl ProductManifold {
    pub fn new(parts: Vec<Arc<dyn Manifold>>) -> Self {
        Self::with_type(parts, ManifoldType::Product)
    }

    /// Pose block: rotation then translation.
    ///
    /// Global layout `[qx, qy, qz, qw, px, py, pz]`, tangent `[δθ, δp]`. Pose residual
    /// Jacobians are written against this order.
    pub fn pose3() -> Self {
        Self::with_type(
            vec![Arc::new(QuaternionManifold::new()), Arc::new(Euclidean::new(3))],
            ManifoldType::Pose3,
        )
    }

    fn with_type(parts: Vec<Arc<dyn Manifold>>, kind: ManifoldType) -> Self {
        let mut global_offsets = Vec::with_capacity(parts.len());
        let mut local_offsets = Vec::with_capacity(parts.len());
        let mut dimension_global = 0;
        let mut dimension_local = 0;

        for part in &parts {
            global_offsets.push(dimension_global);
            local_offsets.push(dimension_local);
            dimension_global += part.dimension_global();
            dimension_local += part.dimension_local();
        }

        Self {
            parts,
            global_offsets,
            local_offsets,
            dimension_global,
            dimension_local,
            kind,
        }
    }

    pub fn parts(&self) -> &[Arc<dyn Manifold>] {
        &self.parts
    }

    /// Offsets of part `index` in the global and tangent vectors.
    pub fn offsets(&self, index: usize) -> Option<(usize, usize)> {
        Some((
            *self.global_offsets.get(index)?,
            *self.local_offsets.get(index)?,
        ))
    }

    fn global_part(&self, x: &DVector<f64>, index: usize) -> DVector<f64> {
        let part = &self.parts[index];
        x.rows(self.global_offsets[index], part.dimension_global())
            .into_owned()
    }
}

impl Manifold for ProductManifold {
    fn dimension_global(&self) -> usize {
        self.dimension_global
    }

    fn dimension_local(&self) -> usize {
        self.dimension_local
    }

    fn apply_update(&self, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
        let mut result = DVector::zeros(self.dimension_global);

        for (index, part) in self.parts.iter().enumerate() {
            let local = delta
                .rows(self.local_offsets[index], part.dimension_local())
                .into_owned();
            let updated = part.apply_update(&self.global_part(x, index), &local);
            result
                .rows_mut(self.global_offsets[index], part.dimension_global())
                .copy_from(&updated);
        }

        result
    }

    fn origin(&self) -> DVector<f64> {
        let mut result = DVector::zeros(self.dimension_global);
        for (index, part) in self.parts.iter().enumerate() {
            result
                .rows_mut(self.global_offsets[index], part.dimension_global())
                .copy_from(&part.origin());
        }
        result
    }

    fn normalize(&self, x: &DVector<f64>) -> ManifoldResult<DVector<f64>> {
        if x.len() != self.dimension_global {
            return Err(ManifoldError::DimensionMismatch {
                expected: self.dimension_global,
                actual: x.len(),
            });
        }

        let mut result = DVector::zeros(self.dimension_global);
        for (index, part) in self.parts.iter().enumerate() {
            let normalized = part.normalize(&self.global_part(x, index))?;
            result
                .rows_mut(self.global_offsets[index], part.dimension_global())
                .copy_from(&normalized);
        }
        Ok(result)
    }

    fn is_valid(&self, x: &DVector<f64>, tolerance: f64) -> bool {
        x.len() == self.dimension_global
            && self
                .parts
                .iter()
                .enumerate()
                .all(|(index, part)| part.is_valid(&self.global_part(x, index), tolerance))
    }

    fn manifold_type(&self) -> ManifoldType {
        self.kind
    }
}
