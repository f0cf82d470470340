//! The problem graph: parameter blocks and residual blocks stored in two arenas.
//!
//! Parameter blocks and residual blocks are addressed by stable integer ids handed out in
//! insertion order. The graph is append-only: blocks can be marked constant or variable but
//! never removed, so ids stay valid for the lifetime of the problem.
//!
//! ```text
//! parameter blocks:   p0 ── p1 ── p2 ── p3        (values on manifolds)
//!                      │     │     │     │
//! residual blocks:    r0    r1    r2    r3        (measurements / priors)
//! ```
//!
//! The total cost is
//!
//! ```text
//! F(x) = Σ_i ρ_i(‖S_i r_i(x)‖²)
//! ```
//!
//! with no ½ factor: for plain least squares this is the χ² value `Σ rᵀ Ω r`.
//!
//! # Example
//!
//! ```
//! use lsq_graph::core::problem::Problem;
//! use lsq_graph::factors::RelativePoseResidual;
//! use lsq_graph::manifold::Pose3;
//! use nalgebra::{UnitQuaternion, Vector3};
//! # fn example() -> lsq_graph::core::CoreResult<()> {
//!
//! let mut problem = Problem::new();
//! let a = problem.add_pose_block(&Pose3::identity())?;
//! let b = problem.add_pose_block(&Pose3::new(
//!     UnitQuaternion::identity(),
//!     Vector3::new(0.9, 0.1, 0.0),
//! ))?;
//! problem.set_constant(a)?;
//!
//! let measurement = Pose3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));
//! problem.add_residual(&[a, b], Box::new(RelativePoseResidual::with_identity_information(measurement)))?;
//!
//! assert!((problem.total_cost()? - 0.02).abs() < 1e-12);
//! assert_eq!(problem.free_layout().dimension(), 6);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use crate::core::{
    CoreError, CoreResult, loss_functions::LossFunction, parameter_block::ParameterBlock,
    residual_block::ResidualBlock,
};
use crate::factors::Residual;
use crate::linalg::assembler::{BlockLayout, evaluate_cost};
use crate::manifold::{Euclidean, Manifold, Pose3, ProductManifold};
use nalgebra::DVector;
use std::collections::HashSet;
use std::sync::Arc;

/// Nonlinear least-squares problem over manifold-valued parameter blocks.
#[derive(Debug, Default)]
pub struct Problem {
    parameter_blocks: Vec<ParameterBlock>,
    residual_blocks: Vec<ResidualBlock>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter block with an initial value and its manifold. Returns the block id.
    ///
    /// The value is normalized onto the manifold and must then be valid (finite, unit
    /// quaternion within 1e-6, correct length).
    pub fn add_parameter_block(
        &mut self,
        value: DVector<f64>,
        manifold: Arc<dyn Manifold>,
    ) -> CoreResult<usize> {
        let id = self.parameter_blocks.len();
        self.parameter_blocks
            .push(ParameterBlock::new(id, value, manifold)?);
        Ok(id)
    }

    /// Add a Euclidean block of the same size as `value`.
    pub fn add_euclidean_block(&mut self, value: DVector<f64>) -> CoreResult<usize> {
        let dimension = value.len();
        self.add_parameter_block(value, Arc::new(Euclidean::new(dimension)))
    }

    /// Add a pose block (`[qx, qy, qz, qw, px, py, pz]`, tangent `[δθ, δp]`).
    pub fn add_pose_block(&mut self, pose: &Pose3) -> CoreResult<usize> {
        self.add_parameter_block(pose.to_vector(), Arc::new(ProductManifold::pose3()))
    }

    fn block_mut(&mut self, id: usize) -> CoreResult<&mut ParameterBlock> {
        self.parameter_blocks
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownBlock { id }.log())
    }

    /// Hold a block fixed during optimization.
    pub fn set_constant(&mut self, id: usize) -> CoreResult<()> {
        self.block_mut(id)?.set_constant(true);
        Ok(())
    }

    /// Let a previously constant block move again.
    pub fn set_variable(&mut self, id: usize) -> CoreResult<()> {
        self.block_mut(id)?.set_constant(false);
        Ok(())
    }

    pub fn is_constant(&self, id: usize) -> CoreResult<bool> {
        self.parameter_block(id)
            .map(ParameterBlock::is_constant)
            .ok_or_else(|| CoreError::UnknownBlock { id }.log())
    }

    /// Add a residual over `block_ids` (in the order the residual expects them).
    pub fn add_residual(
        &mut self,
        block_ids: &[usize],
        residual: Box<dyn Residual>,
    ) -> CoreResult<usize> {
        self.add_residual_with_loss(block_ids, residual, None)
    }

    /// Add a residual with an optional robust loss. Nothing is inserted on failure.
    pub fn add_residual_with_loss(
        &mut self,
        block_ids: &[usize],
        residual: Box<dyn Residual>,
        loss: Option<Box<dyn LossFunction>>,
    ) -> CoreResult<usize> {
        let mut local_dimensions = Vec::with_capacity(block_ids.len());
        let mut seen = HashSet::with_capacity(block_ids.len());

        for &id in block_ids {
            let block = self
                .parameter_block(id)
                .ok_or_else(|| CoreError::UnknownBlock { id }.log())?;
            if !seen.insert(id) {
                return Err(CoreError::InvalidInput(format!(
                    "parameter block {id} appears twice in one residual"
                ))
                .log());
            }
            local_dimensions.push(block.dimension_local());
        }

        let id = self.residual_blocks.len();
        self.residual_blocks.push(ResidualBlock::new(
            id,
            block_ids.to_vec(),
            local_dimensions,
            residual,
            loss,
        )?);
        Ok(id)
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    /// Number of non-constant parameter blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.parameter_blocks
            .iter()
            .filter(|block| !block.is_constant())
            .count()
    }

    pub fn parameter_block(&self, id: usize) -> Option<&ParameterBlock> {
        self.parameter_blocks.get(id)
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlock] {
        &self.parameter_blocks
    }

    pub fn residual_blocks(&self) -> &[ResidualBlock] {
        &self.residual_blocks
    }

    pub fn parameter_value(&self, id: usize) -> CoreResult<&DVector<f64>> {
        self.parameter_block(id)
            .map(ParameterBlock::value)
            .ok_or_else(|| CoreError::UnknownBlock { id }.log())
    }

    /// Snapshot of every block's value, indexed by block id.
    pub fn parameter_values(&self) -> Vec<DVector<f64>> {
        self.parameter_blocks
            .iter()
            .map(|block| block.value().clone())
            .collect()
    }

    /// References to the current values, indexed by block id.
    pub fn value_refs(&self) -> Vec<&DVector<f64>> {
        self.parameter_blocks.iter().map(ParameterBlock::value).collect()
    }

    /// Overwrite one block's value (validated like on insertion).
    pub fn set_parameter_value(&mut self, id: usize, value: &DVector<f64>) -> CoreResult<()> {
        self.block_mut(id)?.set_value(value)
    }

    /// Reset a block to its manifold's origin.
    pub fn reset_to_origin(&mut self, id: usize) -> CoreResult<()> {
        self.block_mut(id)?.reset_to_origin();
        Ok(())
    }

    /// Cost at the current values.
    pub fn total_cost(&self) -> CoreResult<f64> {
        evaluate_cost(self, &self.value_refs(), &HashSet::new())
    }

    /// Cost at an arbitrary snapshot of values (indexed by block id).
    pub fn total_cost_at(&self, values: &[DVector<f64>]) -> CoreResult<f64> {
        if values.len() != self.parameter_blocks.len() {
            return Err(CoreError::DimensionMismatch(format!(
                "{} values given for {} parameter blocks",
                values.len(),
                self.parameter_blocks.len()
            ))
            .log());
        }
        let refs: Vec<&DVector<f64>> = values.iter().collect();
        evaluate_cost(self, &refs, &HashSet::new())
    }

    /// Offsets of the free blocks in the global tangent vector, ordered by block id.
    pub fn free_layout(&self) -> BlockLayout {
        BlockLayout::from_problem(self)
    }

    /// Values after applying the stacked tangent step `delta` to every free block.
    ///
    /// The problem is not modified; constant blocks keep their value.
    pub fn candidate_values(
        &self,
        layout: &BlockLayout,
        delta: &DVector<f64>,
    ) -> CoreResult<Vec<DVector<f64>>> {
        if delta.len() != layout.dimension() {
            return Err(CoreError::DimensionMismatch(format!(
                "step has length {}, expected {}",
                delta.len(),
                layout.dimension()
            ))
            .log());
        }

        self.parameter_blocks
            .iter()
            .map(|block| match layout.offset(block.id()) {
                Some(offset) => {
                    let local = delta.rows(offset, block.dimension_local()).into_owned();
                    block.updated_value(&local)
                }
                None => Ok(block.value().clone()),
            })
            .collect()
    }

    /// Replace all values at once with an accepted candidate.
    pub(crate) fn commit_values(&mut self, values: Vec<DVector<f64>>) {
        debug_assert_eq!(values.len(), self.parameter_blocks.len());
        for (block, value) in self.parameter_blocks.iter_mut().zip(values) {
            if !block.is_constant() {
                block.commit(value);
            }
        }
    }
}
