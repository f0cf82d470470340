//! Assembly of the normal equations from the problem's residual blocks.
//!
//! Each residual block is linearized at the given values (whitening and robust loss folded
//! into `r` and `J`), then scattered into
//!
//! ```text
//! H_ij += J_iᵀ J_j     (upper block triangle, free blocks only)
//! g_i  += J_iᵀ r
//! F    += ρ(‖S r‖²)
//! ```
//!
//! With the `parallel` feature the residual blocks are folded into thread-local partial
//! systems by rayon and the partials are merged pairwise; otherwise a single sequential fold
//! is used. Constant blocks contribute to the cost but take no rows or columns.

use crate::core::{
    CoreError, CoreResult, problem::Problem,
    residual_block::{NumericalFailurePolicy, ResidualBlock},
};
use crate::linalg::BlockSparseMatrix;
use nalgebra::DVector;
use std::collections::HashSet;
use tracing::warn;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Placement of the free parameter blocks in the stacked tangent vector.
///
/// Free blocks are ordered by id; constant blocks have no position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    /// Position of each parameter block (indexed by id), `None` for constant blocks.
    positions: Vec<Option<usize>>,
    free_blocks: Vec<usize>,
    block_dims: Vec<usize>,
    offsets: Vec<usize>,
    dimension: usize,
}

impl BlockLayout {
    pub fn from_problem(problem: &Problem) -> Self {
        let mut positions = Vec::with_capacity(problem.num_parameter_blocks());
        let mut free_blocks = Vec::new();
        let mut block_dims = Vec::new();
        let mut offsets = Vec::new();
        let mut dimension = 0;

        for block in problem.parameter_blocks() {
            if block.is_constant() {
                positions.push(None);
                continue;
            }
            positions.push(Some(free_blocks.len()));
            free_blocks.push(block.id());
            block_dims.push(block.dimension_local());
            offsets.push(dimension);
            dimension += block.dimension_local();
        }

        Self {
            positions,
            free_blocks,
            block_dims,
            offsets,
            dimension,
        }
    }

    /// Block row of parameter block `id`, if it is free.
    pub fn position(&self, id: usize) -> Option<usize> {
        self.positions.get(id).copied().flatten()
    }

    /// Offset of parameter block `id` in the tangent vector, if it is free.
    pub fn offset(&self, id: usize) -> Option<usize> {
        self.position(id).map(|position| self.offsets[position])
    }

    /// Total tangent dimension of the free blocks.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Ids of the free blocks, in layout order.
    pub fn free_blocks(&self) -> &[usize] {
        &self.free_blocks
    }

    pub fn block_dims(&self) -> &[usize] {
        &self.block_dims
    }

    pub fn num_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    /// Empty Hessian with one block row per free block.
    pub fn empty_hessian(&self) -> BlockSparseMatrix {
        BlockSparseMatrix::new(self.block_dims.clone(), self.free_blocks.clone())
    }
}

/// Normal equations at one linearization point.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    /// `Σ JᵀJ`, upper block triangle
    pub hessian: BlockSparseMatrix,
    /// `Σ Jᵀr`
    pub gradient: DVector<f64>,
    /// `Σ ρ(‖S r‖²)` over the residual blocks that were not skipped
    pub cost: f64,
    /// Residual blocks left out under [`NumericalFailurePolicy::SkipAndWarn`], sorted
    pub skipped: Vec<usize>,
}

impl LinearSystem {
    fn empty(layout: &BlockLayout) -> Self {
        Self {
            hessian: layout.empty_hessian(),
            gradient: DVector::zeros(layout.dimension()),
            cost: 0.0,
            skipped: Vec::new(),
        }
    }

    /// `‖g‖∞`
    pub fn gradient_max_norm(&self) -> f64 {
        self.gradient.amax()
    }

    fn accumulate(
        mut self,
        block: &ResidualBlock,
        layout: &BlockLayout,
        values: &[&DVector<f64>],
        policy: NumericalFailurePolicy,
    ) -> CoreResult<Self> {
        let params = block_values(block, values)?;
        let linearization = match block.linearize(&params) {
            Ok(linearization) => linearization,
            Err(CoreError::NumericalFailure { residual, message })
                if policy == NumericalFailurePolicy::SkipAndWarn =>
            {
                warn!("Skipping residual block {}: {}", residual, message);
                self.skipped.push(residual);
                return Ok(self);
            }
            Err(e @ CoreError::NumericalFailure { .. }) => return Err(e.log()),
            Err(e) => return Err(e),
        };

        self.cost += linearization.cost;

        let free: Vec<(usize, usize)> = block
            .parameter_ids()
            .iter()
            .enumerate()
            .filter_map(|(slot, &id)| layout.position(id).map(|position| (slot, position)))
            .collect();

        for &(slot_i, pos_i) in &free {
            let jacobian_i = &linearization.jacobians[slot_i];
            let offset = layout.offsets[pos_i];
            let mut gradient = self.gradient.rows_mut(offset, layout.block_dims[pos_i]);
            gradient += jacobian_i.tr_mul(&linearization.residual);

            for &(slot_j, pos_j) in &free {
                if pos_i <= pos_j {
                    let jacobian_j = &linearization.jacobians[slot_j];
                    self.hessian
                        .add_block(pos_i, pos_j, &jacobian_i.tr_mul(jacobian_j));
                }
            }
        }

        Ok(self)
    }

    fn merge(mut self, other: Self) -> CoreResult<Self> {
        self.hessian.merge(other.hessian).map_err(|e| {
            CoreError::ParallelComputation(format!("failed to merge partial Hessians: {e}")).log()
        })?;
        self.gradient += other.gradient;
        self.cost += other.cost;
        self.skipped.extend(other.skipped);
        Ok(self)
    }
}

fn block_values<'a>(
    block: &ResidualBlock,
    values: &[&'a DVector<f64>],
) -> CoreResult<Vec<&'a DVector<f64>>> {
    block
        .parameter_ids()
        .iter()
        .map(|&id| {
            values
                .get(id)
                .copied()
                .ok_or_else(|| CoreError::UnknownBlock { id }.log())
        })
        .collect()
}

/// Linearize every residual block at `values` (indexed by parameter block id) and assemble
/// the normal equations over the free blocks of `layout`.
///
/// Under [`NumericalFailurePolicy::FailFast`] the first non-finite residual aborts with
/// [`CoreError::NumericalFailure`]. Under `SkipAndWarn` such blocks are left out and listed in
/// [`LinearSystem::skipped`]; if no block survives, the failure is returned anyway.
pub fn assemble(
    problem: &Problem,
    layout: &BlockLayout,
    values: &[&DVector<f64>],
    policy: NumericalFailurePolicy,
) -> CoreResult<LinearSystem> {
    let blocks = problem.residual_blocks();

    #[cfg(feature = "parallel")]
    let mut system = blocks
        .par_iter()
        .try_fold(
            || LinearSystem::empty(layout),
            |partial, block| partial.accumulate(block, layout, values, policy),
        )
        .try_reduce(|| LinearSystem::empty(layout), LinearSystem::merge)?;

    #[cfg(not(feature = "parallel"))]
    let mut system = blocks.iter().try_fold(LinearSystem::empty(layout), |partial, block| {
        partial.accumulate(block, layout, values, policy)
    })?;

    system.skipped.sort_unstable();
    if !blocks.is_empty() && system.skipped.len() == blocks.len() {
        return Err(CoreError::NumericalFailure {
            residual: system.skipped[0],
            message: "every residual block evaluated to NaN or Inf".to_string(),
        }
        .log());
    }

    Ok(system)
}

/// Total cost at `values` (indexed by parameter block id), leaving out the residual blocks
/// in `skip`.
///
/// Non-finite residuals are returned as [`CoreError::NumericalFailure`] without logging; at a
/// trial point the caller treats them as a rejected step.
pub fn evaluate_cost(
    problem: &Problem,
    values: &[&DVector<f64>],
    skip: &HashSet<usize>,
) -> CoreResult<f64> {
    let cost_of = |block: &ResidualBlock| -> CoreResult<f64> {
        if skip.contains(&block.id()) {
            return Ok(0.0);
        }
        block.cost(&block_values(block, values)?)
    };

    #[cfg(feature = "parallel")]
    let cost = problem
        .residual_blocks()
        .par_iter()
        .map(cost_of)
        .try_reduce(|| 0.0, |a, b| Ok(a + b))?;

    #[cfg(not(feature = "parallel"))]
    let cost = problem
        .residual_blocks()
        .iter()
        .map(cost_of)
        .try_fold(0.0, |total, cost| cost.map(|cost| total + cost))?;

    Ok(cost)
}
