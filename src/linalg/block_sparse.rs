//! Symmetric block-sparse matrix holding the upper block triangle of the normal equations.
//!
//! Block `(r, c)` with `r ≤ c` is stored in `rows[r][c]`; the lower triangle is implied by
//! symmetry. Blocks are dense `nalgebra` matrices sized by the tangent dimensions of the
//! parameter blocks they couple.

use crate::linalg::{LinAlgError, LinAlgResult};
use faer::sparse::Triplet;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockSparseMatrix {
    block_dims: Vec<usize>,
    offsets: Vec<usize>,
    /// Parameter block id of each block row, used in error messages.
    block_labels: Vec<usize>,
    rows: Vec<BTreeMap<usize, DMatrix<f64>>>,
    dimension: usize,
}

impl BlockSparseMatrix {
    /// Empty matrix with the given block sizes.
    ///
    /// `block_labels[i]` is the parameter block id of block row `i`.
    pub fn new(block_dims: Vec<usize>, block_labels: Vec<usize>) -> Self {
        debug_assert_eq!(block_dims.len(), block_labels.len());
        let mut offsets = Vec::with_capacity(block_dims.len());
        let mut dimension = 0;
        for &dim in &block_dims {
            offsets.push(dimension);
            dimension += dim;
        }
        let rows = vec![BTreeMap::new(); block_dims.len()];
        Self {
            block_dims,
            offsets,
            block_labels,
            rows,
            dimension,
        }
    }

    /// Same block structure, no blocks.
    pub fn empty_like(&self) -> Self {
        Self::new(self.block_dims.clone(), self.block_labels.clone())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_blocks(&self) -> usize {
        self.block_dims.len()
    }

    pub fn block_dims(&self) -> &[usize] {
        &self.block_dims
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn block_labels(&self) -> &[usize] {
        &self.block_labels
    }

    /// Stored blocks of block row `r` (columns `c ≥ r`).
    pub fn row(&self, r: usize) -> &BTreeMap<usize, DMatrix<f64>> {
        &self.rows[r]
    }

    /// Number of stored blocks in the upper triangle.
    pub fn num_stored_blocks(&self) -> usize {
        self.rows.iter().map(BTreeMap::len).sum()
    }

    /// Accumulate `value` into block `(r, c)`. Lower-triangle blocks are transposed into
    /// the upper triangle.
    pub fn add_block(&mut self, r: usize, c: usize, value: &DMatrix<f64>) {
        if r > c {
            self.add_block(c, r, &value.transpose());
            return;
        }
        debug_assert_eq!(value.shape(), (self.block_dims[r], self.block_dims[c]));
        match self.rows[r].get_mut(&c) {
            Some(block) => *block += value,
            None => {
                self.rows[r].insert(c, value.clone());
            }
        }
    }

    /// Block `(r, c)` if it is structurally present, from either triangle.
    pub fn block(&self, r: usize, c: usize) -> Option<DMatrix<f64>> {
        if r <= c {
            self.rows[r].get(&c).cloned()
        } else {
            self.rows[c].get(&r).map(DMatrix::transpose)
        }
    }

    /// Add every block of `other` into `self`.
    pub fn merge(&mut self, other: Self) -> LinAlgResult<()> {
        if other.block_dims != self.block_dims {
            return Err(LinAlgError::DimensionMismatch(format!(
                "cannot merge block structure {:?} into {:?}",
                other.block_dims, self.block_dims
            ))
            .log());
        }
        for (r, row) in other.rows.into_iter().enumerate() {
            for (c, block) in row {
                match self.rows[r].get_mut(&c) {
                    Some(existing) => *existing += block,
                    None => {
                        self.rows[r].insert(c, block);
                    }
                }
            }
        }
        Ok(())
    }

    /// Scalar diagonal of the full matrix.
    pub fn diagonal(&self) -> DVector<f64> {
        let mut diagonal = DVector::zeros(self.dimension);
        for (r, row) in self.rows.iter().enumerate() {
            if let Some(block) = row.get(&r) {
                diagonal
                    .rows_mut(self.offsets[r], self.block_dims[r])
                    .copy_from(&block.diagonal());
            }
        }
        diagonal
    }

    pub fn max_diagonal(&self) -> f64 {
        self.diagonal().iter().copied().fold(0.0, f64::max)
    }

    /// `H x` using both triangles.
    pub fn multiply(&self, x: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(x.len(), self.dimension);
        let mut y = DVector::zeros(self.dimension);
        for (r, row) in self.rows.iter().enumerate() {
            let (ro, rd) = (self.offsets[r], self.block_dims[r]);
            for (&c, block) in row {
                let (co, cd) = (self.offsets[c], self.block_dims[c]);
                let product = block * x.rows(co, cd);
                let mut target = y.rows_mut(ro, rd);
                target += product;
                if r != c {
                    let product = block.tr_mul(&x.rows(ro, rd));
                    let mut target = y.rows_mut(co, cd);
                    target += product;
                }
            }
        }
        y
    }

    /// `xᵀ H x`.
    pub fn quadratic_form(&self, x: &DVector<f64>) -> f64 {
        x.dot(&self.multiply(x))
    }

    /// Dense copy of the full symmetric matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.dimension, self.dimension);
        for (r, row) in self.rows.iter().enumerate() {
            let (ro, rd) = (self.offsets[r], self.block_dims[r]);
            for (&c, block) in row {
                let (co, cd) = (self.offsets[c], self.block_dims[c]);
                dense.view_mut((ro, co), (rd, cd)).copy_from(block);
                if r != c {
                    dense.view_mut((co, ro), (cd, rd)).copy_from(&block.transpose());
                }
            }
        }
        dense
    }

    /// Scalar triplets of the full symmetric matrix plus a diagonal shift per index.
    pub fn triplets_with_shift(&self, shift: impl Fn(usize) -> f64) -> Vec<Triplet<usize, usize, f64>> {
        let mut triplets = Vec::new();
        for (r, row) in self.rows.iter().enumerate() {
            let ro = self.offsets[r];
            for (&c, block) in row {
                let co = self.offsets[c];
                for j in 0..block.ncols() {
                    for i in 0..block.nrows() {
                        let (gi, gj) = (ro + i, co + j);
                        let mut value = block[(i, j)];
                        if gi == gj {
                            value += shift(gi);
                        }
                        triplets.push(Triplet::new(gi, gj, value));
                        if r != c {
                            triplets.push(Triplet::new(gj, gi, value));
                        }
                    }
                }
            }
        }
        // Diagonal entries of blocks with no stored diagonal block still receive the shift.
        for (r, row) in self.rows.iter().enumerate() {
            if !row.contains_key(&r) {
                for i in 0..self.block_dims[r] {
                    let index = self.offsets[r] + i;
                    triplets.push(Triplet::new(index, index, shift(index)));
                }
            }
        }
        triplets
    }

    /// Structural fingerprint: block sizes plus the stored block coordinates.
    pub fn pattern(&self) -> (Vec<usize>, Vec<(usize, usize)>) {
        let coordinates = self
            .rows
            .iter()
            .enumerate()
            .flat_map(|(r, row)| row.keys().map(move |&c| (r, c)))
            .collect();
        (self.block_dims.clone(), coordinates)
    }
}
