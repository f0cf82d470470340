//! Right-looking block Cholesky on a [`BlockSparseMatrix`].
//!
//! The factor is kept in upper form `H = UᵀU`: each block row `j` stores `L_jj` (the lower
//! Cholesky factor of the Schur-updated diagonal block, so `U_jj = L_jjᵀ`) and the
//! off-diagonal blocks `U_jk = L_jj⁻¹ A_jk` for `k > j`. Eliminating block row `j` updates
//! `A_kl ← A_kl − U_jkᵀ U_jl` for every pair `j < k ≤ l` of its neighbours, creating fill-in
//! blocks as needed. Blocks are eliminated in their natural order.

use crate::linalg::{
    BlockSparseMatrix, Damping, LinAlgError, LinAlgResult, LinearSolver, LinearSolverType,
};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use tracing::debug;

/// Default relative pivot tolerance.
pub const DEFAULT_PIVOT_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct BlockCholeskySolver {
    pivot_tolerance: f64,
}

/// Factor of one block row.
#[derive(Debug, Clone)]
struct FactorRow {
    diagonal: DMatrix<f64>,
    off_diagonal: BTreeMap<usize, DMatrix<f64>>,
}

impl BlockCholeskySolver {
    pub fn new() -> Self {
        Self {
            pivot_tolerance: DEFAULT_PIVOT_TOLERANCE,
        }
    }

    /// Pivots `d ≤ tolerance · H_ii` are treated as singular.
    pub fn with_pivot_tolerance(mut self, tolerance: f64) -> Self {
        self.pivot_tolerance = tolerance;
        self
    }

    pub fn pivot_tolerance(&self) -> f64 {
        self.pivot_tolerance
    }

    fn factorize(
        &self,
        hessian: &BlockSparseMatrix,
        damping: Damping<'_>,
    ) -> LinAlgResult<Vec<FactorRow>> {
        let num_blocks = hessian.num_blocks();
        let dims = hessian.block_dims();
        let offsets = hessian.offsets();

        let mut work: Vec<BTreeMap<usize, DMatrix<f64>>> =
            (0..num_blocks).map(|r| hessian.row(r).clone()).collect();

        // Damped diagonal, also the reference for the relative pivot test.
        for (j, row) in work.iter_mut().enumerate() {
            let block = row
                .entry(j)
                .or_insert_with(|| DMatrix::zeros(dims[j], dims[j]));
            for i in 0..dims[j] {
                block[(i, i)] += damping.shift(offsets[j] + i);
            }
        }
        let reference: Vec<DVector<f64>> = work
            .iter()
            .enumerate()
            .map(|(j, row)| row[&j].diagonal())
            .collect();

        let mut factor = Vec::with_capacity(num_blocks);
        let mut fill_in = 0usize;

        for j in 0..num_blocks {
            let mut row = std::mem::take(&mut work[j]);
            let Some(pivot_block) = row.remove(&j) else {
                return Err(LinAlgError::FactorizationFailed(format!(
                    "missing diagonal block {j}"
                ))
                .log());
            };

            let diagonal = dense_cholesky(&pivot_block, &reference[j], self.pivot_tolerance)
                .ok_or_else(|| {
                    LinAlgError::SingularMatrix {
                        block: Some(hessian.block_labels()[j]),
                    }
                    .log()
                })?;

            for block in row.values_mut() {
                diagonal.solve_lower_triangular_unchecked_mut(block);
            }

            let neighbours: Vec<usize> = row.keys().copied().collect();
            for (a, &k) in neighbours.iter().enumerate() {
                let u_jk = &row[&k];
                for &l in &neighbours[a..] {
                    let update = u_jk.tr_mul(&row[&l]);
                    let target = work[k].entry(l).or_insert_with(|| {
                        fill_in += 1;
                        DMatrix::zeros(dims[k], dims[l])
                    });
                    *target -= update;
                }
            }

            factor.push(FactorRow {
                diagonal,
                off_diagonal: row,
            });
        }

        debug!(
            "Block Cholesky: {} blocks, {} stored, {} fill-in",
            num_blocks,
            hessian.num_stored_blocks(),
            fill_in
        );
        Ok(factor)
    }
}

impl Default for BlockCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower Cholesky factor of a dense symmetric block with a relative pivot test against
/// `reference` (the damped diagonal of `H`).
fn dense_cholesky(a: &DMatrix<f64>, reference: &DVector<f64>, tolerance: f64) -> Option<DMatrix<f64>> {
    let n = a.nrows();
    let mut l = DMatrix::zeros(n, n);
    for k in 0..n {
        let mut d = a[(k, k)];
        for p in 0..k {
            d -= l[(k, p)] * l[(k, p)];
        }
        let scale = reference[k];
        if !d.is_finite() || scale.is_nan() || scale <= 0.0 || d <= tolerance * scale {
            return None;
        }
        let pivot = d.sqrt();
        l[(k, k)] = pivot;
        for i in (k + 1)..n {
            let mut value = a[(i, k)];
            for p in 0..k {
                value -= l[(i, p)] * l[(k, p)];
            }
            l[(i, k)] = value / pivot;
        }
    }
    Some(l)
}

impl LinearSolver for BlockCholeskySolver {
    fn solve(
        &mut self,
        hessian: &BlockSparseMatrix,
        gradient: &DVector<f64>,
        damping: Damping<'_>,
    ) -> LinAlgResult<DVector<f64>> {
        if gradient.len() != hessian.dimension() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "gradient has length {}, Hessian is {}x{}",
                gradient.len(),
                hessian.dimension(),
                hessian.dimension()
            ))
            .log());
        }

        let factor = self.factorize(hessian, damping)?;
        let offsets = hessian.offsets();
        let dims = hessian.block_dims();

        // Forward: Uᵀ y = −g.
        let mut x = -gradient;
        for (j, row) in factor.iter().enumerate() {
            let mut x_j = x.rows(offsets[j], dims[j]).into_owned();
            row.diagonal.solve_lower_triangular_unchecked_mut(&mut x_j);
            for (&k, u_jk) in &row.off_diagonal {
                let mut x_k = x.rows_mut(offsets[k], dims[k]);
                x_k -= u_jk.tr_mul(&x_j);
            }
            x.rows_mut(offsets[j], dims[j]).copy_from(&x_j);
        }

        // Backward: U x = y.
        for (j, row) in factor.iter().enumerate().rev() {
            let mut x_j = x.rows(offsets[j], dims[j]).into_owned();
            for (&k, u_jk) in &row.off_diagonal {
                x_j -= u_jk * x.rows(offsets[k], dims[k]);
            }
            row.diagonal.tr_solve_lower_triangular_unchecked_mut(&mut x_j);
            x.rows_mut(offsets[j], dims[j]).copy_from(&x_j);
        }

        Ok(x)
    }

    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::BlockCholesky
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Random SPD arrow-shaped system: block 0 couples to every other block, which forces
    /// fill-in between the remaining blocks.
    fn arrow_system(seed: u64) -> BlockSparseMatrix {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dims = vec![3, 2, 3, 1];
        let mut h = BlockSparseMatrix::new(dims.clone(), vec![7, 8, 9, 10]);
        for (c, &dim) in dims.iter().enumerate().skip(1) {
            // J couples block 0 and block c.
            let rows = dims[0] + dim + 1;
            let j0 = DMatrix::from_fn(rows, dims[0], |_, _| rng.random_range(-1.0..1.0));
            let jc = DMatrix::from_fn(rows, dim, |_, _| rng.random_range(-1.0..1.0));
            h.add_block(0, 0, &j0.tr_mul(&j0));
            h.add_block(0, c, &j0.tr_mul(&jc));
            h.add_block(c, c, &jc.tr_mul(&jc));
        }
        h
    }

    #[test]
    fn test_matches_dense_solve() -> TestResult {
        let h = arrow_system(3);
        let g = DVector::from_fn(h.dimension(), |i, _| (i as f64 + 1.0).sin());

        let delta = BlockCholeskySolver::new().solve(&h, &g, Damping::None)?;
        let expected = h
            .to_dense()
            .cholesky()
            .ok_or("dense Cholesky failed")?
            .solve(&(-&g));
        assert_relative_eq!(delta, expected, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_damping_is_applied() -> TestResult {
        let h = arrow_system(5);
        let g = DVector::from_element(h.dimension(), 1.0);
        let d = h.diagonal();
        let mut solver = BlockCholeskySolver::new();

        let identity = solver.solve(&h, &g, Damping::Identity(0.3))?;
        let mut dense = h.to_dense();
        for i in 0..h.dimension() {
            dense[(i, i)] += 0.3;
        }
        let expected = dense.clone().cholesky().ok_or("dense")?.solve(&(-&g));
        assert_relative_eq!(identity, expected, epsilon = 1e-9);

        let scaled = solver.solve(&h, &g, Damping::Diagonal(2.0, &d))?;
        let mut dense = h.to_dense();
        for i in 0..h.dimension() {
            dense[(i, i)] += 2.0 * d[i];
        }
        let expected = dense.cholesky().ok_or("dense")?.solve(&(-&g));
        assert_relative_eq!(scaled, expected, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_singular_pivot_names_block() {
        // Second block is an exact copy of the first: rank deficient once block 0 is gone.
        let mut h = BlockSparseMatrix::new(vec![1, 1], vec![4, 5]);
        h.add_block(0, 0, &DMatrix::from_element(1, 1, 1.0));
        h.add_block(0, 1, &DMatrix::from_element(1, 1, 1.0));
        h.add_block(1, 1, &DMatrix::from_element(1, 1, 1.0));

        let result = BlockCholeskySolver::new().solve(&h, &dvector![1.0, 0.0], Damping::None);
        assert!(matches!(
            result,
            Err(LinAlgError::SingularMatrix { block: Some(5) })
        ));

        // Damping makes it solvable.
        assert!(
            BlockCholeskySolver::new()
                .solve(&h, &dvector![1.0, 0.0], Damping::Identity(1e-3))
                .is_ok()
        );
    }

    #[test]
    fn test_missing_diagonal_block_is_singular() {
        let h = BlockSparseMatrix::new(vec![2], vec![0]);
        assert!(matches!(
            BlockCholeskySolver::new().solve(&h, &DVector::zeros(2), Damping::None),
            Err(LinAlgError::SingularMatrix { block: Some(0) })
        ));
    }

    #[test]
    fn test_gradient_length_mismatch() {
        let h = arrow_system(1);
        assert!(matches!(
            BlockCholeskySolver::new().solve(&h, &DVector::zeros(2), Damping::None),
            Err(LinAlgError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_empty_system() -> TestResult {
        let h = BlockSparseMatrix::new(Vec::new(), Vec::new());
        let delta = BlockCholeskySolver::new().solve(&h, &DVector::zeros(0), Damping::None)?;
        assert_eq!(delta.len(), 0);
        Ok(())
    }
}
