//! Scalar sparse Cholesky backend built on faer.
//!
//! The block-sparse Hessian is expanded into a symmetric `SparseColMat` (damping folded into
//! the diagonal triplets) and factored with faer's `Llt`. The symbolic analysis depends only
//! on the block pattern, so it is cached and reused while the pattern stays the same, which
//! is the case for every iteration of a run.

use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};
use nalgebra::DVector;
use tracing::debug;

use crate::linalg::{
    BlockSparseMatrix, Damping, LinAlgError, LinAlgResult, LinearSolver, LinearSolverType,
};

type Pattern = (Vec<usize>, Vec<(usize, usize)>);

#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    /// Cached symbolic factorization and the block pattern it was computed for.
    ///
    /// `SymbolicLlt` is reference-counted, so handing out clones is cheap.
    symbolic_factorization: Option<(Pattern, SymbolicLlt<usize>)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a symbolic factorization is cached.
    pub fn has_symbolic_factorization(&self) -> bool {
        self.symbolic_factorization.is_some()
    }

    fn symbolic_for(
        &mut self,
        hessian: &BlockSparseMatrix,
        matrix: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<SymbolicLlt<usize>> {
        let pattern = hessian.pattern();
        if let Some((cached_pattern, symbolic)) = &self.symbolic_factorization
            && *cached_pattern == pattern
        {
            return Ok(symbolic.clone());
        }

        debug!("Sparse Cholesky: symbolic analysis of {} unknowns", hessian.dimension());
        let symbolic = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some((pattern, symbolic.clone()));
        Ok(symbolic)
    }
}

impl LinearSolver for SparseCholeskySolver {
    fn solve(
        &mut self,
        hessian: &BlockSparseMatrix,
        gradient: &DVector<f64>,
        damping: Damping<'_>,
    ) -> LinAlgResult<DVector<f64>> {
        let n = hessian.dimension();
        if gradient.len() != n {
            return Err(LinAlgError::DimensionMismatch(format!(
                "gradient has length {}, Hessian is {n}x{n}",
                gradient.len()
            ))
            .log());
        }
        if n == 0 {
            return Ok(DVector::zeros(0));
        }

        let triplets = hessian.triplets_with_shift(|i| damping.shift(i));
        let matrix = SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to create Hessian from triplets".to_string())
                .log_with_source(e)
        })?;

        let symbolic = self.symbolic_for(hessian, &matrix)?;
        let cholesky = Llt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix { block: None }.log_with_source(e))?;

        let rhs = Mat::from_fn(n, 1, |i, _| -gradient[i]);
        let solution = cholesky.solve(&rhs);
        let delta = DVector::from_fn(n, |i, _| solution[(i, 0)]);

        if delta.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::SingularMatrix { block: None }.log());
        }
        Ok(delta)
    }

    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::SparseCholesky
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::BlockCholeskySolver;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Chain of three 2x2 blocks, each coupled to its successor.
    fn chain_system() -> BlockSparseMatrix {
        let mut h = BlockSparseMatrix::new(vec![2, 2, 2], vec![0, 1, 2]);
        let diagonal = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let coupling = DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.5, -1.0]);
        for i in 0..3 {
            h.add_block(i, i, &diagonal);
        }
        h.add_block(0, 1, &coupling);
        h.add_block(1, 2, &coupling);
        h
    }

    #[test]
    fn test_agrees_with_block_cholesky() -> TestResult {
        let h = chain_system();
        let g = dvector![1.0, -2.0, 0.5, 1.2, 0.0, 3.0];

        for damping in [Damping::None, Damping::Identity(0.7)] {
            let sparse = SparseCholeskySolver::new().solve(&h, &g, damping)?;
            let block = BlockCholeskySolver::new().solve(&h, &g, damping)?;
            assert_relative_eq!(sparse, block, epsilon = 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_solution_satisfies_normal_equations() -> TestResult {
        let h = chain_system();
        let g = dvector![1.0, 0.0, 0.0, 0.0, 0.0, -1.0];
        let delta = SparseCholeskySolver::new().solve(&h, &g, Damping::None)?;
        assert_relative_eq!(h.multiply(&delta), -g, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn test_symbolic_factorization_is_cached() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        assert!(!solver.has_symbolic_factorization());

        let h = chain_system();
        let g = DVector::from_element(6, 1.0);
        let first = solver.solve(&h, &g, Damping::Identity(0.1))?;
        assert!(solver.has_symbolic_factorization());

        // Same pattern, different values: the cached analysis is reused.
        let second = solver.solve(&h, &g, Damping::Identity(1.0))?;
        assert!((first - second).norm() > 1e-6);

        // A new pattern triggers a new analysis.
        let mut other = BlockSparseMatrix::new(vec![1], vec![0]);
        other.add_block(0, 0, &DMatrix::from_element(1, 1, 2.0));
        let delta = solver.solve(&other, &dvector![4.0], Damping::None)?;
        assert_relative_eq!(delta[0], -2.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_singular_matrix() {
        let mut h = BlockSparseMatrix::new(vec![2], vec![0]);
        h.add_block(0, 0, &DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]));
        let result = SparseCholeskySolver::new().solve(&h, &dvector![1.0, 1.0], Damping::None);
        assert!(matches!(
            result,
            Err(LinAlgError::SingularMatrix { block: None })
        ));
    }

    #[test]
    fn test_empty_system() -> TestResult {
        let h = BlockSparseMatrix::new(Vec::new(), Vec::new());
        let delta = SparseCholeskySolver::new().solve(&h, &DVector::zeros(0), Damping::None)?;
        assert_eq!(delta.len(), 0);
        Ok(())
    }
}
