//! Residual (factor) implementations.
//!
//! A residual connects one or more parameter blocks and computes an error vector `r` of fixed
//! dimension `k` together with one Jacobian block per connected parameter block. Jacobian
//! block `i` has shape `k × D_local(i)`: it is taken with respect to the tangent update of
//! block `i` (the `δ` in `x_i ⊞ δ`), not the stored global value.
//!
//! ```text
//! minimize Σ_i ρ_i(‖S_i r_i(x)‖²),   S_iᵀ S_i = Ω_i
//! ```
//!
//! The residual itself is unweighted. Whitening by the information matrix `Ω_i` (returned by
//! [`Residual::information`]) and robust losses are applied by
//! [`ResidualBlock`](crate::core::residual_block::ResidualBlock).
//!
//! # Provided residuals
//!
//! - [`CurveResidual`]: `y − exp(a·x² + b·x + c)` on a 3-vector `(a, b, c)`
//! - [`RelativePoseResidual`]: relative pose measurement between two pose blocks
//! - [`PriorResidual`]: unary prior on a Euclidean or pose block
//!
//! Any residual can fall back to [`numeric_jacobians`], which differentiates through the
//! blocks' manifolds with central differences.

use crate::manifold::Manifold;
use nalgebra::{DMatrix, DVector};

pub mod curve;
pub mod prior;
pub mod relative_pose;

pub use curve::CurveResidual;
pub use prior::PriorResidual;
pub use relative_pose::RelativePoseResidual;

/// Default step for central differences.
pub const NUMERIC_DIFF_STEP: f64 = 1e-6;

/// How a residual obtains its Jacobians.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JacobianMode {
    #[default]
    Analytic,
    Numeric,
}

/// A residual connecting a fixed number of parameter blocks.
///
/// # Example
///
/// ```
/// use lsq_graph::factors::Residual;
/// use nalgebra::{DMatrix, DVector};
///
/// /// Range from a 2D point to the origin.
/// struct RangeResidual {
///     measurement: f64,
/// }
///
/// impl Residual for RangeResidual {
///     fn residual_dimension(&self) -> usize { 1 }
///     fn num_parameter_blocks(&self) -> usize { 1 }
///
///     fn evaluate(
///         &self,
///         params: &[&DVector<f64>],
///         compute_jacobians: bool,
///     ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>) {
///         let (x, y) = (params[0][0], params[0][1]);
///         let range = (x * x + y * y).sqrt();
///         let residual = DVector::from_vec(vec![range - self.measurement]);
///         let jacobians = compute_jacobians
///             .then(|| vec![DMatrix::from_row_slice(1, 2, &[x / range, y / range])]);
///         (residual, jacobians)
///     }
/// }
/// ```
pub trait Residual: Send + Sync {
    /// Dimension `k` of the residual vector.
    fn residual_dimension(&self) -> usize;

    /// Number of parameter blocks this residual connects.
    fn num_parameter_blocks(&self) -> usize;

    /// Evaluate the residual at `params` (global values, one per connected block, in order).
    ///
    /// With `compute_jacobians`, also returns one `k × D_local(i)` Jacobian per block.
    fn evaluate(
        &self,
        params: &[&DVector<f64>],
        compute_jacobians: bool,
    ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>);

    /// Information matrix `Ω` (`k × k`, symmetric positive semi-definite).
    fn information(&self) -> DMatrix<f64> {
        DMatrix::identity(self.residual_dimension(), self.residual_dimension())
    }
}

/// Central-difference Jacobians of `residual` with respect to the tangent update of each
/// block: column `j` of block `i` is `(r(x_i ⊞ h·e_j) − r(x_i ⊞ −h·e_j)) / 2h`.
pub fn numeric_jacobians<R>(
    residual: &R,
    params: &[&DVector<f64>],
    manifolds: &[&dyn Manifold],
    step: f64,
) -> Vec<DMatrix<f64>>
where
    R: Residual + ?Sized,
{
    let k = residual.residual_dimension();

    manifolds
        .iter()
        .enumerate()
        .map(|(block, manifold)| {
            let local_dim = manifold.dimension_local();
            let mut jacobian = DMatrix::zeros(k, local_dim);

            for j in 0..local_dim {
                let mut delta = DVector::zeros(local_dim);
                delta[j] = step;
                let plus = manifold.apply_update(params[block], &delta);
                delta[j] = -step;
                let minus = manifold.apply_update(params[block], &delta);

                let mut perturbed: Vec<&DVector<f64>> = params.to_vec();
                perturbed[block] = &plus;
                let (r_plus, _) = residual.evaluate(&perturbed, false);
                perturbed[block] = &minus;
                let (r_minus, _) = residual.evaluate(&perturbed, false);

                jacobian
                    .column_mut(j)
                    .copy_from(&((r_plus - r_minus) / (2.0 * step)));
            }

            jacobian
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::Euclidean;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    struct Quadratic;

    impl Residual for Quadratic {
        fn residual_dimension(&self) -> usize {
            2
        }

        fn num_parameter_blocks(&self) -> usize {
            2
        }

        fn evaluate(
            &self,
            params: &[&DVector<f64>],
            compute_jacobians: bool,
        ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>) {
            let (a, b) = (params[0], params[1]);
            let residual = dvector![a[0] * a[0] + b[0], a[1] * b[0]];
            let jacobians = compute_jacobians.then(|| {
                vec![
                    DMatrix::from_row_slice(2, 2, &[2.0 * a[0], 0.0, 0.0, b[0]]),
                    DMatrix::from_row_slice(2, 1, &[1.0, a[1]]),
                ]
            });
            (residual, jacobians)
        }
    }

    #[test]
    fn test_numeric_jacobians_match_analytic() {
        let a = dvector![1.5, -0.5];
        let b = dvector![2.0];
        let params = [&a, &b];
        let (m2, m1) = (Euclidean::new(2), Euclidean::new(1));

        let numeric = numeric_jacobians(&Quadratic, &params, &[&m2, &m1], NUMERIC_DIFF_STEP);
        let (_, analytic) = Quadratic.evaluate(&params, true);
        let analytic = analytic.expect("jacobians requested");

        assert_eq!(numeric.len(), 2);
        for (n, a) in numeric.iter().zip(&analytic) {
            assert_eq!(n.shape(), a.shape());
            assert_relative_eq!(n, a, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_default_information_is_identity() {
        assert_eq!(Quadratic.information(), DMatrix::identity(2, 2));
    }
}
