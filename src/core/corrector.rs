//! Corrector for applying robust losses to residuals and Jacobians.
//!
//! Instead of teaching the linear solver about ρ, the residual block rescales its whitened
//! residual `r` and Jacobian blocks `J_i` so that the Gauss-Newton system built from the
//! rescaled quantities has the gradient and (approximate) Hessian of `ρ(‖r‖²)`:
//!
//! ```text
//! s  = ‖r‖²,   [ρ, ρ', ρ''] = loss(s)
//! α  = root of ½α² − α − (ρ''/ρ')·s = 0      (α = 0 if ρ'' ≤ 0 or s = 0)
//! r̃  = √ρ' / (1 − α) · r
//! J̃ᵢ = √ρ' · (Jᵢ − (α/s)·r·rᵀ·Jᵢ)
//! ```
//!
//! Reference: Triggs et al., "Bundle Adjustment: A Modern Synthesis", section 4.3, and
//! Ceres Solver's `corrector.cc`.
//!
//! The corrected residual only drives the linear system. The cost itself is always `ρ(s)`,
//! evaluated exactly by the residual block.

use crate::core::loss_functions::LossFunction;
use nalgebra::{DMatrix, DVector};

/// Scaling factors for one residual at one linearization point.
#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Evaluate `loss` at `sq_norm = ‖r‖²` and precompute the scaling factors.
    pub fn new(loss_function: &dyn LossFunction, sq_norm: f64) -> Self {
        let [_, rho_1, rho_2] = loss_function.evaluate(sq_norm);
        let sqrt_rho1 = rho_1.max(0.0).sqrt();

        // ρ'' ≤ 0 holds for every loss in the crate outside the quadratic region, so this is
        // the common path. ρ' == 0 (fully suppressed residual) also lands here.
        if sq_norm == 0.0 || rho_2 <= 0.0 || rho_1 <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        let d = 1.0 + 2.0 * sq_norm * rho_2 / rho_1;
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Weight applied to the Jacobian, `√ρ'(s)`.
    pub fn sqrt_rho1(&self) -> f64 {
        self.sqrt_rho1
    }

    /// Correct one Jacobian block in place. `residual` is the uncorrected residual.
    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }

        let rt_j = residual.transpose() * &*jacobian;
        let correction = residual * rt_j * self.alpha_sq_norm;
        *jacobian -= correction;
        *jacobian *= self.sqrt_rho1;
    }

    /// Correct every Jacobian block of a residual. Call before [`Self::correct_residuals`].
    pub fn correct_jacobians(&self, residual: &DVector<f64>, jacobians: &mut [DMatrix<f64>]) {
        for jacobian in jacobians.iter_mut() {
            self.correct_jacobian(residual, jacobian);
        }
    }

    pub fn correct_residuals(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::{CauchyLoss, HuberLoss, L2Loss, TukeyBiweightLoss};
    use approx::assert_relative_eq;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Loss with positive curvature, to exercise the α ≠ 0 branch.
    struct ConvexQuartic;

    impl LossFunction for ConvexQuartic {
        fn evaluate(&self, s: f64) -> [f64; 3] {
            [s + 0.1 * s * s, 1.0 + 0.2 * s, 0.2]
        }
    }

    #[test]
    fn test_l2_corrector_is_identity() {
        let residual = DVector::from_vec(vec![3.0, -4.0]);
        let corrector = Corrector::new(&L2Loss::new(), residual.norm_squared());

        let mut corrected = residual.clone();
        corrector.correct_residuals(&mut corrected);
        assert_eq!(corrected, residual);

        let mut jacobian = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let original = jacobian.clone();
        corrector.correct_jacobian(&residual, &mut jacobian);
        assert_eq!(jacobian, original);
    }

    #[test]
    fn test_huber_inlier_unchanged_outlier_downweighted() -> TestResult {
        let loss = HuberLoss::new(1.0)?;

        let inlier = DVector::from_vec(vec![0.1, 0.2, 0.1]);
        let corrector = Corrector::new(&loss, inlier.norm_squared());
        let mut corrected = inlier.clone();
        corrector.correct_residuals(&mut corrected);
        assert_relative_eq!(corrected, inlier, epsilon = 1e-15);

        let outlier = DVector::from_vec(vec![5.0, 5.0, 5.0]);
        let corrector = Corrector::new(&loss, outlier.norm_squared());
        let mut corrected = outlier.clone();
        corrector.correct_residuals(&mut corrected);
        assert!(corrected.norm() < outlier.norm());
        assert_relative_eq!(
            corrected.norm_squared(),
            outlier.norm_squared() / 75.0_f64.sqrt(),
            epsilon = 1e-12
        );
        Ok(())
    }

    #[test]
    fn test_corrected_gradient_matches_robust_gradient() -> TestResult {
        // ∇ρ(‖r‖²)/2 = ρ'·Jᵀr must equal J̃ᵀr̃.
        let residual = DVector::from_vec(vec![2.0, 3.0]);
        let jacobian = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
        let s = residual.norm_squared();

        let losses: Vec<Box<dyn LossFunction>> = vec![
            Box::new(CauchyLoss::new(1.0)?),
            Box::new(HuberLoss::new(1.0)?),
            Box::new(ConvexQuartic),
        ];

        for loss in &losses {
            let rho1 = loss.evaluate(s)[1];
            let corrector = Corrector::new(loss.as_ref(), s);

            let mut j = vec![jacobian.clone()];
            let mut r = residual.clone();
            corrector.correct_jacobians(&residual, &mut j);
            corrector.correct_residuals(&mut r);

            let expected = jacobian.transpose() * &residual * rho1;
            assert_relative_eq!(j[0].transpose() * r, expected, epsilon = 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_tukey_outlier_is_removed() -> TestResult {
        let loss = TukeyBiweightLoss::new(1.0)?;
        let residual = DVector::from_vec(vec![2.0, 0.0]);
        let corrector = Corrector::new(&loss, residual.norm_squared());

        let mut r = residual.clone();
        let mut j = DMatrix::identity(2, 2);
        corrector.correct_jacobian(&residual, &mut j);
        corrector.correct_residuals(&mut r);

        assert_eq!(r.norm(), 0.0);
        assert_eq!(j.norm(), 0.0);
        Ok(())
    }
}
