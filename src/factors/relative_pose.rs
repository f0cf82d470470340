//! Relative pose (odometry / loop closure) residual between two 3D poses.
//!
//! Both poses live on [`ProductManifold::pose3`](crate::manifold::ProductManifold::pose3),
//! so values are `[qx, qy, qz, qw, px, py, pz]` and tangents are `[δθ, δp]` with
//! `R ← R·Exp(δθ)` and `p ← p + δp`.
//!
//! # Residual
//!
//! ```text
//! q_ab = q_a⁻¹ ⊗ q_b
//! p_ab = R_aᵀ (p_b − p_a)
//! r    = [ Log(q̂⁻¹ ⊗ q_ab) ]   rotation error (3)
//!        [ p_ab − p̂        ]   translation error (3)
//! ```
//!
//! # Jacobians
//!
//! With `r_θ` the rotation error and `R_ab` the rotation of `q_ab`:
//!
//! ```text
//! ∂r/∂[δθ_a, δp_a] = [ −J_r⁻¹(r_θ)·R_abᵀ    0    ]
//!                    [ [p_ab]×             −R_aᵀ  ]
//!
//! ∂r/∂[δθ_b, δp_b] = [ J_r⁻¹(r_θ)    0    ]
//!                    [ 0             R_aᵀ ]
//! ```

use super::Residual;
use crate::manifold::{
    Pose3, SO3,
    so3::{hat, right_jacobian_inv},
};
use nalgebra::{DMatrix, DVector, Matrix6, Quaternion, UnitQuaternion, Vector3};

/// Measured relative pose `T̂_ab = T_a⁻¹ ∘ T_b` with a 6×6 information matrix ordered
/// `[rotation, translation]`.
#[derive(Debug, Clone)]
pub struct RelativePoseResidual {
    pub measurement: Pose3,
    pub information: Matrix6<f64>,
}

fn unpack_pose(x: &DVector<f64>) -> (UnitQuaternion<f64>, Vector3<f64>) {
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(x[3], x[0], x[1], x[2]));
    (rotation, Vector3::new(x[4], x[5], x[6]))
}

impl RelativePoseResidual {
    pub fn new(measurement: Pose3, information: Matrix6<f64>) -> Self {
        Self {
            measurement,
            information,
        }
    }

    /// Relative pose measurement with identity information.
    pub fn with_identity_information(measurement: Pose3) -> Self {
        Self::new(measurement, Matrix6::identity())
    }
}

impl Residual for RelativePoseResidual {
    fn residual_dimension(&self) -> usize {
        6
    }

    fn num_parameter_blocks(&self) -> usize {
        2
    }

    fn evaluate(
        &self,
        params: &[&DVector<f64>],
        compute_jacobians: bool,
    ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>) {
        let (q_a, p_a) = unpack_pose(params[0]);
        let (q_b, p_b) = unpack_pose(params[1]);

        let rotation_a_t = q_a.to_rotation_matrix().into_inner().transpose();
        let q_ab = q_a.inverse() * q_b;
        let p_ab = rotation_a_t * (p_b - p_a);

        let rotation_error = SO3::new(self.measurement.rotation.inverse() * q_ab).log();
        let translation_error = p_ab - self.measurement.translation;

        let mut residual = DVector::zeros(6);
        residual.fixed_rows_mut::<3>(0).copy_from(&rotation_error);
        residual.fixed_rows_mut::<3>(3).copy_from(&translation_error);

        if !compute_jacobians {
            return (residual, None);
        }

        let jr_inv = right_jacobian_inv(&rotation_error);
        let rotation_ab_t = q_ab.to_rotation_matrix().into_inner().transpose();

        let mut jacobian_a = DMatrix::zeros(6, 6);
        jacobian_a
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-jr_inv * rotation_ab_t));
        jacobian_a.fixed_view_mut::<3, 3>(3, 0).copy_from(&hat(&p_ab));
        jacobian_a
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(-rotation_a_t));

        let mut jacobian_b = DMatrix::zeros(6, 6);
        jacobian_b.fixed_view_mut::<3, 3>(0, 0).copy_from(&jr_inv);
        jacobian_b
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&rotation_a_t);

        (residual, Some(vec![jacobian_a, jacobian_b]))
    }

    fn information(&self) -> DMatrix<f64> {
        DMatrix::from_iterator(6, 6, self.information.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{NUMERIC_DIFF_STEP, numeric_jacobians};
    use crate::manifold::{Manifold, ProductManifold};
    use approx::assert_relative_eq;

    fn pose(roll: f64, pitch: f64, yaw: f64, x: f64, y: f64, z: f64) -> Pose3 {
        Pose3::new(
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
            Vector3::new(x, y, z),
        )
    }

    #[test]
    fn test_zero_residual_at_measurement() {
        let a = pose(0.1, 0.2, -0.3, 1.0, 2.0, 3.0);
        let b = pose(-0.4, 0.1, 0.8, 0.5, -1.0, 2.0);
        let residual = RelativePoseResidual::with_identity_information(a.between(&b));

        let (r, _) = residual.evaluate(&[&a.to_vector(), &b.to_vector()], false);
        assert!(r.norm() < 1e-12, "residual {r}");
        assert_relative_eq!(
            a.between(&b).rotation_matrix(),
            a.rotation_matrix().transpose() * b.rotation_matrix(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_residual_order_is_rotation_then_translation() {
        let a = Pose3::identity();
        let b = pose(0.0, 0.0, 0.0, 1.0, 0.0, 0.0);
        let residual = RelativePoseResidual::with_identity_information(Pose3::identity());

        let (r, _) = residual.evaluate(&[&a.to_vector(), &b.to_vector()], false);
        assert_relative_eq!(
            r,
            DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_analytic_jacobians_match_numeric() {
        let manifold = ProductManifold::pose3();
        let a = pose(0.3, -0.2, 1.0, 1.0, -0.5, 0.25);
        let b = pose(-0.1, 0.4, 0.2, 2.0, 1.0, -1.0);
        // Off-measurement so the rotation error is not zero.
        let measurement = pose(0.05, 0.1, -0.2, 0.8, 0.3, -0.1);
        let residual = RelativePoseResidual::with_identity_information(measurement);

        let (va, vb) = (a.to_vector(), b.to_vector());
        let params = [&va, &vb];
        let (_, analytic) = residual.evaluate(&params, true);
        let analytic = analytic.expect("jacobians requested");
        let numeric = numeric_jacobians(
            &residual,
            &params,
            &[&manifold as &dyn Manifold, &manifold],
            NUMERIC_DIFF_STEP,
        );

        for (ja, jn) in analytic.iter().zip(&numeric) {
            assert_eq!(ja.shape(), (6, 6));
            assert_relative_eq!(ja, jn, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_jacobians_finite_at_half_turn_error() {
        let a = Pose3::identity();
        let b = pose(0.0, 0.0, std::f64::consts::PI, 1.0, 0.0, 0.0);
        let residual = RelativePoseResidual::with_identity_information(Pose3::identity());

        let (r, jacobians) = residual.evaluate(&[&a.to_vector(), &b.to_vector()], true);
        assert_relative_eq!(r.rows(0, 3).norm(), std::f64::consts::PI, epsilon = 1e-9);
        let jacobians = jacobians.expect("jacobians requested");
        for jacobian in &jacobians {
            assert!(jacobian.iter().all(|v| v.is_finite()), "jacobian {jacobian}");
        }
    }

    #[test]
    fn test_information_is_passed_through() {
        let information = Matrix6::from_diagonal(&nalgebra::Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0));
        let residual = RelativePoseResidual::new(Pose3::identity(), information);
        let dense = residual.information();
        for i in 0..6 {
            assert_eq!(dense[(i, i)], (i + 1) as f64);
        }
    }
}
