//! Unary prior on a single parameter block.

use super::Residual;
use crate::manifold::{Pose3, SO3, so3::right_jacobian_inv};
use nalgebra::{DMatrix, DVector, Quaternion, UnitQuaternion, Vector3};

#[derive(Debug, Clone)]
enum PriorTarget {
    Euclidean(DVector<f64>),
    Pose(Pose3),
}

/// Prior belief about one block's value.
///
/// - Euclidean blocks: `r = x − x̂`, `J = I`.
/// - Pose blocks: `r = [Log(q̂⁻¹ ⊗ q); p − p̂]`, `J = diag(J_r⁻¹(r_θ), I)`.
///
/// A prior on a pose is an alternative to [`Problem::set_constant`] for removing gauge
/// freedom: it pins the block softly instead of freezing it.
///
/// [`Problem::set_constant`]: crate::core::problem::Problem::set_constant
#[derive(Debug, Clone)]
pub struct PriorResidual {
    target: PriorTarget,
    information: Option<DMatrix<f64>>,
}

impl PriorResidual {
    /// Prior on a Euclidean block.
    pub fn euclidean(prior: DVector<f64>) -> Self {
        Self {
            target: PriorTarget::Euclidean(prior),
            information: None,
        }
    }

    /// Prior on a pose block (`ProductManifold::pose3`).
    pub fn pose(prior: Pose3) -> Self {
        Self {
            target: PriorTarget::Pose(prior),
            information: None,
        }
    }

    /// Replace the default identity information.
    pub fn with_information(mut self, information: DMatrix<f64>) -> Self {
        self.information = Some(information);
        self
    }
}

impl Residual for PriorResidual {
    fn residual_dimension(&self) -> usize {
        match &self.target {
            PriorTarget::Euclidean(prior) => prior.len(),
            PriorTarget::Pose(_) => Pose3::DOF,
        }
    }

    fn num_parameter_blocks(&self) -> usize {
        1
    }

    fn evaluate(
        &self,
        params: &[&DVector<f64>],
        compute_jacobians: bool,
    ) -> (DVector<f64>, Option<Vec<DMatrix<f64>>>) {
        let x = params[0];

        match &self.target {
            PriorTarget::Euclidean(prior) => {
                let residual = x - prior;
                let jacobians = compute_jacobians
                    .then(|| vec![DMatrix::identity(prior.len(), prior.len())]);
                (residual, jacobians)
            }
            PriorTarget::Pose(prior) => {
                let rotation =
                    UnitQuaternion::from_quaternion(Quaternion::new(x[3], x[0], x[1], x[2]));
                let rotation_error = SO3::new(prior.rotation.inverse() * rotation).log();
                let translation_error = Vector3::new(x[4], x[5], x[6]) - prior.translation;

                let mut residual = DVector::zeros(6);
                residual.fixed_rows_mut::<3>(0).copy_from(&rotation_error);
                residual.fixed_rows_mut::<3>(3).copy_from(&translation_error);

                let jacobians = compute_jacobians.then(|| {
                    let mut jacobian = DMatrix::identity(6, 6);
                    jacobian
                        .fixed_view_mut::<3, 3>(0, 0)
                        .copy_from(&right_jacobian_inv(&rotation_error));
                    vec![jacobian]
                });
                (residual, jacobians)
            }
        }
    }

    fn information(&self) -> DMatrix<f64> {
        self.information.clone().unwrap_or_else(|| {
            DMatrix::identity(self.residual_dimension(), self.residual_dimension())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{NUMERIC_DIFF_STEP, numeric_jacobians};
    use crate::manifold::{Euclidean, ProductManifold};
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    #[test]
    fn test_euclidean_prior() {
        let prior = PriorResidual::euclidean(dvector![1.0, 2.0]);
        let x = dvector![1.5, 2.3];
        let (r, jacobians) = prior.evaluate(&[&x], true);

        assert_relative_eq!(r, dvector![0.5, 0.3], epsilon = 1e-12);
        assert_eq!(jacobians.expect("requested")[0], DMatrix::identity(2, 2));

        let numeric = numeric_jacobians(&prior, &[&x], &[&Euclidean::new(2)], NUMERIC_DIFF_STEP);
        assert_relative_eq!(numeric[0], DMatrix::identity(2, 2), epsilon = 1e-8);
    }

    #[test]
    fn test_pose_prior_jacobian_matches_numeric() {
        let prior_pose = Pose3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            Vector3::new(1.0, 0.0, -1.0),
        );
        let current = Pose3::new(
            UnitQuaternion::from_euler_angles(0.5, -0.3, 0.9),
            Vector3::new(0.0, 2.0, 1.0),
        )
        .to_vector();

        let prior = PriorResidual::pose(prior_pose);
        let (r, analytic) = prior.evaluate(&[&current], true);
        assert_eq!(r.len(), 6);

        let manifold = ProductManifold::pose3();
        let numeric = numeric_jacobians(&prior, &[&current], &[&manifold], NUMERIC_DIFF_STEP);
        assert_relative_eq!(analytic.expect("requested")[0], numeric[0], epsilon = 1e-6);
    }

    #[test]
    fn test_pose_prior_is_zero_at_prior() {
        let prior_pose = Pose3::new(
            UnitQuaternion::from_euler_angles(-0.7, 0.2, 2.0),
            Vector3::new(3.0, 1.0, 0.5),
        );
        let prior = PriorResidual::pose(prior_pose);
        let (r, _) = prior.evaluate(&[&prior_pose.to_vector()], false);
        assert!(r.norm() < 1e-12);
    }

    #[test]
    fn test_custom_information() {
        let prior = PriorResidual::euclidean(dvector![0.0]).with_information(DMatrix::from_element(1, 1, 9.0));
        assert_eq!(prior.information()[(0, 0)], 9.0);
    }
}
