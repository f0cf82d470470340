//! SO3 - Special Orthogonal Group in 3D
//!
//! Rotations are stored as unit quaternions. The global parameter layout used by
//! [`QuaternionManifold`] is `[qx, qy, qz, qw]` (vector part first, scalar last), the same
//! order as the `x y z w` columns of the g2o and pose text formats.
//!
//! Tangent vectors are axis-angle vectors θ ∈ R³ (direction = axis, norm = angle). The
//! closed-form Jacobians follow "A micro Lie theory for state estimation in robotics"
//! (Solà et al.):
//!
//! ```text
//! Exp(θ)   = cos(|θ|/2) + sin(|θ|/2)·θ/|θ|
//! J_l(θ)   = I + (1 - cos|θ|)/|θ|²·[θ]× + (|θ| - sin|θ|)/|θ|³·[θ]ײ
//! J_l⁻¹(θ) = I - ½[θ]× + (1/|θ|² - (1 + cos|θ|)/(2|θ| sin|θ|))·[θ]ײ
//! J_r(θ)   = J_l(θ)ᵀ,  J_r⁻¹(θ) = J_l⁻¹(θ)ᵀ
//! ```

use crate::manifold::{Manifold, ManifoldError, ManifoldResult, ManifoldType};
use nalgebra::{DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// SO(3) group element representing rotations in 3D.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SO3 {
    quaternion: UnitQuaternion<f64>,
}

impl Display for SO3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let q = self.quaternion.quaternion();
        write!(
            f,
            "SO3(quaternion: [x: {:.4}, y: {:.4}, z: {:.4}, w: {:.4}])",
            q.i, q.j, q.k, q.w
        )
    }
}

impl SO3 {
    /// Degrees of freedom - dimension of the tangent space
    pub const DOF: usize = 3;

    /// Representation size - size of the stored coefficients
    pub const REP_SIZE: usize = 4;

    pub fn identity() -> Self {
        Self {
            quaternion: UnitQuaternion::identity(),
        }
    }

    pub fn new(quaternion: UnitQuaternion<f64>) -> Self {
        Self { quaternion }
    }

    /// Create SO(3) from Euler angles (roll, pitch, yaw).
    pub fn from_euler_angles(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self::new(UnitQuaternion::from_euler_angles(roll, pitch, yaw))
    }

    /// Read a rotation from the first four entries of a global value (`[qx, qy, qz, qw]`).
    pub fn from_slice(coeffs: &[f64]) -> ManifoldResult<Self> {
        if coeffs.len() < Self::REP_SIZE {
            return Err(ManifoldError::DimensionMismatch {
                expected: Self::REP_SIZE,
                actual: coeffs.len(),
            });
        }
        let q = Quaternion::new(coeffs[3], coeffs[0], coeffs[1], coeffs[2]);
        let norm = q.norm();
        if !norm.is_finite() {
            return Err(ManifoldError::InvalidNumber);
        }
        if norm < 1e-12 {
            return Err(ManifoldError::NormalizationFailed(format!(
                "quaternion norm {norm:.3e} is too small"
            )));
        }
        Ok(Self::new(UnitQuaternion::from_quaternion(q)))
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quaternion
    }

    /// Quaternion coefficients in `[x, y, z, w]` order.
    pub fn coeffs(&self) -> [f64; 4] {
        let q = self.quaternion.quaternion();
        [q.i, q.j, q.k, q.w]
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        Self::new(self.quaternion.inverse())
    }

    pub fn compose(&self, other: &Self) -> Self {
        Self::new(self.quaternion * other.quaternion)
    }

    /// Rotate a vector.
    pub fn act(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * vector
    }

    /// Exponential map from an axis-angle vector.
    pub fn exp(theta: &Vector3<f64>) -> Self {
        let theta_squared = theta.norm_squared();

        let quaternion = if theta_squared > f64::EPSILON {
            UnitQuaternion::from_scaled_axis(*theta)
        } else {
            UnitQuaternion::from_quaternion(Quaternion::new(
                1.0,
                theta.x / 2.0,
                theta.y / 2.0,
                theta.z / 2.0,
            ))
        };

        Self { quaternion }
    }

    /// Logarithmic map to an axis-angle vector with angle in `[0, π]`.
    pub fn log(&self) -> Vector3<f64> {
        let q = self.quaternion.quaternion();
        let sin_angle_squared = q.i * q.i + q.j * q.j + q.k * q.k;

        let log_coeff = if sin_angle_squared > f64::EPSILON {
            let sin_angle = sin_angle_squared.sqrt();
            let cos_angle = q.w;

            // q and -q encode the same rotation; pick the representative with w >= 0
            let two_angle = 2.0
                * if cos_angle < 0.0 {
                    f64::atan2(-sin_angle, -cos_angle)
                } else {
                    f64::atan2(sin_angle, cos_angle)
                };

            two_angle / sin_angle
        } else {
            2.0 * q.w.signum()
        };

        Vector3::new(q.i * log_coeff, q.j * log_coeff, q.k * log_coeff)
    }

    /// Angular distance to another rotation in radians.
    pub fn distance(&self, other: &Self) -> f64 {
        self.inverse().compose(other).log().norm()
    }

    pub fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.distance(other) < tolerance
    }
}

/// Skew-symmetric matrix `[v]×` such that `[v]× w = v × w`.
pub fn hat(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

pub fn left_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
    let angle_squared = theta.norm_squared();
    let skew = hat(theta);

    if angle_squared <= f64::EPSILON {
        Matrix3::identity() + 0.5 * skew
    } else {
        let angle = angle_squared.sqrt();
        Matrix3::identity()
            + (1.0 - angle.cos()) / angle_squared * skew
            + (angle - angle.sin()) / (angle_squared * angle) * skew * skew
    }
}

pub fn left_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
    let angle_squared = theta.norm_squared();
    let skew = hat(theta);

    if angle_squared <= f64::EPSILON {
        Matrix3::identity() - 0.5 * skew + skew * skew / 12.0
    } else {
        // (1 + cos θ) / sin θ = cot(θ/2), finite at θ = π
        let angle = angle_squared.sqrt();
        let half = 0.5 * angle;
        Matrix3::identity() - 0.5 * skew
            + (1.0 / angle_squared - half.cos() / (2.0 * angle * half.sin())) * skew * skew
    }
}

pub fn right_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
    left_jacobian(theta).transpose()
}

pub fn right_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
    left_jacobian_inv(theta).transpose()
}

/// SO(3) parameterization over quaternion coefficients `[qx, qy, qz, qw]`.
///
/// `apply_update(q, δ) = normalize(q ⊗ Exp(δ))`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuaternionManifold;

impl QuaternionManifold {
    pub fn new() -> Self {
        Self
    }
}

impl Manifold for QuaternionManifold {
    fn dimension_global(&self) -> usize {
        SO3::REP_SIZE
    }

    fn dimension_local(&self) -> usize {
        SO3::DOF
    }

    fn apply_update(&self, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
        if delta.iter().all(|d| *d == 0.0) {
            return x.clone();
        }

        let q = Quaternion::new(x[3], x[0], x[1], x[2]);
        let step = SO3::exp(&Vector3::new(delta[0], delta[1], delta[2]));
        let updated = (q * step.quaternion().into_inner()).normalize();

        DVector::from_vec(vec![updated.i, updated.j, updated.k, updated.w])
    }

    fn origin(&self) -> DVector<f64> {
        DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0])
    }

    fn normalize(&self, x: &DVector<f64>) -> ManifoldResult<DVector<f64>> {
        let rotation = SO3::from_slice(x.as_slice())?;
        Ok(DVector::from_row_slice(&rotation.coeffs()))
    }

    fn is_valid(&self, x: &DVector<f64>, tolerance: f64) -> bool {
        x.len() == SO3::REP_SIZE
            && x.iter().all(|v| v.is_finite())
            && (x.norm() - 1.0).abs() < tolerance
    }

    fn manifold_type(&self) -> ManifoldType {
        ManifoldType::SO3
    }
}
