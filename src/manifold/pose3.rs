//! Rigid 3D pose value type.
//!
//! `Pose3` is the value stored in a pose parameter block, laid out as
//! `[qx, qy, qz, qw, px, py, pz]` (see [`crate::manifold::ProductManifold::pose3`]).
//! The pose maps points from its body frame into the world frame: `x_w = R·x_b + p`.

use crate::manifold::{ManifoldError, ManifoldResult, SO3};
use nalgebra::{DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};
use std::fmt;

/// Rotation + translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl fmt::Display for Pose3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.rotation.quaternion();
        let t = &self.translation;
        write!(
            f,
            "Pose3(translation: [{:.4}, {:.4}, {:.4}], rotation: [x: {:.4}, y: {:.4}, z: {:.4}, w: {:.4}])",
            t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )
    }
}

impl Default for Pose3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose3 {
    /// Size of the stored 7-vector.
    pub const REP_SIZE: usize = 7;

    /// Degrees of freedom.
    pub const DOF: usize = 6;

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(UnitQuaternion::identity(), Vector3::zeros())
    }

    /// Build a pose from a translation and quaternion coefficients in `x, y, z, w` order.
    ///
    /// The quaternion is normalized.
    pub fn from_translation_quaternion(
        translation: Vector3<f64>,
        qx: f64,
        qy: f64,
        qz: f64,
        qw: f64,
    ) -> Self {
        Self::new(
            UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz)),
            translation,
        )
    }

    /// Read a pose from the `[qx, qy, qz, qw, px, py, pz]` layout.
    pub fn from_vector(x: &DVector<f64>) -> ManifoldResult<Self> {
        if x.len() != Self::REP_SIZE {
            return Err(ManifoldError::DimensionMismatch {
                expected: Self::REP_SIZE,
                actual: x.len(),
            });
        }
        let rotation = SO3::from_slice(&x.as_slice()[..4])?;
        Ok(Self::new(
            rotation.quaternion(),
            Vector3::new(x[4], x[5], x[6]),
        ))
    }

    /// Write the pose in the `[qx, qy, qz, qw, px, py, pz]` layout.
    pub fn to_vector(&self) -> DVector<f64> {
        let q = self.rotation.quaternion();
        let t = &self.translation;
        DVector::from_vec(vec![q.i, q.j, q.k, q.w, t.x, t.y, t.z])
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Self) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.rotation * other.translation + self.translation,
        )
    }

    pub fn inverse(&self) -> Self {
        let rotation_inv = self.rotation.inverse();
        Self::new(rotation_inv, -(rotation_inv * self.translation))
    }

    /// Relative pose `self⁻¹ ∘ other`, i.e. `other` expressed in the frame of `self`.
    pub fn between(&self, other: &Self) -> Self {
        self.inverse().compose(other)
    }

    /// Transform a point from the body frame into the world frame.
    pub fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    pub fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        SO3::new(self.rotation).is_approx(&SO3::new(other.rotation), tolerance)
            && (self.translation - other.translation).norm() < tolerance
    }
}
