//! SE3: rigid transformation (rotation + translation).
//!
//! Poses throughout the system are stored as `Tcw` (world → camera) unless a
//! name says otherwise. Inverse, composition and point transformation are
//! total functions, so callers never handle raw 4×4 matrices.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// Rigid transform: `p' = R * p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a rotation matrix and translation vector.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Rotation as a 3×3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 4×4 matrix `[R | t; 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Inverse transform: `(R, t)⁻¹ = (Rᵀ, -Rᵀ t)`.
    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            translation: -(inv_rot * self.translation),
            rotation: inv_rot,
        }
    }

    /// Composition: `self ∘ other`, applying `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a point: `R * p + t`.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Camera center in world coordinates for a `Tcw` pose: `-Rᵀ t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Quaternion `(x, y, z, w)` of the rotation, the order used by the
    /// trajectory files.
    pub fn quaternion_xyzw(&self) -> [f64; 4] {
        let q = self.rotation.quaternion();
        [q.i, q.j, q.k, q.w]
    }

    /// Exponential map of a 6-vector `[ω; v]` (rotation first).
    ///
    /// Used by the optimizers to apply small incremental updates.
    pub fn exp(omega: &Vector3<f64>, v: &Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_scaled_axis(*omega);
        Self {
            rotation,
            translation: *v,
        }
    }
}
