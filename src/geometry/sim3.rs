//! Sim3: 7-DoF similarity transformation (rotation + translation + scale).
//!
//! Monocular SLAM is scale-ambiguous, so loop closures and map merges are
//! expressed as similarity transforms. Points transform as
//! `p' = s * R * p + t`.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Identity transformation (no rotation, no translation, scale = 1).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from rotation matrix, translation, and scale.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Lift an SE3 to a similarity with unit scale.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Project down to SE3, folding the scale into the translation.
    ///
    /// This is the standard correction applied to keyframe poses after a
    /// pose-graph pass: `Tcw = [R | t/s]`.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Transform a point: `s * R * p + t`.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Inverse similarity: `(s, R, t)⁻¹ = (1/s, Rᵀ, -1/s · Rᵀ t)`.
    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            translation: -(inv_rot * self.translation) / self.scale,
            rotation: inv_rot,
            scale: 1.0 / self.scale,
        }
    }

    /// Composition: `self ∘ other`, applying `other` first.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    /// Minimal 7-vector error `[log R; t; log s]` of this transform.
    ///
    /// Used as the residual of essential-graph edges; exact only for small
    /// errors, which is what the optimizer sees near convergence.
    pub fn error_vector(&self) -> [f64; 7] {
        let w = self.rotation.scaled_axis();
        [
            w.x,
            w.y,
            w.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.2, -0.1, 0.5),
            translation: Vector3::new(0.3, 1.0, -2.0),
            scale: 1.7,
        }
    }

    #[test]
    fn test_inverse_round_trip() {
        let s = sample();
        let p = Vector3::new(1.0, -4.0, 2.5);

        let back = s.inverse().transform_point(&s.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_transform() {
        let a = sample();
        let b = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(-0.4, 0.3, 0.1),
            translation: Vector3::new(2.0, 0.0, 1.0),
            scale: 0.5,
        };
        let p = Vector3::new(0.7, 0.2, 3.0);

        let chained = a.transform_point(&b.transform_point(&p));
        let composed = a.compose(&b).transform_point(&p);
        assert_relative_eq!(chained, composed, epsilon = 1e-12);
    }

    #[test]
    fn test_identity_error_is_zero() {
        let e = Sim3::identity().error_vector();
        assert!(e.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_to_se3_folds_scale() {
        let s = sample();
        let se3 = s.to_se3();
        assert_relative_eq!(se3.translation * s.scale, s.translation, epsilon = 1e-12);
    }
}
