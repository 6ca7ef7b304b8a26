//! Two-view triangulation via the direct linear transform.

use nalgebra::{Matrix4, Vector2, Vector3};

use super::SE3;
use crate::features::Camera;

/// Triangulate a point from two normalized observations.
///
/// `pose1` and `pose2` are `Tcw` poses; `xn1`/`xn2` are the observations in
/// normalized image coordinates (after removing the intrinsics). Returns the
/// world point, or `None` when the linear system is degenerate.
pub fn triangulate(
    pose1: &SE3,
    pose2: &SE3,
    xn1: &Vector2<f64>,
    xn2: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let p1 = pose1.to_matrix();
    let p2 = pose2.to_matrix();

    let mut a = Matrix4::zeros();
    a.set_row(0, &(xn1.x * p1.row(2) - p1.row(0)));
    a.set_row(1, &(xn1.y * p1.row(2) - p1.row(1)));
    a.set_row(2, &(xn2.x * p2.row(2) - p2.row(0)));
    a.set_row(3, &(xn2.y * p2.row(2) - p2.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);
    if h[3].abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

/// Parallax angle (radians) of a world point seen from two camera centers.
pub fn parallax(point: &Vector3<f64>, center1: &Vector3<f64>, center2: &Vector3<f64>) -> f64 {
    let d1 = point - center1;
    let d2 = point - center2;
    let denom = d1.norm() * d2.norm();
    if denom < 1e-12 {
        return 0.0;
    }
    (d1.dot(&d2) / denom).clamp(-1.0, 1.0).acos()
}

/// Validate a triangulated point against both views.
///
/// Checks positive depth in both cameras and a reprojection error below
/// `max_err_px` (scaled by the keypoint's pyramid level by the caller).
pub fn check_triangulation(
    point: &Vector3<f64>,
    pose1: &SE3,
    pose2: &SE3,
    px1: &Vector2<f64>,
    px2: &Vector2<f64>,
    camera: &Camera,
    max_err_px: f64,
) -> bool {
    for (pose, px) in [(pose1, px1), (pose2, px2)] {
        let pc = pose.transform_point(point);
        if pc.z <= 0.0 {
            return false;
        }
        let u = camera.fx * pc.x / pc.z + camera.cx;
        let v = camera.fy * pc.y / pc.z + camera.cy;
        let err = Vector2::new(u - px.x, v - px.y).norm();
        if err > max_err_px {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_triangulate_recovers_point() {
        let pose1 = SE3::identity();
        let pose2 = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-1.0, 0.0, 0.0), // baseline along x
        };
        let p = Vector3::new(0.3, -0.2, 4.0);

        let pc1 = pose1.transform_point(&p);
        let pc2 = pose2.transform_point(&p);
        let xn1 = Vector2::new(pc1.x / pc1.z, pc1.y / pc1.z);
        let xn2 = Vector2::new(pc2.x / pc2.z, pc2.y / pc2.z);

        let rec = triangulate(&pose1, &pose2, &xn1, &xn2).unwrap();
        assert_relative_eq!(rec, p, epsilon = 1e-9);
    }

    #[test]
    fn test_parallax_is_symmetric() {
        let p = Vector3::new(0.0, 0.0, 5.0);
        let c1 = Vector3::zeros();
        let c2 = Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(parallax(&p, &c1, &c2), parallax(&p, &c2, &c1), epsilon = 1e-12);
        assert!(parallax(&p, &c1, &c2) > 0.0);
    }
}
