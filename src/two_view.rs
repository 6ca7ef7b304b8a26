//! Two-view reconstruction for map initialization.
//!
//! Recovers the relative pose of two views and triangulates the matched
//! points: eight-point essential-matrix estimate on normalized image
//! coordinates, then the four-way (R, t) decomposition disambiguated by
//! cheirality. The translation is up to scale; the initializer rescales the
//! map to unit median depth afterwards.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

use crate::geometry::{triangulation, SE3};

/// Minimum parallax for a triangulated point to count (about 0.6°).
const MIN_PARALLAX_COS: f64 = 0.99995;
/// Reprojection gate in normalized image coordinates.
const MAX_REPROJ_NORM: f64 = 0.006;

pub struct Reconstruction {
    /// Pose of the second view (`Tcw`, first view at identity).
    pub pose_cw: SE3,
    /// Triangulated world point per match; `None` where the checks failed.
    pub points: Vec<Option<Vector3<f64>>>,
    pub n_triangulated: usize,
}

/// Reconstruct relative geometry from matched normalized coordinates.
///
/// `xn1[i]` and `xn2[i]` are corresponding observations. Returns `None` when
/// there are too few matches or the geometry is degenerate.
pub fn reconstruct(xn1: &[Vector2<f64>], xn2: &[Vector2<f64>]) -> Option<Reconstruction> {
    let n = xn1.len();
    if n < 8 || n != xn2.len() {
        return None;
    }

    let e = estimate_essential(xn1, xn2)?;
    let candidates = decompose_essential(&e);

    let identity = SE3::identity();
    let mut best: Option<Reconstruction> = None;
    for (r, t) in candidates {
        let pose = SE3::from_rt(r, t);
        let mut points = vec![None; n];
        let mut n_good = 0usize;
        let c1 = Vector3::zeros();
        let c2 = pose.camera_center();

        for i in 0..n {
            let Some(p) = triangulation::triangulate(&identity, &pose, &xn1[i], &xn2[i]) else {
                continue;
            };
            if !p.iter().all(|v| v.is_finite()) {
                continue;
            }
            // Positive depth in both views.
            if p.z <= 0.0 || pose.transform_point(&p).z <= 0.0 {
                continue;
            }
            // Enough parallax to be well conditioned.
            let d1 = (p - c1).normalize();
            let d2 = (p - c2).normalize();
            if d1.dot(&d2) > MIN_PARALLAX_COS {
                continue;
            }
            // Reprojection in both views.
            let r1 = Vector2::new(p.x / p.z, p.y / p.z) - xn1[i];
            let pc2 = pose.transform_point(&p);
            let r2 = Vector2::new(pc2.x / pc2.z, pc2.y / pc2.z) - xn2[i];
            if r1.norm() > MAX_REPROJ_NORM || r2.norm() > MAX_REPROJ_NORM {
                continue;
            }
            points[i] = Some(p);
            n_good += 1;
        }

        if best.as_ref().map(|b| n_good > b.n_triangulated).unwrap_or(true) {
            best = Some(Reconstruction {
                pose_cw: pose,
                points,
                n_triangulated: n_good,
            });
        }
    }

    best.filter(|b| b.n_triangulated > 0)
}

/// Eight-point estimate of the essential matrix with Hartley conditioning.
fn estimate_essential(xn1: &[Vector2<f64>], xn2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let (t1, p1) = condition(xn1);
    let (t2, p2) = condition(xn2);

    let n = p1.len();
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for i in 0..n {
        let (x1, y1) = (p1[i].x, p1[i].y);
        let (x2, y2) = (p2[i].x, p2[i].y);
        let row = [x2 * x1, x2 * y1, x2, y2 * x1, y2 * y1, y2, x1, y1, 1.0];
        for (j, v) in row.iter().enumerate() {
            a[(i, j)] = *v;
        }
    }

    let ata = a.transpose() * &a;
    let eig = ata.symmetric_eigen();
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|l, r| l.1.partial_cmp(r.1).unwrap_or(std::cmp::Ordering::Equal))?
        .0;
    let v = eig.eigenvectors.column(min_idx);
    let e_cond = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    // Undo the conditioning and force the essential singular values.
    let e = t2.transpose() * e_cond * t1;
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let s = (svd.singular_values[0] + svd.singular_values[1]) * 0.5;
    Some(u * Matrix3::from_diagonal(&Vector3::new(s, s, 0.0)) * v_t)
}

/// Hartley normalization: zero centroid, mean distance √2.
fn condition(points: &[Vector2<f64>]) -> (Matrix3<f64>, Vec<Vector2<f64>>) {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let conditioned = points.iter().map(|p| (p - centroid) * scale).collect();
    (t, conditioned)
}

/// The four (R, t) candidates of an essential matrix.
fn decompose_essential(e: &Matrix3<f64>) -> Vec<(Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Vec::new();
    };
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let fix = |m: Matrix3<f64>| if m.determinant() < 0.0 { -m } else { m };
    let r1 = fix(u * w * v_t);
    let r2 = fix(u * w.transpose() * v_t);
    let t: Vector3<f64> = u.column(2).into_owned();
    let t = if t.norm() > 1e-12 { t.normalize() } else { t };

    vec![(r1, t), (r1, -t), (r2, t), (r2, -t)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    /// Project a synthetic cloud into two views and check the recovered
    /// geometry (up to the monocular scale).
    #[test]
    fn test_reconstruct_recovers_relative_pose() {
        let true_pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            translation: Vector3::new(-0.8, 0.05, 0.02),
        };

        let world: Vec<Vector3<f64>> = (0..60)
            .map(|i| {
                Vector3::new(
                    (i % 10) as f64 * 0.4 - 2.0,
                    (i / 10) as f64 * 0.5 - 1.5,
                    5.0 + ((i * 7) % 11) as f64 * 0.3,
                )
            })
            .collect();

        let xn1: Vec<Vector2<f64>> = world.iter().map(|p| Vector2::new(p.x / p.z, p.y / p.z)).collect();
        let xn2: Vec<Vector2<f64>> = world
            .iter()
            .map(|p| {
                let pc = true_pose.transform_point(p);
                Vector2::new(pc.x / pc.z, pc.y / pc.z)
            })
            .collect();

        let rec = reconstruct(&xn1, &xn2).expect("reconstruction");
        assert!(rec.n_triangulated >= 55);

        // Rotation is recovered exactly; translation up to scale.
        assert!(rec.pose_cw.rotation.angle_to(&true_pose.rotation) < 1e-4);
        let dir_est = rec.pose_cw.translation.normalize();
        let dir_true = true_pose.translation.normalize();
        assert!(dir_est.dot(&dir_true) > 0.9999);

        // Triangulated points match the world up to the same scale.
        let scale = true_pose.translation.norm() / rec.pose_cw.translation.norm();
        for (p_est, p_true) in rec.points.iter().zip(world.iter()) {
            if let Some(p) = p_est {
                assert!((p * scale - p_true).norm() < 0.05);
            }
        }
    }

    #[test]
    fn test_too_few_matches() {
        let pts: Vec<Vector2<f64>> = (0..5).map(|i| Vector2::new(i as f64, 0.0)).collect();
        assert!(reconstruct(&pts, &pts).is_none());
    }
}
