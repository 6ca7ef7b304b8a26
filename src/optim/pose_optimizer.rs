//! Pose-only optimization of a tracked frame.
//!
//! Gauss-Newton over the 6-DoF camera pose with a Huber kernel, holding the
//! landmarks fixed. Runs four rounds, reclassifying outliers against the
//! chi²(0.95, 2 dof) threshold between rounds, the way frame tracking
//! expects: outliers are flagged on the frame but left associated so the
//! caller decides whether to discard them.

use nalgebra::{Matrix2x6, Matrix6, Vector2, Vector3, Vector6};

use crate::map::{Frame, Map};

/// chi²(0.95) for two degrees of freedom.
pub const CHI2_MONO: f64 = 5.991;

const ROUNDS: usize = 4;
const ITERATIONS_PER_ROUND: usize = 10;

struct Measurement {
    keypoint_idx: usize,
    point: Vector3<f64>,
    obs: Vector2<f64>,
    inv_sigma2: f64,
}

/// Optimize `frame.pose_cw` over its landmark matches.
///
/// Returns the number of inlier matches; `frame.outliers` is updated in
/// place. A frame without pose or with fewer than 3 matches is left
/// untouched.
pub fn optimize_pose(frame: &mut Frame, map: &Map) -> usize {
    let Some(mut pose) = frame.pose_cw.clone() else {
        return 0;
    };

    let mut measurements = Vec::new();
    for (idx, lm_id) in frame.landmarks.iter().enumerate() {
        let Some(lm_id) = lm_id else { continue };
        let Some(lm) = map.landmark(*lm_id) else {
            continue;
        };
        let kp = &frame.keypoints[idx];
        measurements.push(Measurement {
            keypoint_idx: idx,
            point: lm.position,
            obs: Vector2::new(kp.x, kp.y),
            inv_sigma2: 1.0 / frame.pyramid.sigma2_of(kp.octave),
        });
    }
    if measurements.len() < 3 {
        return 0;
    }

    let huber_delta = CHI2_MONO.sqrt();
    let mut outlier = vec![false; measurements.len()];

    for round in 0..ROUNDS {
        for _ in 0..ITERATIONS_PER_ROUND {
            let mut h = Matrix6::<f64>::zeros();
            let mut b = Vector6::<f64>::zeros();
            let mut n_terms = 0usize;

            for (m_idx, m) in measurements.iter().enumerate() {
                if outlier[m_idx] {
                    continue;
                }
                let Some((residual, jacobian)) = reprojection_terms(&pose, m, frame) else {
                    continue;
                };

                // Huber weight on the whitened residual norm.
                let w_sigma = m.inv_sigma2;
                let r_norm = (residual.norm_squared() * w_sigma).sqrt();
                let huber_w = if r_norm <= huber_delta {
                    1.0
                } else {
                    huber_delta / r_norm
                };
                let w = w_sigma * huber_w;

                h += jacobian.transpose() * jacobian * w;
                b += jacobian.transpose() * residual * w;
                n_terms += 1;
            }

            if n_terms < 3 {
                break;
            }
            let Some(delta) = h.lu().solve(&(-b)) else {
                break;
            };
            if delta.norm() < 1e-10 {
                break;
            }
            let update = crate::geometry::SE3::exp(
                &Vector3::new(delta[0], delta[1], delta[2]),
                &Vector3::new(delta[3], delta[4], delta[5]),
            );
            pose = update.compose(&pose);
        }

        // Reclassify between rounds; points may come back in.
        for (m_idx, m) in measurements.iter().enumerate() {
            let chi2 = match reprojection_terms(&pose, m, frame) {
                Some((residual, _)) => residual.norm_squared() * m.inv_sigma2,
                None => f64::INFINITY,
            };
            outlier[m_idx] = chi2 > CHI2_MONO;
        }
        let inliers = outlier.iter().filter(|o| !**o).count();
        if inliers < 3 && round + 1 < ROUNDS {
            break;
        }
    }

    let mut n_inliers = 0usize;
    for (m_idx, m) in measurements.iter().enumerate() {
        frame.outliers[m.keypoint_idx] = outlier[m_idx];
        if !outlier[m_idx] {
            n_inliers += 1;
        }
    }
    frame.pose_cw = Some(pose);
    n_inliers
}

/// Residual and 2×6 Jacobian of one reprojection term at the current pose.
///
/// The Jacobian is with respect to a left-multiplied se3 increment
/// `[ω; v]`: `∂p_c/∂ω = -[p_c]×`, `∂p_c/∂v = I`.
fn reprojection_terms(
    pose: &crate::geometry::SE3,
    m: &Measurement,
    frame: &Frame,
) -> Option<(Vector2<f64>, Matrix2x6<f64>)> {
    let pc = pose.transform_point(&m.point);
    if pc.z <= 1e-6 {
        return None;
    }
    let (fx, fy) = (frame.camera.fx, frame.camera.fy);
    let (x, y, z) = (pc.x, pc.y, pc.z);
    let inv_z = 1.0 / z;
    let inv_z2 = inv_z * inv_z;

    let u = fx * x * inv_z + frame.camera.cx;
    let v = fy * y * inv_z + frame.camera.cy;
    let residual = Vector2::new(u - m.obs.x, v - m.obs.y);

    // Columns [ωx ωy ωz vx vy vz]; the rotation block is A·(-[p_c]×) with
    // A = d(u,v)/dp_c.
    let jacobian = Matrix2x6::new(
        -fx * x * y * inv_z2,
        fx * (1.0 + x * x * inv_z2),
        -fx * y * inv_z,
        fx * inv_z,
        0.0,
        -fx * x * inv_z2,
        -fy * (1.0 + y * y * inv_z2),
        fy * x * y * inv_z2,
        fy * x * inv_z,
        0.0,
        fy * inv_z,
        -fy * y * inv_z2,
    );

    Some((residual, jacobian))
}
