//! Bundle adjustment: local (keyframe + covisibles) and global.
//!
//! Follows a three-phase locking pattern: COLLECT a problem snapshot under
//! the map lock, SOLVE without holding any lock, APPLY the results under the
//! lock again. The solver checks an interrupt callback between iterations so
//! Tracking can abort an in-flight local adjustment.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3};

use crate::features::Camera;
use crate::geometry::SE3;
use crate::map::{KeyFrameId, LandmarkId, Map};

use super::pose_optimizer::CHI2_MONO;

pub struct BaPose {
    pub kf_id: KeyFrameId,
    pub pose_cw: SE3,
    pub fixed: bool,
}

pub struct BaPoint {
    pub lm_id: LandmarkId,
    pub position: Vector3<f64>,
}

pub struct BaObservation {
    pub pose_idx: usize,
    pub point_idx: usize,
    pub obs: Vector2<f64>,
    pub inv_sigma2: f64,
}

pub struct BaProblem {
    pub poses: Vec<BaPose>,
    pub points: Vec<BaPoint>,
    pub observations: Vec<BaObservation>,
    pub camera: Camera,
}

pub struct BaResult {
    pub poses: Vec<(KeyFrameId, SE3)>,
    pub points: Vec<(LandmarkId, Vector3<f64>)>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// COLLECT phase for local BA: the keyframe, its covisibles (optimized) and
/// the second-order covisibles (fixed), with all landmarks they observe.
pub fn collect_local_ba(map: &Map, kf_id: KeyFrameId) -> Option<BaProblem> {
    let center = map.keyframe(kf_id)?;
    let camera = center.camera;

    let mut optimized: Vec<KeyFrameId> = vec![kf_id];
    optimized.extend(
        center
            .covisibility_weights()
            .keys()
            .copied()
            .filter(|id| map.keyframe(*id).is_some()),
    );
    optimized.sort();
    optimized.dedup();

    build_problem(map, &optimized, camera)
}

/// COLLECT phase for global BA over every keyframe and landmark of a map.
pub fn collect_global_ba(map: &Map) -> Option<BaProblem> {
    let ids = map.keyframe_ids();
    let camera = map.keyframe(*ids.first()?)?.camera;
    let mut sorted = ids;
    sorted.sort();
    build_problem(map, &sorted, camera)
}

fn build_problem(map: &Map, optimized: &[KeyFrameId], camera: Camera) -> Option<BaProblem> {
    let origin = map.origin_keyframe();
    let optimized_set: HashMap<KeyFrameId, usize> = optimized
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();

    let mut poses: Vec<BaPose> = optimized
        .iter()
        .filter_map(|&id| {
            let kf = map.keyframe(id)?;
            Some(BaPose {
                kf_id: id,
                pose_cw: kf.pose_cw.clone(),
                // The map origin pins the gauge.
                fixed: Some(id) == origin,
            })
        })
        .collect();

    // Landmarks observed by the optimized keyframes.
    let mut point_index: HashMap<LandmarkId, usize> = HashMap::new();
    let mut points: Vec<BaPoint> = Vec::new();
    for &kf_id in optimized {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        for (_, lm_id) in kf.landmark_indices() {
            if point_index.contains_key(&lm_id) {
                continue;
            }
            if let Some(lm) = map.landmark(lm_id) {
                point_index.insert(lm_id, points.len());
                points.push(BaPoint {
                    lm_id,
                    position: lm.position,
                });
            }
        }
    }
    if points.is_empty() {
        return None;
    }

    // Fixed second-order keyframes: observers of the points outside the
    // optimized window.
    let mut pose_index = optimized_set.clone();
    let mut observations = Vec::new();
    for point in &points {
        let Some(lm) = map.landmark(point.lm_id) else {
            continue;
        };
        for (&obs_kf, &kp_idx) in &lm.observations {
            let Some(kf) = map.keyframe(obs_kf) else {
                continue;
            };
            let pose_idx = match pose_index.get(&obs_kf) {
                Some(&i) => i,
                None => {
                    let i = poses.len();
                    poses.push(BaPose {
                        kf_id: obs_kf,
                        pose_cw: kf.pose_cw.clone(),
                        fixed: true,
                    });
                    pose_index.insert(obs_kf, i);
                    i
                }
            };
            let Some(kp) = kf.keypoints.get(kp_idx) else {
                continue;
            };
            observations.push(BaObservation {
                pose_idx,
                point_idx: point_index[&point.lm_id],
                obs: Vector2::new(kp.x, kp.y),
                inv_sigma2: 1.0 / kf.pyramid.sigma2_of(kp.octave),
            });
        }
    }
    if observations.is_empty() {
        return None;
    }

    // At least one pose must stay fixed to pin the gauge.
    if poses.iter().all(|p| !p.fixed) {
        poses[0].fixed = true;
    }

    Some(BaProblem {
        poses,
        points,
        observations,
        camera,
    })
}

/// SOLVE phase: damped Gauss-Newton with the point block eliminated by a
/// Schur complement. Aborts between iterations when `interrupt` fires,
/// returning whatever progress was made.
pub fn solve_ba(
    problem: &BaProblem,
    max_iterations: usize,
    interrupt: &dyn Fn() -> bool,
) -> Option<BaResult> {
    let n_points = problem.points.len();

    // Free-pose indexing.
    let free: Vec<usize> = problem
        .poses
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.fixed)
        .map(|(i, _)| i)
        .collect();
    if free.is_empty() || n_points == 0 {
        return None;
    }
    let free_of: HashMap<usize, usize> = free.iter().enumerate().map(|(f, &i)| (i, f)).collect();

    let mut poses: Vec<SE3> = problem.poses.iter().map(|p| p.pose_cw.clone()).collect();
    let mut points: Vec<Vector3<f64>> = problem.points.iter().map(|p| p.position).collect();

    let initial_error = mean_chi2(problem, &poses, &points);
    let mut error = initial_error;
    let mut lambda = 1e-4;
    let mut iterations = 0usize;

    for _ in 0..max_iterations {
        if interrupt() {
            break;
        }

        let Some((new_poses, new_points)) =
            gauss_newton_step(problem, &poses, &points, &free, &free_of, lambda)
        else {
            break;
        };
        let new_error = mean_chi2(problem, &new_poses, &new_points);
        if new_error < error {
            poses = new_poses;
            points = new_points;
            if (error - new_error) < 1e-8 * error.max(1e-12) {
                error = new_error;
                iterations += 1;
                break;
            }
            error = new_error;
            lambda = (lambda * 0.5).max(1e-9);
        } else {
            lambda *= 10.0;
            if lambda > 1e4 {
                break;
            }
        }
        iterations += 1;
    }

    Some(BaResult {
        poses: free
            .iter()
            .map(|&i| (problem.poses[i].kf_id, poses[i].clone()))
            .collect(),
        points: problem
            .points
            .iter()
            .zip(points.iter())
            .map(|(p, pos)| (p.lm_id, *pos))
            .collect(),
        iterations,
        initial_error,
        final_error: error,
    })
}

/// APPLY phase: write optimized poses and positions back into the map.
///
/// Returns the number of updated entities.
pub fn apply_ba_results(map: &mut Map, result: &BaResult) -> usize {
    let mut updated = 0usize;
    for (kf_id, pose) in &result.poses {
        if map.keyframe(*kf_id).is_some() {
            map.set_keyframe_pose(*kf_id, pose.clone());
            updated += 1;
        }
    }
    for (lm_id, position) in &result.points {
        if let Some(lm) = map.landmark_mut(*lm_id) {
            lm.position = *position;
            updated += 1;
        }
    }
    updated
}

fn mean_chi2(problem: &BaProblem, poses: &[SE3], points: &[Vector3<f64>]) -> f64 {
    let mut total = 0.0;
    let mut n = 0usize;
    for obs in &problem.observations {
        let pc = poses[obs.pose_idx].transform_point(&points[obs.point_idx]);
        let chi2 = match problem.camera.project(&pc) {
            Some(px) => (px - obs.obs).norm_squared() * obs.inv_sigma2,
            None => CHI2_MONO * 4.0,
        };
        // Cap each term so gross outliers cannot dominate the score.
        total += chi2.min(CHI2_MONO * 4.0);
        n += 1;
    }
    if n == 0 {
        f64::INFINITY
    } else {
        total / n as f64
    }
}

#[allow(clippy::too_many_arguments)]
fn gauss_newton_step(
    problem: &BaProblem,
    poses: &[SE3],
    points: &[Vector3<f64>],
    free: &[usize],
    free_of: &HashMap<usize, usize>,
    lambda: f64,
) -> Option<(Vec<SE3>, Vec<Vector3<f64>>)> {
    let n_free = free.len();
    let n_points = points.len();
    let dim_c = 6 * n_free;

    let mut h_cc = DMatrix::<f64>::zeros(dim_c, dim_c);
    let mut b_c = DVector::<f64>::zeros(dim_c);
    let mut h_pp = vec![Matrix3::<f64>::zeros(); n_points];
    let mut b_p = vec![Vector3::<f64>::zeros(); n_points];
    // Off-diagonal blocks, grouped per point: (free pose idx, 6x3 block).
    let mut h_cp: Vec<Vec<(usize, nalgebra::Matrix6x3<f64>)>> = vec![Vec::new(); n_points];

    let huber_delta = CHI2_MONO.sqrt();

    for obs in &problem.observations {
        let pose = &poses[obs.pose_idx];
        let pw = &points[obs.point_idx];
        let pc = pose.transform_point(pw);
        if pc.z <= 1e-6 {
            continue;
        }
        let (fx, fy) = (problem.camera.fx, problem.camera.fy);
        let (x, y, z) = (pc.x, pc.y, pc.z);
        let inv_z = 1.0 / z;
        let inv_z2 = inv_z * inv_z;

        let u = fx * x * inv_z + problem.camera.cx;
        let v = fy * y * inv_z + problem.camera.cy;
        let r = Vector2::new(u - obs.obs.x, v - obs.obs.y);

        let r_norm = (r.norm_squared() * obs.inv_sigma2).sqrt();
        let huber_w = if r_norm <= huber_delta {
            1.0
        } else {
            huber_delta / r_norm
        };
        let w = obs.inv_sigma2 * huber_w;

        let a = Matrix2x3::new(fx * inv_z, 0.0, -fx * x * inv_z2, 0.0, fy * inv_z, -fy * y * inv_z2);
        // Point Jacobian: dp_c/dp_w = R.
        let j_p = a * pose.rotation_matrix();

        h_pp[obs.point_idx] += j_p.transpose() * j_p * w;
        b_p[obs.point_idx] += j_p.transpose() * r * w;

        if let Some(&f_idx) = free_of.get(&obs.pose_idx) {
            let j_c = Matrix2x6::new(
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
            let block = j_c.transpose() * j_c * w;
            for r_i in 0..6 {
                for c_i in 0..6 {
                    h_cc[(6 * f_idx + r_i, 6 * f_idx + c_i)] += block[(r_i, c_i)];
                }
            }
            let g = j_c.transpose() * r * w;
            for r_i in 0..6 {
                b_c[6 * f_idx + r_i] += g[r_i];
            }
            h_cp[obs.point_idx].push((f_idx, j_c.transpose() * j_p * w));
        }
    }

    // Damp and invert the point blocks.
    let mut h_pp_inv = Vec::with_capacity(n_points);
    for block in h_pp.iter() {
        let mut damped = *block;
        for d in 0..3 {
            let v = damped[(d, d)];
            damped[(d, d)] = v + lambda * (1.0 + v);
        }
        h_pp_inv.push(damped.try_inverse().unwrap_or_else(Matrix3::zeros));
    }

    // Schur complement: S = Hcc - Σ Hcp Hpp⁻¹ Hpc, rhs = bc - Σ Hcp Hpp⁻¹ bp.
    let mut s = h_cc;
    let mut rhs = b_c;
    for p_idx in 0..n_points {
        let inv = &h_pp_inv[p_idx];
        for (fi, block_i) in &h_cp[p_idx] {
            let wi = block_i * inv;
            let contrib = wi * b_p[p_idx];
            for r_i in 0..6 {
                rhs[6 * fi + r_i] -= contrib[r_i];
            }
            for (fj, block_j) in &h_cp[p_idx] {
                let reduce = wi * block_j.transpose();
                for r_i in 0..6 {
                    for c_i in 0..6 {
                        s[(6 * fi + r_i, 6 * fj + c_i)] -= reduce[(r_i, c_i)];
                    }
                }
            }
        }
    }
    for d in 0..dim_c {
        let v = s[(d, d)];
        s[(d, d)] = v + lambda * (1.0 + v);
    }

    let delta_c = s.lu().solve(&(-rhs))?;

    // Back-substitute the point updates:
    // δp = Hpp⁻¹ (-bp - Hpc δc).
    let mut new_points = points.to_vec();
    for p_idx in 0..n_points {
        let mut acc = -b_p[p_idx];
        for (fi, block) in &h_cp[p_idx] {
            let dc = nalgebra::Vector6::from_iterator((0..6).map(|k| delta_c[6 * fi + k]));
            acc -= block.transpose() * dc;
        }
        new_points[p_idx] += h_pp_inv[p_idx] * acc;
    }

    let mut new_poses = poses.to_vec();
    for (f_idx, &pose_idx) in free.iter().enumerate() {
        let d = |k: usize| delta_c[6 * f_idx + k];
        let update = SE3::exp(
            &Vector3::new(d(0), d(1), d(2)),
            &Vector3::new(d(3), d(4), d(5)),
        );
        new_poses[pose_idx] = update.compose(&poses[pose_idx]);
    }

    Some((new_poses, new_points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::map::{Frame, KeyFrame, MapId};
    use nalgebra::UnitQuaternion;

    fn camera() -> Camera {
        Camera {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            width: 640,
            height: 480,
        }
    }

    /// Two keyframes observing a noisy grid of points; BA should pull the
    /// reprojection error down.
    #[test]
    fn test_global_ba_reduces_error() {
        let cam = camera();
        let pose0 = SE3::identity();
        let pose1 = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-0.5, 0.0, 0.0),
        };

        let world: Vec<Vector3<f64>> = (0..25)
            .map(|i| {
                Vector3::new(
                    (i % 5) as f64 * 0.5 - 1.0,
                    (i / 5) as f64 * 0.5 - 1.0,
                    4.0 + (i % 3) as f64 * 0.2,
                )
            })
            .collect();

        let mut map = Map::new(MapId::next());
        let mut kf_ids = Vec::new();
        for pose in [&pose0, &pose1] {
            let keypoints: Vec<KeyPoint> = world
                .iter()
                .map(|p| {
                    let px = cam.project(&pose.transform_point(p)).unwrap();
                    KeyPoint {
                        x: px.x,
                        y: px.y,
                        octave: 0,
                        angle: 0.0,
                    }
                })
                .collect();
            let features = Features {
                descriptors: vec![Descriptor([0u8; DESCRIPTOR_BYTES]); keypoints.len()],
                keypoints,
            };
            let mut frame = Frame::new(0, 0.0, features, cam, ScalePyramid::default());
            frame.pose_cw = Some(pose.clone());
            let kf = KeyFrame::from_frame(crate::map::KeyFrameId::next(), &frame, map.id);
            kf_ids.push(map.insert_keyframe(kf));
        }

        for (i, p) in world.iter().enumerate() {
            // Perturb the stored positions; observations stay exact.
            let noisy = p + Vector3::new(0.02, -0.015, 0.03);
            let lm = map.create_landmark(noisy, Descriptor([0u8; DESCRIPTOR_BYTES]), kf_ids[0]);
            map.associate(kf_ids[0], i, lm);
            map.associate(kf_ids[1], i, lm);
        }

        let problem = collect_global_ba(&map).unwrap();
        let result = solve_ba(&problem, 20, &|| false).unwrap();

        assert!(result.final_error < result.initial_error * 0.1);
        assert!(apply_ba_results(&mut map, &result) > 0);
    }

    #[test]
    fn test_interrupt_stops_early() {
        let cam = camera();
        let mut map = Map::new(MapId::next());
        let mut kf_ids = Vec::new();
        for tx in [0.0, -0.4] {
            let pose = SE3 {
                rotation: UnitQuaternion::identity(),
                translation: Vector3::new(tx, 0.0, 0.0),
            };
            let keypoints: Vec<KeyPoint> = (0..4)
                .map(|i| {
                    let p = Vector3::new(0.3 * i as f64, 0.1, 3.0);
                    let px = cam.project(&pose.transform_point(&p)).unwrap();
                    KeyPoint {
                        x: px.x,
                        y: px.y,
                        octave: 0,
                        angle: 0.0,
                    }
                })
                .collect();
            let features = Features {
                descriptors: vec![Descriptor([0u8; DESCRIPTOR_BYTES]); keypoints.len()],
                keypoints,
            };
            let mut frame = Frame::new(0, 0.0, features, cam, ScalePyramid::default());
            frame.pose_cw = Some(pose);
            let kf = KeyFrame::from_frame(crate::map::KeyFrameId::next(), &frame, map.id);
            kf_ids.push(map.insert_keyframe(kf));
        }
        for i in 0..4 {
            let lm = map.create_landmark(
                Vector3::new(0.3 * i as f64, 0.1, 3.0),
                Descriptor([0u8; DESCRIPTOR_BYTES]),
                kf_ids[0],
            );
            map.associate(kf_ids[0], i, lm);
            map.associate(kf_ids[1], i, lm);
        }

        let problem = collect_global_ba(&map).unwrap();
        let result = solve_ba(&problem, 20, &|| true).unwrap();
        assert_eq!(result.iterations, 0);
    }
}
