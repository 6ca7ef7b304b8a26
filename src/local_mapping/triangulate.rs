//! New-landmark creation by epipolar search against covisible keyframes.
//!
//! For every unmatched keypoint of the fresh keyframe, candidate partners in
//! the top covisible keyframes are narrowed by vocabulary node, gated by the
//! epipolar constraint, triangulated, and validated for parallax, depth,
//! reprojection error and scale consistency.

use nalgebra::{Matrix3, Vector3};

use crate::geometry::{triangulation, SE3};
use crate::map::{KeyFrameId, LandmarkId, Map};
use crate::matching::TH_LOW;
use crate::optim::CHI2_MONO;

/// Covisible keyframes examined per new keyframe.
const NUM_NEIGHBORS: usize = 20;
/// Minimum baseline-to-depth ratio for a neighbor to be useful.
const MIN_BASELINE_RATIO: f64 = 0.01;
/// chi²(0.95, 1 dof) gate on the point-to-epipolar-line distance.
const EPIPOLAR_CHI2: f64 = 3.84;
/// Parallax below this cosine is too weak to triangulate.
const MAX_PARALLAX_COS: f64 = 0.9998;
/// Allowed slack between distance ratio and octave-scale ratio.
const SCALE_CONSISTENCY_FACTOR: f64 = 1.5;

/// Triangulate new landmarks for `kf_id`. Returns the created landmark ids.
pub fn triangulate_new_landmarks(map: &mut Map, kf_id: KeyFrameId) -> Vec<LandmarkId> {
    let Some(kf) = map.keyframe(kf_id) else {
        return Vec::new();
    };
    let neighbors = kf.best_covisibles_readonly(NUM_NEIGHBORS);
    let center1 = kf.camera_center();
    let mut created = Vec::new();

    for neighbor_id in neighbors {
        let Some(neighbor) = map.keyframe(neighbor_id) else {
            continue;
        };

        // Baseline must be significant against the scene depth.
        let baseline = (neighbor.camera_center() - center1).norm();
        let depth = map.median_scene_depth(neighbor_id);
        if depth <= 0.0 || baseline / depth < MIN_BASELINE_RATIO {
            continue;
        }

        let pairs = match_for_triangulation(map, kf_id, neighbor_id);
        let new_points = triangulate_pairs(map, kf_id, neighbor_id, &pairs);

        for (idx1, idx2, point) in new_points {
            let descriptor = map.keyframe(kf_id).unwrap().descriptors[idx1];
            let lm_id = map.create_landmark(point, descriptor, kf_id);
            map.associate(kf_id, idx1, lm_id);
            map.associate(neighbor_id, idx2, lm_id);
            map.refresh_landmark(lm_id);
            created.push(lm_id);
        }
    }

    if !created.is_empty() {
        map.update_connections(kf_id);
    }
    created
}

/// Unmatched-keypoint pairs between two keyframes that share a vocabulary
/// node and satisfy the epipolar constraint.
fn match_for_triangulation(map: &Map, kf1_id: KeyFrameId, kf2_id: KeyFrameId) -> Vec<(usize, usize)> {
    let (Some(kf1), Some(kf2)) = (map.keyframe(kf1_id), map.keyframe(kf2_id)) else {
        return Vec::new();
    };
    let (Some(fv1), Some(fv2)) = (kf1.feature_vec.as_ref(), kf2.feature_vec.as_ref()) else {
        return Vec::new();
    };

    // Fundamental matrix of the pair, in pixel coordinates.
    let rel = kf1.pose_cw.compose(&kf2.pose_cw.inverse());
    let f12 = fundamental_from_relative(&rel, kf1);

    let mut pairs = Vec::new();
    let mut taken2 = std::collections::HashSet::new();

    for (node, indices1) in fv1 {
        let Some(indices2) = fv2.get(node) else {
            continue;
        };
        for &i1 in indices1 {
            if kf1.landmark_at(i1).is_some() {
                continue;
            }
            let mut best: Option<(usize, u32)> = None;
            for &i2 in indices2 {
                if kf2.landmark_at(i2).is_some() || taken2.contains(&i2) {
                    continue;
                }
                let dist = kf1.descriptors[i1].distance(&kf2.descriptors[i2]);
                if dist > TH_LOW {
                    continue;
                }
                if !passes_epipolar(&f12, kf1, kf2, i1, i2) {
                    continue;
                }
                if best.map(|(_, d)| dist < d).unwrap_or(true) {
                    best = Some((i2, dist));
                }
            }
            if let Some((i2, _)) = best {
                taken2.insert(i2);
                pairs.push((i1, i2));
            }
        }
    }
    pairs
}

/// `F12 = K⁻ᵀ [t]× R K⁻¹` for the relative transform camera2 → camera1.
fn fundamental_from_relative(rel: &SE3, kf: &crate::map::KeyFrame) -> Matrix3<f64> {
    let t = rel.translation;
    let skew = Matrix3::new(0.0, -t.z, t.y, t.z, 0.0, -t.x, -t.y, t.x, 0.0);
    let e = skew * rel.rotation_matrix();
    let k = Matrix3::new(
        kf.camera.fx,
        0.0,
        kf.camera.cx,
        0.0,
        kf.camera.fy,
        kf.camera.cy,
        0.0,
        0.0,
        1.0,
    );
    let k_inv = k.try_inverse().unwrap_or_else(Matrix3::identity);
    k_inv.transpose() * e * k_inv
}

/// Distance of the second keypoint to the epipolar line of the first.
fn passes_epipolar(
    f12: &Matrix3<f64>,
    kf1: &crate::map::KeyFrame,
    kf2: &crate::map::KeyFrame,
    i1: usize,
    i2: usize,
) -> bool {
    let kp1 = &kf1.keypoints[i1];
    let kp2 = &kf2.keypoints[i2];
    // Line in image 2: l = F12ᵀ x1.
    let x1 = Vector3::new(kp1.x, kp1.y, 1.0);
    let line = f12.transpose() * x1;
    let denom = line.x * line.x + line.y * line.y;
    if denom < 1e-12 {
        return false;
    }
    let num = line.x * kp2.x + line.y * kp2.y + line.z;
    let dist_sq = num * num / denom;
    dist_sq < EPIPOLAR_CHI2 * kf2.pyramid.sigma2_of(kp2.octave)
}

/// Triangulate and validate candidate pairs.
fn triangulate_pairs(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    pairs: &[(usize, usize)],
) -> Vec<(usize, usize, Vector3<f64>)> {
    let (Some(kf1), Some(kf2)) = (map.keyframe(kf1_id), map.keyframe(kf2_id)) else {
        return Vec::new();
    };
    let c1 = kf1.camera_center();
    let c2 = kf2.camera_center();
    let mut out = Vec::new();

    for &(i1, i2) in pairs {
        let kp1 = &kf1.keypoints[i1];
        let kp2 = &kf2.keypoints[i2];
        let xn1 = kf1.camera.unproject(&kp1.position());
        let xn2 = kf2.camera.unproject(&kp2.position());

        let Some(point) = triangulation::triangulate(&kf1.pose_cw, &kf2.pose_cw, &xn1, &xn2)
        else {
            continue;
        };
        if !point.iter().all(|v| v.is_finite()) {
            continue;
        }

        // Parallax.
        let d1 = point - c1;
        let d2 = point - c2;
        let cos = d1.dot(&d2) / (d1.norm() * d2.norm()).max(1e-12);
        if cos > MAX_PARALLAX_COS {
            continue;
        }

        // Reprojection in both views, per-level gating.
        let err1 = (CHI2_MONO * kf1.pyramid.sigma2_of(kp1.octave)).sqrt();
        let err2 = (CHI2_MONO * kf2.pyramid.sigma2_of(kp2.octave)).sqrt();
        if !triangulation::check_triangulation(
            &point,
            &kf1.pose_cw,
            &kf2.pose_cw,
            &kp1.position(),
            &kp2.position(),
            &kf1.camera,
            err1.max(err2),
        ) {
            continue;
        }

        // Scale consistency between the two observations.
        let ratio_dist = d2.norm() / d1.norm().max(1e-12);
        let ratio_octave = kf1.pyramid.scale_of(kp1.octave) / kf2.pyramid.scale_of(kp2.octave);
        if ratio_dist * SCALE_CONSISTENCY_FACTOR < ratio_octave
            || ratio_dist > ratio_octave * SCALE_CONSISTENCY_FACTOR
        {
            continue;
        }

        out.push((i1, i2, point));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::map::{Frame, KeyFrame, MapId};
    use crate::vocabulary::Vocabulary;
    use std::sync::Arc;

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

    fn tag_descriptor(i: usize) -> Descriptor {
        // Deterministic, pairwise-distant descriptors.
        let mut state = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
        let mut d = [0u8; DESCRIPTOR_BYTES];
        for byte in d.iter_mut() {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *byte = (state >> 56) as u8;
        }
        Descriptor(d)
    }

    #[test]
    fn test_triangulates_unmatched_points() {
        let cam = camera();
        let vocab = Arc::new(Vocabulary::from_words((0..64).map(tag_descriptor).collect()));
        let mut map = Map::new(MapId::next());

        let world: Vec<Vector3<f64>> = (0..40)
            .map(|i| {
                Vector3::new(
                    (i % 8) as f64 * 0.4 - 1.4,
                    (i / 8) as f64 * 0.4 - 1.0,
                    4.0 + ((i * 3) % 5) as f64 * 0.25,
                )
            })
            .collect();

        let poses = [
            SE3::identity(),
            SE3 {
                rotation: nalgebra::UnitQuaternion::identity(),
                translation: Vector3::new(-0.5, 0.0, 0.0),
            },
        ];

        let mut kf_ids = Vec::new();
        for pose in &poses {
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
            let descriptors: Vec<Descriptor> = (0..world.len()).map(tag_descriptor).collect();
            let mut frame = Frame::new(
                0,
                0.0,
                Features {
                    keypoints,
                    descriptors,
                },
                cam,
                ScalePyramid::default(),
            );
            frame.pose_cw = Some(pose.clone());
            frame.ensure_bow(&vocab);
            let kf = KeyFrame::from_frame(KeyFrameId::next(), &frame, map.id);
            kf_ids.push(map.insert_keyframe(kf));
        }

        // A shared landmark so the pair is covisible; the rest unmatched.
        let lm = map.create_landmark(world[0], tag_descriptor(0), kf_ids[0]);
        map.associate(kf_ids[0], 0, lm);
        map.associate(kf_ids[1], 0, lm);
        map.update_connections(kf_ids[0]);
        map.update_connections(kf_ids[1]);

        let created = triangulate_new_landmarks(&mut map, kf_ids[0]);
        assert!(created.len() >= 30, "created only {}", created.len());

        // New landmarks sit close to the true points.
        for lm_id in &created {
            let lm = map.landmark(*lm_id).unwrap();
            let best = world
                .iter()
                .map(|p| (p - lm.position).norm())
                .fold(f64::INFINITY, f64::min);
            assert!(best < 0.05);
        }
        assert!(map.observations_closed());
    }
}
