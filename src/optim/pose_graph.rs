//! Essential-graph optimization over Sim(3).
//!
//! Optimizes every keyframe pose of a map so that the relative similarity
//! transforms along the essential graph (spanning tree ∪ strong covisibility
//! edges ∪ loop edges) agree with their measurements. Run after a loop
//! closure or a map merge, while LocalMapping is stopped. Landmarks are
//! corrected through their reference keyframe afterwards.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};

use crate::geometry::Sim3;
use crate::map::{KeyFrameId, Map};

pub struct PoseGraphConfig {
    /// Covisibility edges at or above this weight enter the graph.
    pub min_covisibility_weight: usize,
    pub iterations: usize,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            min_covisibility_weight: 100,
            iterations: 15,
        }
    }
}

struct Edge {
    i: usize,
    j: usize,
    /// Measured relative transform `S_ji`: node j as seen from node i.
    measurement: Sim3,
}

/// Optimize the essential graph and write corrected poses and landmark
/// positions back into the map.
///
/// `corrected` provides initial Sim(3) estimates (world → camera) for the
/// keyframes around the loop; `extra_edges` are the new loop edges, measured
/// from those corrected estimates. `fixed_kf` pins the gauge.
pub fn optimize_essential_graph(
    map: &mut Map,
    fixed_kf: KeyFrameId,
    corrected: &HashMap<KeyFrameId, Sim3>,
    extra_edges: &[(KeyFrameId, KeyFrameId)],
    config: &PoseGraphConfig,
) {
    let mut ids = map.keyframe_ids();
    ids.sort();
    let index: HashMap<KeyFrameId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let n = ids.len();
    if n < 2 {
        return;
    }

    // Pre-correction states are the measurement source for existing edges.
    let uncorrected: Vec<Sim3> = ids
        .iter()
        .map(|id| Sim3::from_se3(&map.keyframe(*id).unwrap().pose_cw))
        .collect();
    let mut states: Vec<Sim3> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| corrected.get(id).cloned().unwrap_or_else(|| uncorrected[i].clone()))
        .collect();

    // Collect the essential edges, deduplicated by endpoint pair.
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    let mut edges: Vec<Edge> = Vec::new();
    let mut push_edge = |i: usize, j: usize, measurement: Sim3, edges: &mut Vec<Edge>| {
        let key = (i.min(j), i.max(j));
        if i != j && seen.insert(key) {
            edges.push(Edge { i, j, measurement });
        }
    };

    // New loop edges first: they are measured from the corrected estimates
    // and must win deduplication over the same pair re-derived from the
    // keyframes' stored (uncorrected) poses.
    for (a, b) in extra_edges {
        if let (Some(&i), Some(&j)) = (index.get(a), index.get(b)) {
            let measurement = states[j].compose(&states[i].inverse());
            push_edge(i, j, measurement, &mut edges);
        }
    }
    for (i, id) in ids.iter().enumerate() {
        let kf = map.keyframe(*id).unwrap();
        let mut neighbors: Vec<KeyFrameId> = Vec::new();
        if let Some(parent) = kf.parent {
            neighbors.push(parent);
        }
        neighbors.extend(kf.loop_edges.iter().copied());
        neighbors.extend(
            kf.covisibility_weights()
                .iter()
                .filter(|(_, &w)| w >= config.min_covisibility_weight)
                .map(|(&other, _)| other),
        );
        for other in neighbors {
            if let Some(&j) = index.get(&other) {
                let measurement = uncorrected[j].compose(&uncorrected[i].inverse());
                push_edge(i, j, measurement, &mut edges);
            }
        }
    }
    if edges.is_empty() {
        return;
    }

    let fixed = index.get(&fixed_kf).copied().unwrap_or(0);
    gauss_newton(&mut states, &edges, fixed, config.iterations);

    apply_corrections(map, &ids, &uncorrected, &states);
}

fn edge_residual(edge: &Edge, states: &[Sim3]) -> [f64; 7] {
    // Error transform: S_ji_meas ∘ S_i ∘ S_j⁻¹, identity when consistent.
    edge.measurement
        .compose(&states[edge.i])
        .compose(&states[edge.j].inverse())
        .error_vector()
}

fn apply_increment(state: &Sim3, delta: &[f64]) -> Sim3 {
    let update = Sim3 {
        rotation: UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2])),
        translation: Vector3::new(delta[3], delta[4], delta[5]),
        scale: delta[6].exp(),
    };
    update.compose(state)
}

fn gauss_newton(states: &mut [Sim3], edges: &[Edge], fixed: usize, iterations: usize) {
    let n = states.len();
    let dim = 7 * n;
    let eps = 1e-6;

    for _ in 0..iterations {
        let mut h = DMatrix::<f64>::zeros(dim, dim);
        let mut b = DVector::<f64>::zeros(dim);
        let mut total_error = 0.0;

        for edge in edges {
            let r0 = edge_residual(edge, states);
            total_error += r0.iter().map(|v| v * v).sum::<f64>();

            // Numeric Jacobians of the 7-vector residual with respect to
            // both endpoint increments.
            let mut jac = [[0.0f64; 14]; 7];
            for (slot, node) in [(0usize, edge.i), (1usize, edge.j)] {
                for k in 0..7 {
                    let mut delta = [0.0f64; 7];
                    delta[k] = eps;
                    let saved = states[node].clone();
                    states[node] = apply_increment(&saved, &delta);
                    let r_plus = edge_residual(edge, states);
                    states[node] = saved;
                    for row in 0..7 {
                        jac[row][7 * slot + k] = (r_plus[row] - r0[row]) / eps;
                    }
                }
            }

            for (slot_a, node_a) in [(0usize, edge.i), (1usize, edge.j)] {
                if node_a == fixed {
                    continue;
                }
                for row in 0..7 {
                    let ja = jac[row];
                    for k in 0..7 {
                        b[7 * node_a + k] += ja[7 * slot_a + k] * r0[row];
                    }
                }
                for (slot_b, node_b) in [(0usize, edge.i), (1usize, edge.j)] {
                    if node_b == fixed {
                        continue;
                    }
                    for row in 0..7 {
                        let jr = jac[row];
                        for ka in 0..7 {
                            for kb in 0..7 {
                                h[(7 * node_a + ka, 7 * node_b + kb)] +=
                                    jr[7 * slot_a + ka] * jr[7 * slot_b + kb];
                            }
                        }
                    }
                }
            }
        }

        if total_error < 1e-12 {
            break;
        }
        for d in 0..dim {
            h[(d, d)] += 1e-6;
        }
        // Pin the fixed node hard.
        for k in 0..7 {
            let d = 7 * fixed + k;
            h[(d, d)] += 1e9;
            b[d] = 0.0;
        }

        let Some(delta) = h.lu().solve(&(-b)) else {
            break;
        };
        if delta.norm() < 1e-10 {
            break;
        }
        for (node, state) in states.iter_mut().enumerate() {
            if node == fixed {
                continue;
            }
            let d: Vec<f64> = (0..7).map(|k| delta[7 * node + k]).collect();
            *state = apply_increment(state, &d);
        }
    }
}

/// Write corrected keyframe poses and move each landmark through its
/// reference keyframe's correction.
fn apply_corrections(map: &mut Map, ids: &[KeyFrameId], uncorrected: &[Sim3], states: &[Sim3]) {
    let index: HashMap<KeyFrameId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    for lm_id in map.landmark_ids() {
        let Some(lm) = map.landmark(lm_id) else { continue };
        let Some(&ref_idx) = index.get(&lm.reference_kf) else {
            continue;
        };
        let old = &uncorrected[ref_idx];
        let new = &states[ref_idx];
        let corrected = new.inverse().transform_point(&old.transform_point(&lm.position));
        if let Some(lm) = map.landmark_mut(lm_id) {
            lm.position = corrected;
        }
    }

    for (i, id) in ids.iter().enumerate() {
        map.set_keyframe_pose(*id, states[i].to_se3());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::geometry::SE3;
    use crate::map::{Frame, KeyFrame, MapId};

    fn insert_kf(map: &mut Map, pose: SE3) -> KeyFrameId {
        let camera = Camera {
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
        };
        let features = Features {
            keypoints: vec![
                KeyPoint {
                    x: 320.0,
                    y: 240.0,
                    octave: 0,
                    angle: 0.0
                };
                4
            ],
            descriptors: vec![Descriptor([0u8; DESCRIPTOR_BYTES]); 4],
        };
        let mut frame = Frame::new(0, 0.0, features, camera, ScalePyramid::default());
        frame.pose_cw = Some(pose);
        let kf = KeyFrame::from_frame(KeyFrameId::next(), &frame, map.id);
        map.insert_keyframe(kf)
    }

    /// A drifted chain whose loop edge says first == last: the optimizer
    /// should pull the last node back onto the first.
    #[test]
    fn test_loop_edge_removes_drift() {
        let mut map = Map::new(MapId::next());
        let mut ids = Vec::new();
        // Chain along x with an accumulated drift on the last node.
        for i in 0..5 {
            let drift = if i == 4 { 0.4 } else { 0.0 };
            let pose = SE3 {
                rotation: nalgebra::UnitQuaternion::identity(),
                translation: Vector3::new(-(i as f64) * 1.0 - drift, 0.0, 0.0),
            };
            ids.push(insert_kf(&mut map, pose));
        }
        // Spanning tree: a chain.
        for w in ids.windows(2) {
            let (parent, child) = (w[0], w[1]);
            if let Some(kf) = map.keyframe_mut(child) {
                kf.set_parent(parent);
            }
            if let Some(kf) = map.keyframe_mut(parent) {
                kf.add_child(child);
            }
        }

        // The loop says the last keyframe truly sits at x = -4.
        let mut corrected = HashMap::new();
        corrected.insert(
            ids[4],
            Sim3::from_se3(&SE3 {
                rotation: nalgebra::UnitQuaternion::identity(),
                translation: Vector3::new(-4.0, 0.0, 0.0),
            }),
        );
        if let Some(kf) = map.keyframe_mut(ids[4]) {
            kf.add_loop_edge(ids[0]);
        }
        if let Some(kf) = map.keyframe_mut(ids[0]) {
            kf.add_loop_edge(ids[4]);
        }

        optimize_essential_graph(
            &mut map,
            ids[0],
            &corrected,
            &[(ids[0], ids[4])],
            &PoseGraphConfig::default(),
        );

        // The least-squares optimum spreads the 0.4 drift across the five
        // edges, so the last node lands close to (not exactly at) -4.
        let last = map.keyframe(ids[4]).unwrap();
        assert!((last.pose_cw.translation.x - -4.0).abs() < 0.1);
        // The fixed keyframe did not move.
        let first = map.keyframe(ids[0]).unwrap();
        assert!(first.pose_cw.translation.norm() < 1e-9);
    }
}
