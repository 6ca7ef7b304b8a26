//! Map merging: detect overlap between distinct maps and fuse them.
//!
//! Detection is the loop-closing mechanism pointed across maps: the BoW
//! query (score floor from the current keyframe's own covisible group,
//! direct covisibles excluded) runs against the keyframe databases of all
//! other maps, and a candidate group must stay consistent over consecutive
//! keyframes before it is acted on. On a verified Sim(3) between a keyframe
//! of the current map and one of another map, the other map is transformed
//! into the current frame, its entities move over (ids are globally unique,
//! so no remap), duplicates are fused, the absorbed map is marked erased,
//! and the merged essential graph is re-optimized.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::geometry::Sim3;
use crate::map::{KeyFrame, KeyFrameId, Map, SharedMap};
use crate::matching::{Matcher, TH_LOW};
use crate::optim::{self, PoseGraphConfig};
use crate::system::SharedContext;
use crate::tracking::NewKeyFrame;

use crate::loop_closing::detector::{self, ConsistencyChecker};
use crate::loop_closing::sim3_solver::{compute_sim3_ransac, Sim3SolverConfig};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Candidates examined per foreign map.
const MAX_CANDIDATES: usize = 3;
/// Search radius when welding duplicate landmarks.
const FUSE_RADIUS: f64 = 4.0;

pub struct MapMerger {
    shared: Arc<SharedContext>,
    receiver: Receiver<NewKeyFrame>,
    /// Temporal consistency of cross-map candidates, same gate as loops.
    checker: ConsistencyChecker,
    sim3_config: Sim3SolverConfig,
    pose_graph: PoseGraphConfig,
}

impl MapMerger {
    pub fn new(shared: Arc<SharedContext>, receiver: Receiver<NewKeyFrame>) -> Self {
        Self {
            shared,
            receiver,
            checker: ConsistencyChecker::new(),
            sim3_config: Sim3SolverConfig::default(),
            pose_graph: PoseGraphConfig::default(),
        }
    }

    pub fn run(&mut self) {
        info!("map merging thread started");
        loop {
            if self.shared.is_shutdown() {
                break;
            }
            self.shared
                .map_merging_gate
                .check_in(&self.shared.shutdown);
            if self.shared.map_merging_gate.take_reset_request() {
                while self.receiver.try_recv().is_ok() {}
                self.checker.clear();
                continue;
            }

            match self.receiver.recv_timeout(RECV_TIMEOUT) {
                Ok((shared_map, kf_id)) => self.process_keyframe(&shared_map, kf_id),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("map merging thread exiting");
    }

    fn process_keyframe(&mut self, current: &Arc<SharedMap>, kf_id: KeyFrameId) {
        if current.is_erased() {
            return;
        }
        // Query context (BoW, covisible exclusion, score floor) comes from
        // the keyframe's own map; the lock is dropped before touching peers.
        let query = {
            let map_a = current.read();
            detector::bow_query(&map_a, kf_id)
        };
        let Some(query) = query else {
            return;
        };

        // Candidates from every other map, with their covisibility groups
        // expanded in the map they live in.
        let mut groups: Vec<(KeyFrameId, HashSet<KeyFrameId>)> = Vec::new();
        let mut origin: HashMap<KeyFrameId, Arc<SharedMap>> = HashMap::new();
        for other in self.shared.map_db.live_maps() {
            if other.id() == current.id() {
                continue;
            }
            let map_b = other.read();
            for candidate in detector::detect_candidates_in_map(&query, &map_b)
                .into_iter()
                .take(MAX_CANDIDATES)
            {
                groups.push((candidate, detector::candidate_group(&map_b, candidate)));
                origin.insert(candidate, Arc::clone(&other));
            }
        }

        // Same temporal gate as loop closing: the overlap must persist over
        // consecutive keyframes before a merge is attempted.
        for candidate in self.checker.check_groups(groups) {
            let Some(other) = origin.get(&candidate).cloned() else {
                continue;
            };
            if other.is_erased() {
                continue;
            }
            if self.try_merge(current, kf_id, &other, candidate) {
                self.checker.clear();
                return;
            }
        }
    }

    fn try_merge(
        &mut self,
        current: &Arc<SharedMap>,
        kf_id: KeyFrameId,
        other: &Arc<SharedMap>,
        candidate: KeyFrameId,
    ) -> bool {
        // Peer maps lock in ascending id order.
        let (first, second) = if current.id() < other.id() {
            (current, other)
        } else {
            (other, current)
        };
        let mut guard_first = first.write();
        let mut guard_second = second.write();
        let (map_a, map_b): (&mut Map, &mut Map) = if current.id() < other.id() {
            (&mut *guard_first, &mut *guard_second)
        } else {
            (&mut *guard_second, &mut *guard_first)
        };

        // Verify the overlap with a similarity over cross-map matches.
        let Some(sim3_a_from_b_cam) =
            cross_map_sim3(map_a, kf_id, map_b, candidate, &self.sim3_config)
        else {
            debug!(%kf_id, %candidate, "merge candidate failed similarity verification");
            return false;
        };

        info!(
            current_map = %current.id(),
            absorbed_map = %other.id(),
            %kf_id,
            %candidate,
            scale = sim3_a_from_b_cam.scale,
            "map overlap detected, merging"
        );

        // Structure mutation across two maps: stop the builders.
        self.shared.local_mapping_gate.request_stop();
        self.shared.loop_closing_gate.request_stop();
        self.wait_for(&self.shared.local_mapping_gate);

        merge_maps(map_a, kf_id, map_b, candidate, &sim3_a_from_b_cam);
        self.shared.map_db.erase_map(other.id());

        optim::optimize_essential_graph(
            map_a,
            kf_id,
            &std::collections::HashMap::new(),
            &[(candidate, kf_id)],
            &self.pose_graph,
        );

        self.shared.local_mapping_gate.release();
        self.shared.loop_closing_gate.release();
        info!(map = %current.id(), keyframes = map_a.num_keyframes(), "maps merged");
        true
    }

    fn wait_for(&self, gate: &crate::system::WorkerGate) {
        let start = Instant::now();
        while !gate.is_stopped() {
            if self.shared.is_shutdown() || start.elapsed() > Duration::from_secs(5) {
                warn!("proceeding without worker pause acknowledgment");
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Cross-map Sim(3): camera-frame positions of landmark matches between a
/// keyframe of map A and one of map B, fitted as `p_a ≈ S · p_b`.
fn cross_map_sim3(
    map_a: &Map,
    kf_a: KeyFrameId,
    map_b: &Map,
    kf_b: KeyFrameId,
    config: &Sim3SolverConfig,
) -> Option<Sim3> {
    let kf_a = map_a.keyframe(kf_a)?;
    let kf_b = map_b.keyframe(kf_b)?;
    let (fv_a, fv_b) = (kf_a.feature_vec.as_ref()?, kf_b.feature_vec.as_ref()?);

    let ratio = 0.75;
    let mut pts_a: Vec<Vector3<f64>> = Vec::new();
    let mut pts_b: Vec<Vector3<f64>> = Vec::new();
    let mut taken: HashSet<usize> = HashSet::new();

    for (node, indices_a) in fv_a {
        let Some(indices_b) = fv_b.get(node) else {
            continue;
        };
        for &ia in indices_a {
            let Some(lm_a) = kf_a.landmark_at(ia).and_then(|id| map_a.landmark(id)) else {
                continue;
            };
            let mut best_idx = None;
            let mut best = u32::MAX;
            let mut second = u32::MAX;
            for &ib in indices_b {
                if taken.contains(&ib) {
                    continue;
                }
                if kf_b.landmark_at(ib).and_then(|id| map_b.landmark(id)).is_none() {
                    continue;
                }
                let d = kf_a.descriptors[ia].distance(&kf_b.descriptors[ib]);
                if d < best {
                    second = best;
                    best = d;
                    best_idx = Some(ib);
                } else if d < second {
                    second = d;
                }
            }
            let Some(ib) = best_idx else { continue };
            if best > TH_LOW || (best as f64) > ratio * second as f64 {
                continue;
            }
            let lm_b = match kf_b.landmark_at(ib).and_then(|id| map_b.landmark(id)) {
                Some(lm) => lm,
                None => continue,
            };
            taken.insert(ib);
            pts_a.push(kf_a.pose_cw.transform_point(&lm_a.position));
            pts_b.push(kf_b.pose_cw.transform_point(&lm_b.position));
        }
    }

    compute_sim3_ransac(&pts_b, &pts_a, config).map(|r| r.sim3)
}

/// Move every entity of `map_b` into `map_a`, expressed in A's world frame.
fn merge_maps(
    map_a: &mut Map,
    kf_a: KeyFrameId,
    map_b: &mut Map,
    candidate: KeyFrameId,
    sim3_a_from_b_cam: &Sim3,
) {
    // World-frame transform B → A:
    // p_A = T_aw⁻¹ · S_cam · T_bw (p_B).
    let (Some(kf_a_ref), Some(kf_b_ref)) = (map_a.keyframe(kf_a), map_b.keyframe(candidate))
    else {
        return;
    };
    let s_worlds = Sim3::from_se3(&kf_a_ref.pose_cw)
        .inverse()
        .compose(sim3_a_from_b_cam)
        .compose(&Sim3::from_se3(&kf_b_ref.pose_cw));
    let s_worlds_inv = s_worlds.inverse();

    let b_origin = map_b.origin_keyframe();
    let (keyframes, landmarks) = map_b.drain_entities();
    let a_id = map_a.id;

    let mut moved_kfs: Vec<KeyFrameId> = Vec::with_capacity(keyframes.len());
    for mut kf in keyframes {
        // New pose: A-world → camera.
        let pose = Sim3::from_se3(&kf.pose_cw).compose(&s_worlds_inv).to_se3();
        transplant_keyframe(&mut kf, a_id, pose);
        moved_kfs.push(kf.id);
        let bow = kf.bow.clone();
        let id = map_a.insert_keyframe(kf);
        if let Some(bow) = bow {
            map_a.keyframe_db.add(id, bow);
        }
    }
    for mut lm in landmarks {
        lm.position = s_worlds.transform_point(&lm.position);
        lm.min_distance *= s_worlds.scale;
        lm.max_distance *= s_worlds.scale;
        map_a.insert_landmark(lm);
    }

    // Weld the spanning trees: B's old root hangs off the current keyframe.
    if let Some(root_b) = b_origin {
        if map_a.keyframe(root_b).is_some() {
            if let Some(root_kf) = map_a.keyframe_mut(root_b) {
                root_kf.set_parent(kf_a);
            }
            if let Some(anchor) = map_a.keyframe_mut(kf_a) {
                anchor.add_child(root_b);
            }
        }
    }

    // Fuse duplicates around the weld: the candidate side's landmarks into
    // the current keyframe's neighborhood and vice versa.
    let matcher = Matcher::new(0.8);
    let window_a: Vec<KeyFrameId> = {
        let mut v = vec![kf_a];
        if let Some(kf) = map_a.keyframe(kf_a) {
            v.extend(kf.covisibility_weights().keys().copied());
        }
        v
    };
    let landmarks_b: Vec<_> = {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut weld: Vec<KeyFrameId> = vec![candidate];
        if let Some(kf) = map_a.keyframe(candidate) {
            weld.extend(kf.covisibility_weights().keys().copied());
        }
        for id in weld {
            if let Some(kf) = map_a.keyframe(id) {
                for (_, lm) in kf.landmark_indices() {
                    if seen.insert(lm) {
                        out.push(lm);
                    }
                }
            }
        }
        out
    };
    for window_kf in &window_a {
        if let Some(pose) = map_a.keyframe(*window_kf).map(|kf| kf.pose_cw.clone()) {
            matcher.fuse(map_a, *window_kf, &pose, &landmarks_b, FUSE_RADIUS, false);
        }
    }

    // Refresh connectivity for everything that moved or fused.
    for id in window_a.iter().chain(moved_kfs.iter()) {
        map_a.update_connections(*id);
    }

    if let Some(kf) = map_a.keyframe_mut(kf_a) {
        kf.add_loop_edge(candidate);
    }
    if let Some(kf) = map_a.keyframe_mut(candidate) {
        kf.add_loop_edge(kf_a);
    }
}

/// Rewrite a keyframe's map membership and pose while keeping its graph
/// links (they are global ids and stay valid after the move).
fn transplant_keyframe(kf: &mut KeyFrame, map_id: crate::map::MapId, pose: crate::geometry::SE3) {
    kf.map_id = map_id;
    kf.pose_cw = pose;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::geometry::SE3;
    use crate::map::{Frame, LandmarkId, MapId};
    use crate::vocabulary::Vocabulary;
    use nalgebra::UnitQuaternion;
    use std::sync::Arc as StdArc;

    fn tag_descriptor(i: usize) -> Descriptor {
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

    /// Add a keyframe observing `world` (one landmark per point) to a map.
    fn populate_map(
        map: &mut Map,
        world: &[nalgebra::Vector3<f64>],
        pose: &SE3,
        vocab: &StdArc<Vocabulary>,
    ) -> (KeyFrameId, Vec<LandmarkId>) {
        let cam = camera();
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
                descriptors: descriptors.clone(),
            },
            cam,
            ScalePyramid::default(),
        );
        frame.pose_cw = Some(pose.clone());
        frame.ensure_bow(vocab);
        let kf = KeyFrame::from_frame(KeyFrameId::next(), &frame, map.id);
        let kf_id = map.insert_keyframe(kf);
        let mut lm_ids = Vec::new();
        for (i, p) in world.iter().enumerate() {
            let lm = map.create_landmark(*p, descriptors[i], kf_id);
            map.associate(kf_id, i, lm);
            lm_ids.push(lm);
        }
        (kf_id, lm_ids)
    }

    fn build_map(
        world: &[nalgebra::Vector3<f64>],
        pose: &SE3,
        vocab: &StdArc<Vocabulary>,
    ) -> (Map, KeyFrameId, Vec<LandmarkId>) {
        let mut map = Map::new(MapId::next());
        let (kf_id, lm_ids) = populate_map(&mut map, world, pose, vocab);
        (map, kf_id, lm_ids)
    }

    /// Two maps of the same physical scene in different world frames: after
    /// the merge, map B's entities live in map A expressed in A's frame.
    #[test]
    fn test_merge_aligns_absorbed_map() {
        let vocab = StdArc::new(Vocabulary::from_words((0..64).map(tag_descriptor).collect()));

        // Physical points in A's world frame.
        let points_a: Vec<nalgebra::Vector3<f64>> = (0..40)
            .map(|i| {
                nalgebra::Vector3::new(
                    (i % 8) as f64 * 0.4 - 1.4,
                    (i / 8) as f64 * 0.4 - 1.0,
                    4.0 + ((i * 3) % 5) as f64 * 0.25,
                )
            })
            .collect();

        // B's world frame drifted in rotation, translation and scale.
        let s_true = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.03, 0.05),
            translation: nalgebra::Vector3::new(0.4, -0.2, 0.3),
            scale: 1.3,
        };
        let s_true_inv = s_true.inverse();
        let points_b: Vec<nalgebra::Vector3<f64>> =
            points_a.iter().map(|p| s_true_inv.transform_point(p)).collect();

        let (mut map_a, kf_a, _) = build_map(&points_a, &SE3::identity(), &vocab);
        let (mut map_b, kf_b, lm_b) = build_map(&points_b, &SE3::identity(), &vocab);

        let sim3 = cross_map_sim3(&map_a, kf_a, &map_b, kf_b, &Sim3SolverConfig::default())
            .expect("cross-map similarity");
        assert!((sim3.scale - s_true.scale).abs() < 1e-6);

        merge_maps(&mut map_a, kf_a, &mut map_b, kf_b, &sim3);

        assert_eq!(map_b.num_keyframes(), 0);
        assert_eq!(map_a.num_keyframes(), 2);
        let moved = map_a.keyframe(kf_b).expect("absorbed keyframe");
        assert_eq!(moved.map_id, map_a.id);

        // B's landmarks now sit at the physical positions in A's frame.
        for (lm_id, p_a) in lm_b.iter().zip(points_a.iter()) {
            if let Some(lm) = map_a.landmark(*lm_id) {
                assert!((lm.position - p_a).norm() < 1e-6);
            }
        }
        assert!(map_a.spanning_tree_connected());
    }

    /// A cross-map overlap must be re-detected over consecutive keyframes
    /// before a merge is attempted; a single hit changes nothing.
    #[test]
    fn test_merge_requires_temporal_consistency() {
        use crate::system::SharedContext;
        use crossbeam_channel::bounded;

        let vocab = StdArc::new(Vocabulary::from_words((0..40).map(tag_descriptor).collect()));
        let shared = SharedContext::new(StdArc::clone(&vocab));

        let points_a: Vec<nalgebra::Vector3<f64>> = (0..40)
            .map(|i| {
                nalgebra::Vector3::new(
                    (i % 8) as f64 * 0.4 - 1.4,
                    (i / 8) as f64 * 0.4 - 1.0,
                    4.0 + ((i * 3) % 5) as f64 * 0.25,
                )
            })
            .collect();
        let s_true = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.03, 0.05),
            translation: nalgebra::Vector3::new(0.4, -0.2, 0.3),
            scale: 1.3,
        };
        let points_b: Vec<nalgebra::Vector3<f64>> = points_a
            .iter()
            .map(|p| s_true.inverse().transform_point(p))
            .collect();

        // Current map: the query keyframe plus a covisible that sets the
        // retrieval score floor below 1.
        let current = shared.map_db.create_map();
        shared.map_db.set_current(StdArc::clone(&current));
        let kf_a = {
            let mut map_a = current.write();
            let (kf_a, _) = populate_map(&mut map_a, &points_a, &SE3::identity(), &vocab);
            let (cov_kf, _) =
                populate_map(&mut map_a, &points_a[0..20], &SE3::identity(), &vocab);
            map_a.keyframe_mut(kf_a).unwrap().add_covisibility(cov_kf, 20);
            map_a.keyframe_mut(cov_kf).unwrap().add_covisibility(kf_a, 20);
            kf_a
        };

        // The other map holds the same physical scene in a drifted frame;
        // its keyframe is retrievable through the database.
        let other = shared.map_db.create_map();
        let candidate = {
            let mut map_b = other.write();
            let (candidate, _) = populate_map(&mut map_b, &points_b, &SE3::identity(), &vocab);
            let bow = map_b.keyframe(candidate).unwrap().bow.clone().unwrap();
            map_b.keyframe_db.add(candidate, bow);
            candidate
        };

        // No worker threads here; with shutdown raised the stop handshake
        // inside try_merge returns immediately.
        shared.request_shutdown();

        let (_sender, receiver) = bounded::<crate::tracking::NewKeyFrame>(1);
        let mut merger = MapMerger::new(StdArc::clone(&shared), receiver);

        for _ in 0..3 {
            merger.process_keyframe(&current, kf_a);
            assert!(!other.is_erased());
        }

        merger.process_keyframe(&current, kf_a);
        assert!(other.is_erased());
        assert!(current.read().keyframe(candidate).is_some());
    }
}
