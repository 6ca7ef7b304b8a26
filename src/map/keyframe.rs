//! KeyFrame - a promoted Frame retained in the map.
//!
//! KeyFrames are the nodes of the SLAM graph: they carry the covisibility
//! edges (weight = number of shared landmarks), the spanning-tree links used
//! by pose-graph optimization, and explicit loop-closure edges. Deletion is
//! logical via the `bad` flag; readers filter bad keyframes at every query
//! boundary.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::features::{Camera, Descriptor, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::vocabulary::{BowVector, FeatureVector};

use super::frame::Frame;
use super::types::{KeyFrameId, LandmarkId, MapId};

#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    /// Id of the frame this keyframe was promoted from.
    pub frame_id: u64,
    pub timestamp: f64,
    /// Owning map.
    pub map_id: MapId,

    /// Pose, world → camera.
    pub pose_cw: SE3,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub camera: Camera,
    pub pyramid: ScalePyramid,

    /// Keypoint index → landmark.
    pub observations: Vec<Option<LandmarkId>>,

    pub bow: Option<BowVector>,
    pub feature_vec: Option<FeatureVector>,

    covisibility: HashMap<KeyFrameId, usize>,
    /// Cached covisibles ordered by descending weight.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    /// Spanning tree.
    pub parent: Option<KeyFrameId>,
    pub children: HashSet<KeyFrameId>,
    /// Loop-closure edges added by LoopClosing / MapMerging.
    pub loop_edges: HashSet<KeyFrameId>,

    /// Logical deletion flag.
    pub bad: bool,
}

impl KeyFrame {
    /// Promote a tracked frame. The frame must carry a pose.
    pub fn from_frame(id: KeyFrameId, frame: &Frame, map_id: MapId) -> Self {
        let n = frame.keypoints.len();
        let mut observations = vec![None; n];
        for (i, lm) in frame.landmarks.iter().enumerate() {
            if !frame.outliers[i] {
                observations[i] = *lm;
            }
        }
        Self {
            id,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            map_id,
            pose_cw: frame.pose_cw.clone().unwrap_or_else(SE3::identity),
            keypoints: frame.keypoints.clone(),
            descriptors: frame.descriptors.clone(),
            camera: frame.camera,
            pyramid: frame.pyramid,
            observations,
            bow: frame.bow.clone(),
            feature_vec: frame.feature_vec.clone(),
            covisibility: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            parent: None,
            children: HashSet::new(),
            loop_edges: HashSet::new(),
            bad: false,
        }
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose_cw.camera_center()
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    // Landmark associations ---------------------------------------------

    pub fn landmark_at(&self, keypoint_idx: usize) -> Option<LandmarkId> {
        self.observations.get(keypoint_idx).copied().flatten()
    }

    pub fn set_landmark(&mut self, keypoint_idx: usize, lm_id: LandmarkId) {
        if keypoint_idx < self.observations.len() {
            self.observations[keypoint_idx] = Some(lm_id);
        }
    }

    pub fn erase_landmark_at(&mut self, keypoint_idx: usize) -> Option<LandmarkId> {
        self.observations.get_mut(keypoint_idx)?.take()
    }

    /// Remove every association to the given landmark.
    pub fn erase_landmark(&mut self, lm_id: LandmarkId) {
        for slot in self.observations.iter_mut() {
            if *slot == Some(lm_id) {
                *slot = None;
            }
        }
    }

    pub fn landmark_indices(&self) -> impl Iterator<Item = (usize, LandmarkId)> + '_ {
        self.observations
            .iter()
            .enumerate()
            .filter_map(|(i, lm)| lm.map(|id| (i, id)))
    }

    pub fn num_landmarks(&self) -> usize {
        self.observations.iter().filter(|o| o.is_some()).count()
    }

    // Covisibility graph --------------------------------------------------

    /// Replace the whole covisibility adjacency of this keyframe.
    pub fn set_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility = weights;
        self.covisibility.remove(&self.id);
        self.covisibility_dirty = true;
    }

    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility
    }

    /// The `n` covisible keyframes with most shared landmarks, best first.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.refresh_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Covisible keyframes sharing at least `min_weight` landmarks.
    pub fn covisibles_above_weight(&mut self, min_weight: usize) -> Vec<KeyFrameId> {
        self.refresh_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Read-only variant used where the map is only borrowed immutably;
    /// sorts on each call instead of consulting the cache.
    pub fn best_covisibles_readonly(&self, n: usize) -> Vec<KeyFrameId> {
        let mut all: Vec<(KeyFrameId, usize)> =
            self.covisibility.iter().map(|(&id, &w)| (id, w)).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        all.into_iter().take(n).map(|(id, _)| id).collect()
    }

    fn refresh_ordered_covisibles(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self.covisibility.iter().map(|(&id, &w)| (id, w)).collect();
        // Tie-break on id so the ordering is deterministic.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // Spanning tree ---------------------------------------------------------

    pub fn set_parent(&mut self, parent: KeyFrameId) {
        self.parent = Some(parent);
    }

    pub fn add_child(&mut self, child: KeyFrameId) {
        self.children.insert(child);
    }

    pub fn erase_child(&mut self, child: KeyFrameId) {
        self.children.remove(&child);
    }

    pub fn add_loop_edge(&mut self, other: KeyFrameId) {
        self.loop_edges.insert(other);
    }

    pub fn set_bad(&mut self) {
        self.bad = true;
    }

    // Spatial queries --------------------------------------------------------

    /// Indices of keypoints within `radius` pixels of `(u, v)`.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_octave: Option<u32>,
        max_octave: Option<u32>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                if let Some(min) = min_octave {
                    if kp.octave < min {
                        return false;
                    }
                }
                if let Some(max) = max_octave {
                    if kp.octave > max {
                        return false;
                    }
                }
                let du = kp.x - u;
                let dv = kp.y - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("landmarks", &self.num_landmarks())
            .field("covisibles", &self.covisibility.len())
            .field("parent", &self.parent)
            .field("bad", &self.bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Features, DESCRIPTOR_BYTES};

    fn test_keyframe() -> KeyFrame {
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
            keypoints: (0..10)
                .map(|i| KeyPoint {
                    x: 10.0 * i as f64,
                    y: 5.0 * i as f64,
                    octave: 0,
                    angle: 0.0,
                })
                .collect(),
            descriptors: vec![Descriptor([0u8; DESCRIPTOR_BYTES]); 10],
        };
        let mut frame = Frame::new(0, 0.0, features, camera, ScalePyramid::default());
        frame.pose_cw = Some(SE3::identity());
        KeyFrame::from_frame(KeyFrameId::next(), &frame, MapId(0))
    }

    #[test]
    fn test_landmark_slots() {
        let mut kf = test_keyframe();
        let lm = LandmarkId::next();
        kf.set_landmark(3, lm);
        assert_eq!(kf.landmark_at(3), Some(lm));
        assert_eq!(kf.num_landmarks(), 1);

        kf.erase_landmark(lm);
        assert_eq!(kf.landmark_at(3), None);
    }

    #[test]
    fn test_best_covisibles_ordering() {
        let mut kf = test_keyframe();
        let (a, b, c) = (KeyFrameId(100), KeyFrameId(101), KeyFrameId(102));
        kf.add_covisibility(a, 50);
        kf.add_covisibility(b, 100);
        kf.add_covisibility(c, 25);

        assert_eq!(kf.best_covisibles(2), vec![b, a]);
        assert_eq!(kf.covisibles_above_weight(30), vec![b, a]);
        assert_eq!(kf.covisibility_weight(KeyFrameId(999)), 0);
    }

    #[test]
    fn test_no_self_edge() {
        let mut kf = test_keyframe();
        let own = kf.id;
        kf.add_covisibility(own, 10);
        assert_eq!(kf.covisibility_weight(own), 0);
    }
}
