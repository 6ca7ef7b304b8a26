//! Map - one reconstruction: keyframe and landmark arenas, the covisibility
//! graph, the spanning tree and the per-map retrieval database.
//!
//! All cross-references are ids resolved through the arenas; a bad flag is
//! checked on every dereference so logical deletion never dangles. Entities
//! are physically removed only when the whole map is dropped.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::Descriptor;
use crate::geometry::SE3;

use super::keyframe::KeyFrame;
use super::keyframe_db::KeyFrameDatabase;
use super::landmark::Landmark;
use super::types::{KeyFrameId, LandmarkId, MapId};

/// Minimum shared-landmark count for a covisibility edge.
const MIN_COVISIBILITY_WEIGHT: usize = 15;

pub struct Map {
    pub id: MapId,
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    landmarks: HashMap<LandmarkId, Landmark>,
    pub keyframe_db: KeyFrameDatabase,
    /// Landmarks of the current local window, kept for the map publisher.
    pub reference_landmarks: Vec<LandmarkId>,
    /// First keyframe, root of the spanning tree.
    origin_kf: Option<KeyFrameId>,
}

impl Map {
    pub fn new(id: MapId) -> Self {
        Self {
            id,
            keyframes: HashMap::new(),
            landmarks: HashMap::new(),
            keyframe_db: KeyFrameDatabase::new(),
            reference_landmarks: Vec::new(),
            origin_kf: None,
        }
    }

    // KeyFrames ------------------------------------------------------------

    pub fn insert_keyframe(&mut self, kf: KeyFrame) -> KeyFrameId {
        let id = kf.id;
        if self.origin_kf.is_none() {
            self.origin_kf = Some(id);
        }
        self.keyframes.insert(id, kf);
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id).filter(|kf| !kf.bad)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id).filter(|kf| !kf.bad)
    }

    /// All non-bad keyframes.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values().filter(|kf| !kf.bad)
    }

    pub fn keyframe_ids(&self) -> Vec<KeyFrameId> {
        self.keyframes
            .values()
            .filter(|kf| !kf.bad)
            .map(|kf| kf.id)
            .collect()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.values().filter(|kf| !kf.bad).count()
    }

    pub fn origin_keyframe(&self) -> Option<KeyFrameId> {
        self.origin_kf
    }

    // Landmarks ------------------------------------------------------------

    pub fn create_landmark(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> LandmarkId {
        let id = LandmarkId::next();
        self.landmarks
            .insert(id, Landmark::new(id, position, descriptor, reference_kf));
        id
    }

    pub fn insert_landmark(&mut self, lm: Landmark) {
        self.landmarks.insert(lm.id, lm);
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id).filter(|lm| !lm.bad)
    }

    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id).filter(|lm| !lm.bad)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values().filter(|lm| !lm.bad)
    }

    pub fn landmark_ids(&self) -> Vec<LandmarkId> {
        self.landmarks
            .values()
            .filter(|lm| !lm.bad)
            .map(|lm| lm.id)
            .collect()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.values().filter(|lm| !lm.bad).count()
    }

    /// Take everything out of the arenas; used when a map is absorbed by a
    /// merge. Bad entities are left behind.
    pub fn drain_entities(&mut self) -> (Vec<KeyFrame>, Vec<Landmark>) {
        let kfs = self
            .keyframes
            .drain()
            .map(|(_, kf)| kf)
            .filter(|kf| !kf.bad)
            .collect();
        let lms = self
            .landmarks
            .drain()
            .map(|(_, lm)| lm)
            .filter(|lm| !lm.bad)
            .collect();
        self.keyframe_db = KeyFrameDatabase::new();
        self.reference_landmarks.clear();
        self.origin_kf = None;
        (kfs, lms)
    }

    // Associations ---------------------------------------------------------

    /// Create the bidirectional keyframe ↔ landmark association.
    pub fn associate(&mut self, kf_id: KeyFrameId, keypoint_idx: usize, lm_id: LandmarkId) -> bool {
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        let Some(lm) = self.landmarks.get_mut(&lm_id) else {
            return false;
        };
        kf.set_landmark(keypoint_idx, lm_id);
        lm.add_observation(kf_id, keypoint_idx);
        true
    }

    /// Mark a landmark bad and detach it from every observing keyframe.
    ///
    /// The arena entry stays; readers filter on the bad flag.
    pub fn set_landmark_bad(&mut self, lm_id: LandmarkId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.landmarks.get(&lm_id) {
            Some(lm) => lm.observations.iter().map(|(&k, &i)| (k, i)).collect(),
            None => return,
        };
        for (kf_id, idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.landmark_at(idx) == Some(lm_id) {
                    kf.erase_landmark_at(idx);
                }
            }
        }
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.observations.clear();
            lm.set_bad();
        }
    }

    /// Replace `old_id` by `new_id` everywhere (landmark fusion).
    ///
    /// Observations of the old landmark move onto the new one unless the
    /// observing keyframe already sees the new landmark; the old landmark is
    /// marked bad. Visible/found counters are accumulated so the survivor
    /// keeps its stability history.
    pub fn replace_landmark(&mut self, old_id: LandmarkId, new_id: LandmarkId) {
        if old_id == new_id {
            return;
        }
        let Some(old) = self.landmarks.get(&old_id) else {
            return;
        };
        let observations: Vec<(KeyFrameId, usize)> =
            old.observations.iter().map(|(&k, &i)| (k, i)).collect();
        let (old_visible, old_found) = (old.visible, old.found);

        for (kf_id, idx) in observations {
            let already_seen = self
                .landmarks
                .get(&new_id)
                .map(|new| new.observations.contains_key(&kf_id))
                .unwrap_or(true);
            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if already_seen {
                if kf.landmark_at(idx) == Some(old_id) {
                    kf.erase_landmark_at(idx);
                }
            } else {
                kf.set_landmark(idx, new_id);
                if let Some(new) = self.landmarks.get_mut(&new_id) {
                    new.add_observation(kf_id, idx);
                }
            }
        }

        if let Some(new) = self.landmarks.get_mut(&new_id) {
            new.visible += old_visible;
            new.found += old_found;
        }
        if let Some(old) = self.landmarks.get_mut(&old_id) {
            old.observations.clear();
            old.set_bad();
        }
        self.refresh_landmark(new_id);
    }

    /// Mark a keyframe bad: detach its observations, remove its covisibility
    /// edges, splice it out of the spanning tree and drop it from the
    /// retrieval database.
    pub fn set_keyframe_bad(&mut self, kf_id: KeyFrameId) {
        if self.origin_kf == Some(kf_id) {
            return; // the root anchors the tree
        }
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let observations: Vec<(usize, LandmarkId)> = kf.landmark_indices().collect();
        let neighbors: Vec<KeyFrameId> = kf.covisibility_weights().keys().copied().collect();
        let parent = kf.parent;
        let children: Vec<KeyFrameId> = kf.children.iter().copied().collect();

        for (_, lm_id) in &observations {
            if let Some(lm) = self.landmarks.get_mut(lm_id) {
                lm.erase_observation(kf_id);
            }
        }
        for n in &neighbors {
            if let Some(other) = self.keyframes.get_mut(n) {
                other.erase_covisibility(kf_id);
            }
        }

        // Children adopt the removed keyframe's parent.
        if let Some(parent_id) = parent {
            for child in &children {
                if let Some(child_kf) = self.keyframes.get_mut(child) {
                    child_kf.set_parent(parent_id);
                }
                if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                    parent_kf.add_child(*child);
                }
            }
            if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                parent_kf.erase_child(kf_id);
            }
        }

        self.keyframe_db.erase(kf_id);
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_bad();
        }
    }

    // Covisibility ----------------------------------------------------------

    /// Rebuild the covisibility adjacency of `kf_id` from its landmark
    /// observations and mirror the edges on the neighbors, keeping the graph
    /// symmetric. Also attaches the keyframe to the spanning tree on its
    /// first connection.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let observed: Vec<LandmarkId> = kf.landmark_indices().map(|(_, lm)| lm).collect();
        let had_parent = kf.parent.is_some();
        let old_neighbors: Vec<KeyFrameId> = kf.covisibility_weights().keys().copied().collect();

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for lm_id in observed {
            let Some(lm) = self.landmarks.get(&lm_id) else {
                continue;
            };
            if lm.bad {
                continue;
            }
            for (&other, _) in &lm.observations {
                if other != kf_id {
                    *counter.entry(other).or_insert(0) += 1;
                }
            }
        }

        // Keep edges above the threshold; if none qualifies, keep the best.
        let mut edges: HashMap<KeyFrameId, usize> = counter
            .iter()
            .filter(|(_, &w)| w >= MIN_COVISIBILITY_WEIGHT)
            .map(|(&id, &w)| (id, w))
            .collect();
        if edges.is_empty() {
            if let Some((&best, &w)) = counter.iter().max_by_key(|(id, &w)| (w, std::cmp::Reverse(id.0))) {
                edges.insert(best, w);
            }
        }

        // Mirror on neighbors; drop stale mirrored edges.
        for (&other, &w) in &edges {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_covisibility(kf_id, w);
            }
        }
        for old in old_neighbors {
            if !edges.contains_key(&old) {
                if let Some(other_kf) = self.keyframes.get_mut(&old) {
                    other_kf.erase_covisibility(kf_id);
                }
            }
        }

        // Spanning tree: first connection parents this keyframe to its
        // strongest neighbor.
        let best_neighbor = edges
            .iter()
            .max_by_key(|(id, &w)| (w, std::cmp::Reverse(id.0)))
            .map(|(&id, _)| id);
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibility(edges);
            if !had_parent && Some(kf_id) != self.origin_kf {
                if let Some(parent) = best_neighbor {
                    kf.set_parent(parent);
                    if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                        parent_kf.add_child(kf_id);
                    }
                }
            }
        }
    }

    /// Refresh a landmark's distinctive descriptor, normal and depth range
    /// after its observations changed.
    pub fn refresh_landmark(&mut self, lm_id: LandmarkId) {
        let Some(lm) = self.landmarks.get(&lm_id) else {
            return;
        };
        if lm.bad {
            return;
        }

        let mut descriptors = Vec::with_capacity(lm.observations.len());
        let mut centers: Vec<(KeyFrameId, Vector3<f64>)> = Vec::new();
        let mut ref_octave = 0;
        for (&kf_id, &idx) in &lm.observations {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                if kf.bad {
                    continue;
                }
                if let Some(d) = kf.descriptors.get(idx) {
                    descriptors.push(*d);
                }
                centers.push((kf_id, kf.camera_center()));
                if kf_id == lm.reference_kf {
                    ref_octave = kf.keypoints.get(idx).map(|kp| kp.octave).unwrap_or(0);
                }
            }
        }

        let pyramid = centers
            .first()
            .and_then(|(kf_id, _)| self.keyframes.get(kf_id))
            .map(|kf| kf.pyramid);

        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.compute_distinctive_descriptor(&descriptors);
            if let Some(pyramid) = pyramid {
                lm.update_normal_and_depth(
                    centers.iter().map(|(id, c)| (*id, c)),
                    ref_octave,
                    &pyramid,
                );
            }
        }
    }

    // Queries ----------------------------------------------------------------

    /// Median depth of the landmarks observed by `kf_id`, measured in its
    /// camera frame. Returns a negative value when nothing is observed, so
    /// callers can treat it as an initialization failure.
    pub fn median_scene_depth(&self, kf_id: KeyFrameId) -> f64 {
        let Some(kf) = self.keyframe(kf_id) else {
            return -1.0;
        };
        let pose = &kf.pose_cw;
        let mut depths: Vec<f64> = kf
            .landmark_indices()
            .filter_map(|(_, lm_id)| self.landmark(lm_id))
            .map(|lm| pose.transform_point(&lm.position).z)
            .collect();
        if depths.is_empty() {
            return -1.0;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        depths[(depths.len() - 1) / 2]
    }

    /// Rescale the whole map by `factor` (poses and landmark positions).
    /// Used once after initialization to normalize the median scene depth.
    pub fn rescale(&mut self, factor: f64) {
        for kf in self.keyframes.values_mut() {
            kf.pose_cw.translation *= factor;
        }
        for lm in self.landmarks.values_mut() {
            lm.position *= factor;
            lm.min_distance *= factor;
            lm.max_distance *= factor;
        }
    }

    /// Apply a corrected pose to a keyframe.
    pub fn set_keyframe_pose(&mut self, kf_id: KeyFrameId, pose_cw: SE3) {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.pose_cw = pose_cw;
        }
    }

    // Invariant checks (used by tests and debug assertions) ------------------

    /// Covisibility symmetry: `w(a→b) == w(b→a)` for every edge.
    pub fn covisibility_symmetric(&self) -> bool {
        for kf in self.keyframes() {
            for (&other, &w) in kf.covisibility_weights() {
                let mirrored = self
                    .keyframe(other)
                    .map(|o| o.covisibility_weight(kf.id))
                    .unwrap_or(0);
                if mirrored != w {
                    return false;
                }
            }
        }
        true
    }

    /// Spanning-tree connectivity over non-bad keyframes.
    pub fn spanning_tree_connected(&self) -> bool {
        let ids = self.keyframe_ids();
        if ids.len() <= 1 {
            return true;
        }
        let Some(root) = self.origin_kf.filter(|id| self.keyframe(*id).is_some()) else {
            return false;
        };
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(kf) = self.keyframe(id) {
                stack.extend(kf.children.iter().copied().filter(|c| self.keyframe(*c).is_some()));
            }
        }
        ids.into_iter().all(|id| seen.contains(&id))
    }

    /// Observation closure: every non-bad landmark has at least one non-bad
    /// observer in this map, and its reference is one of them.
    pub fn observations_closed(&self) -> bool {
        for lm in self.landmarks() {
            if lm.observations.is_empty() {
                return false;
            }
            let mut any = false;
            for kf_id in lm.observations.keys() {
                match self.keyframe(*kf_id) {
                    Some(_) => any = true,
                    None => return false,
                }
            }
            if !any || !lm.observations.contains_key(&lm.reference_kf) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::map::frame::Frame;

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

    fn keyframe_with_features(map: &mut Map, n: usize) -> KeyFrameId {
        let features = Features {
            keypoints: (0..n)
                .map(|i| KeyPoint {
                    x: i as f64,
                    y: i as f64,
                    octave: 0,
                    angle: 0.0,
                })
                .collect(),
            descriptors: vec![Descriptor([0u8; DESCRIPTOR_BYTES]); n],
        };
        let mut frame = Frame::new(0, 0.0, features, camera(), ScalePyramid::default());
        frame.pose_cw = Some(SE3::identity());
        let kf = KeyFrame::from_frame(KeyFrameId::next(), &frame, map.id);
        map.insert_keyframe(kf)
    }

    fn link(map: &mut Map, kf1: KeyFrameId, kf2: KeyFrameId, n: usize, base: usize) {
        for i in 0..n {
            let lm = map.create_landmark(
                Vector3::new(0.0, 0.0, 1.0),
                Descriptor([0u8; DESCRIPTOR_BYTES]),
                kf1,
            );
            map.associate(kf1, base + i, lm);
            map.associate(kf2, base + i, lm);
        }
    }

    #[test]
    fn test_update_connections_symmetric() {
        let mut map = Map::new(MapId::next());
        let kf1 = keyframe_with_features(&mut map, 40);
        let kf2 = keyframe_with_features(&mut map, 40);
        link(&mut map, kf1, kf2, 20, 0);

        map.update_connections(kf1);
        map.update_connections(kf2);

        assert_eq!(
            map.keyframe(kf1).unwrap().covisibility_weight(kf2),
            20
        );
        assert!(map.covisibility_symmetric());
        // kf2 got parented to kf1 on its first connection.
        assert_eq!(map.keyframe(kf2).unwrap().parent, Some(kf1));
        assert!(map.spanning_tree_connected());
    }

    #[test]
    fn test_weak_connection_keeps_best() {
        let mut map = Map::new(MapId::next());
        let kf1 = keyframe_with_features(&mut map, 40);
        let kf2 = keyframe_with_features(&mut map, 40);
        link(&mut map, kf1, kf2, 3, 0); // below the 15 threshold

        map.update_connections(kf2);
        assert_eq!(map.keyframe(kf2).unwrap().covisibility_weight(kf1), 3);
    }

    #[test]
    fn test_set_landmark_bad_detaches() {
        let mut map = Map::new(MapId::next());
        let kf1 = keyframe_with_features(&mut map, 10);
        let kf2 = keyframe_with_features(&mut map, 10);
        link(&mut map, kf1, kf2, 1, 0);
        let lm_id = map.keyframe(kf1).unwrap().landmark_at(0).unwrap();

        map.set_landmark_bad(lm_id);
        assert!(map.landmark(lm_id).is_none());
        assert!(map.keyframe(kf1).unwrap().landmark_at(0).is_none());
        assert!(map.keyframe(kf2).unwrap().landmark_at(0).is_none());
        assert!(map.observations_closed());
    }

    #[test]
    fn test_replace_landmark_moves_observations() {
        let mut map = Map::new(MapId::next());
        let kf1 = keyframe_with_features(&mut map, 10);
        let kf2 = keyframe_with_features(&mut map, 10);

        let old = map.create_landmark(
            Vector3::new(0.0, 0.0, 2.0),
            Descriptor([0u8; DESCRIPTOR_BYTES]),
            kf1,
        );
        map.associate(kf1, 0, old);
        let new = map.create_landmark(
            Vector3::new(0.0, 0.0, 2.1),
            Descriptor([0u8; DESCRIPTOR_BYTES]),
            kf2,
        );
        map.associate(kf2, 1, new);

        map.replace_landmark(old, new);

        assert!(map.landmark(old).is_none());
        assert_eq!(map.keyframe(kf1).unwrap().landmark_at(0), Some(new));
        assert_eq!(
            map.landmark(new).unwrap().observations.get(&kf1),
            Some(&0)
        );
    }

    #[test]
    fn test_set_keyframe_bad_reparents_children() {
        let mut map = Map::new(MapId::next());
        let root = keyframe_with_features(&mut map, 32);
        let middle = keyframe_with_features(&mut map, 32);
        let leaf = keyframe_with_features(&mut map, 32);
        link(&mut map, root, middle, 16, 0);
        link(&mut map, middle, leaf, 16, 16);
        map.update_connections(root);
        map.update_connections(middle);
        map.update_connections(leaf);

        assert!(map.spanning_tree_connected());
        map.set_keyframe_bad(middle);

        assert!(map.keyframe(middle).is_none());
        assert_eq!(map.num_keyframes(), 2);
        assert!(map.spanning_tree_connected());
    }

    #[test]
    fn test_median_scene_depth() {
        let mut map = Map::new(MapId::next());
        let kf = keyframe_with_features(&mut map, 10);
        for (i, z) in [1.0, 2.0, 3.0].iter().enumerate() {
            let lm = map.create_landmark(
                Vector3::new(0.0, 0.0, *z),
                Descriptor([0u8; DESCRIPTOR_BYTES]),
                kf,
            );
            map.associate(kf, i, lm);
        }
        assert!((map.median_scene_depth(kf) - 2.0).abs() < 1e-12);

        map.rescale(0.5);
        assert!((map.median_scene_depth(kf) - 1.0).abs() < 1e-12);
    }
}
