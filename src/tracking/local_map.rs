//! Local-map assembly for frame tracking.
//!
//! Every landmark matched in the current frame votes for the keyframes
//! observing it; the top voter becomes the reference keyframe. The local
//! window is the voting keyframes plus, for each, at most one fresh neighbor
//! from its top-10 covisibles, capped at 80 keyframes. The local landmark
//! set is the union over the window, deduplicated with a last-seen marker.

use std::collections::{HashMap, HashSet};

use crate::map::{Frame, KeyFrameId, LandmarkId, Map};

/// Hard cap on the local keyframe window.
const MAX_LOCAL_KEYFRAMES: usize = 80;
/// Covisibility neighbors considered per voting keyframe.
const NEIGHBORS_PER_KEYFRAME: usize = 10;

#[derive(Default)]
pub struct LocalMap {
    pub keyframes: Vec<KeyFrameId>,
    pub landmarks: Vec<LandmarkId>,
    pub reference_kf: Option<KeyFrameId>,
}

impl LocalMap {
    /// Rebuild the window around the current frame's matches.
    ///
    /// Bad landmarks encountered in the frame are unlinked as a side effect,
    /// mirroring how stale references are cleaned at this point in the
    /// pipeline.
    pub fn update(&mut self, frame: &mut Frame, map: &mut Map) {
        self.update_keyframes(frame, map);
        self.update_landmarks(frame, map);
        map.reference_landmarks = self.landmarks.clone();
    }

    fn update_keyframes(&mut self, frame: &mut Frame, map: &Map) {
        let mut votes: HashMap<KeyFrameId, usize> = HashMap::new();
        for slot in frame.landmarks.iter_mut() {
            let Some(lm_id) = *slot else { continue };
            match map.landmark(lm_id) {
                Some(lm) => {
                    for kf_id in lm.observations.keys() {
                        *votes.entry(*kf_id).or_insert(0) += 1;
                    }
                }
                None => *slot = None,
            }
        }

        self.keyframes.clear();
        self.reference_kf = None;
        if votes.is_empty() {
            return;
        }

        let mut included: HashSet<KeyFrameId> = HashSet::new();
        let mut best_votes = 0usize;
        for (&kf_id, &n) in &votes {
            if map.keyframe(kf_id).is_none() {
                continue;
            }
            if n > best_votes || (n == best_votes && Some(kf_id) < self.reference_kf) {
                best_votes = n;
                self.reference_kf = Some(kf_id);
            }
            included.insert(kf_id);
            self.keyframes.push(kf_id);
        }

        // One unseen neighbor per included keyframe, best covisibility first.
        let voting: Vec<KeyFrameId> = self.keyframes.clone();
        for kf_id in voting {
            if self.keyframes.len() > MAX_LOCAL_KEYFRAMES {
                break;
            }
            let Some(kf) = map.keyframe(kf_id) else { continue };
            for neighbor in kf.best_covisibles_readonly(NEIGHBORS_PER_KEYFRAME) {
                if map.keyframe(neighbor).is_none() {
                    continue;
                }
                if included.insert(neighbor) {
                    self.keyframes.push(neighbor);
                    break;
                }
            }
        }
        self.keyframes.truncate(MAX_LOCAL_KEYFRAMES);
    }

    fn update_landmarks(&mut self, frame: &Frame, map: &mut Map) {
        self.landmarks.clear();
        for &kf_id in &self.keyframes {
            let observed: Vec<LandmarkId> = match map.keyframe(kf_id) {
                Some(kf) => kf.landmark_indices().map(|(_, id)| id).collect(),
                None => continue,
            };
            for lm_id in observed {
                let Some(lm) = map.landmark_mut(lm_id) else {
                    continue;
                };
                if lm.track_reference_for_frame == frame.id {
                    continue;
                }
                lm.track_reference_for_frame = frame.id;
                self.landmarks.push(lm_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::geometry::SE3;
    use crate::map::{KeyFrame, MapId};
    use nalgebra::Vector3;

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

    fn make_frame(n: usize, id: u64) -> Frame {
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
        Frame::new(id, 0.0, features, camera(), ScalePyramid::default())
    }

    fn add_kf(map: &mut Map) -> crate::map::KeyFrameId {
        let mut frame = make_frame(20, 0);
        frame.pose_cw = Some(SE3::identity());
        let kf = KeyFrame::from_frame(crate::map::KeyFrameId::next(), &frame, map.id);
        map.insert_keyframe(kf)
    }

    #[test]
    fn test_reference_is_top_voter() {
        let mut map = Map::new(MapId::next());
        let kf_a = add_kf(&mut map);
        let kf_b = add_kf(&mut map);

        // Three landmarks seen by A, one by B.
        let mut frame = make_frame(10, 7);
        for i in 0..3 {
            let lm = map.create_landmark(
                Vector3::new(0.0, 0.0, 2.0),
                Descriptor([0u8; DESCRIPTOR_BYTES]),
                kf_a,
            );
            map.associate(kf_a, i, lm);
            frame.landmarks[i] = Some(lm);
        }
        let lm_b = map.create_landmark(
            Vector3::new(0.0, 0.0, 3.0),
            Descriptor([0u8; DESCRIPTOR_BYTES]),
            kf_b,
        );
        map.associate(kf_b, 0, lm_b);
        frame.landmarks[3] = Some(lm_b);

        let mut local = LocalMap::default();
        local.update(&mut frame, &mut map);

        assert_eq!(local.reference_kf, Some(kf_a));
        assert_eq!(local.keyframes.len(), 2);
        assert_eq!(local.landmarks.len(), 4);
        assert_eq!(map.reference_landmarks.len(), 4);
    }

    #[test]
    fn test_bad_landmarks_are_unlinked() {
        let mut map = Map::new(MapId::next());
        let kf = add_kf(&mut map);
        let lm = map.create_landmark(
            Vector3::new(0.0, 0.0, 2.0),
            Descriptor([0u8; DESCRIPTOR_BYTES]),
            kf,
        );
        map.associate(kf, 0, lm);

        let mut frame = make_frame(5, 3);
        frame.landmarks[0] = Some(lm);
        map.set_landmark_bad(lm);

        let mut local = LocalMap::default();
        local.update(&mut frame, &mut map);
        assert!(frame.landmarks[0].is_none());
        assert!(local.keyframes.is_empty());
    }
}
