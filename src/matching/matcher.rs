//! Descriptor matching over the binary feature space.
//!
//! One `Matcher` instance bundles the nearest-neighbor ratio used by a
//! particular call site (0.9 for frame-to-frame tracking, 0.75 for
//! relocalization, 0.8 for local-map projection), mirroring how the search
//! routines are parameterized in ORB-style pipelines.

use std::collections::HashSet;

use crate::features::Descriptor;
use crate::geometry::SE3;
use crate::map::{Frame, KeyFrame, LandmarkId, Map};

/// Acceptance threshold for a confident match (Hamming).
pub const TH_LOW: u32 = 50;
/// Acceptance threshold for a permissive match (Hamming).
pub const TH_HIGH: u32 = 100;

pub struct Matcher {
    /// Best/second-best distance ratio for ambiguity rejection.
    pub ratio: f64,
}

impl Matcher {
    pub fn new(ratio: f64) -> Self {
        Self { ratio }
    }

    fn best_two(
        &self,
        query: &Descriptor,
        candidates: &[usize],
        descriptors: &[Descriptor],
    ) -> (Option<usize>, u32, u32) {
        let mut best_idx = None;
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        for &idx in candidates {
            let d = query.distance(&descriptors[idx]);
            if d < best {
                second = best;
                best = d;
                best_idx = Some(idx);
            } else if d < second {
                second = d;
            }
        }
        (best_idx, best, second)
    }

    /// Match two small-baseline frames for map initialization.
    ///
    /// For each keypoint of `f1` at the finest pyramid level, searches `f2`
    /// inside `window` pixels. Returns per-`f1`-keypoint indices into `f2`
    /// and the match count; duplicates resolve to the closest descriptor.
    pub fn search_for_initialization(
        &self,
        f1: &Frame,
        f2: &Frame,
        window: f64,
    ) -> (usize, Vec<Option<usize>>) {
        let mut matches12: Vec<Option<usize>> = vec![None; f1.num_keypoints()];
        let mut best_dist2: Vec<u32> = vec![u32::MAX; f2.num_keypoints()];
        let mut owner2: Vec<Option<usize>> = vec![None; f2.num_keypoints()];
        let mut nmatches = 0usize;

        for (i1, kp1) in f1.keypoints.iter().enumerate() {
            if kp1.octave != 0 {
                continue;
            }
            let candidates = f2.features_in_area(kp1.x, kp1.y, window, Some(0), Some(0));
            let (best_idx, best, second) =
                self.best_two(&f1.descriptors[i1], &candidates, &f2.descriptors);
            let Some(i2) = best_idx else { continue };
            if best > TH_LOW || (best as f64) > self.ratio * second as f64 {
                continue;
            }
            if best >= best_dist2[i2] {
                continue;
            }
            // Steal the keypoint from a worse previous owner.
            if let Some(prev) = owner2[i2].take() {
                matches12[prev] = None;
                nmatches -= 1;
            }
            matches12[i1] = Some(i2);
            owner2[i2] = Some(i1);
            best_dist2[i2] = best;
            nmatches += 1;
        }

        (nmatches, matches12)
    }

    /// Carry landmark matches from the previous frame by searching a window
    /// around each of its keypoints.
    ///
    /// Only keypoints at `min_octave` or coarser participate. Matches are
    /// written into `current.landmarks`; returns the number carried over.
    pub fn window_search(
        &self,
        last: &Frame,
        current: &mut Frame,
        window: f64,
        min_octave: u32,
        map: &Map,
    ) -> usize {
        let mut nmatches = 0usize;
        let mut taken: HashSet<usize> = HashSet::new();

        for (i_last, lm_id) in last.landmarks.iter().enumerate() {
            let Some(lm_id) = lm_id else { continue };
            if map.landmark(*lm_id).is_none() {
                continue; // bad or foreign landmark
            }
            let kp = &last.keypoints[i_last];
            if kp.octave < min_octave {
                continue;
            }
            let candidates: Vec<usize> = current
                .features_in_area(kp.x, kp.y, window, Some(min_octave), None)
                .into_iter()
                .filter(|i| !taken.contains(i) && current.landmarks[*i].is_none())
                .collect();
            let (best_idx, best, second) =
                self.best_two(&last.descriptors[i_last], &candidates, &current.descriptors);
            let Some(i2) = best_idx else { continue };
            if best > TH_LOW || (best as f64) > self.ratio * second as f64 {
                continue;
            }
            current.landmarks[i2] = Some(*lm_id);
            taken.insert(i2);
            nmatches += 1;
        }

        nmatches
    }

    /// Project the previous frame's landmarks through the current pose
    /// estimate and pick up additional matches inside `radius` (scaled by
    /// the keypoint's pyramid level).
    pub fn search_by_projection_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        radius: f64,
        map: &Map,
    ) -> usize {
        let Some(pose) = current.pose_cw.clone() else {
            return 0;
        };
        let mut nmatches = 0usize;

        for (i_last, lm_id) in last.landmarks.iter().enumerate() {
            let Some(lm_id) = lm_id else { continue };
            if current.landmarks.contains(&Some(*lm_id)) {
                continue;
            }
            let Some(lm) = map.landmark(*lm_id) else {
                continue;
            };
            let pc = pose.transform_point(&lm.position);
            let Some(px) = current.camera.project(&pc) else {
                continue;
            };
            if !current.camera.in_image(&px) {
                continue;
            }

            let octave = last.keypoints[i_last].octave;
            let r = radius * current.pyramid.scale_of(octave);
            let candidates: Vec<usize> = current
                .features_in_area(
                    px.x,
                    px.y,
                    r,
                    Some(octave.saturating_sub(1)),
                    Some(octave + 1),
                )
                .into_iter()
                .filter(|i| current.landmarks[*i].is_none())
                .collect();
            let (best_idx, best, _) =
                self.best_two(&lm.descriptor, &candidates, &current.descriptors);
            let Some(i2) = best_idx else { continue };
            if best > TH_HIGH {
                continue;
            }
            current.landmarks[i2] = Some(*lm_id);
            nmatches += 1;
        }

        nmatches
    }

    /// Match the local-map landmarks into the current frame by frustum
    /// projection. `th` widens the search (e.g. right after relocalization).
    pub fn search_by_projection_landmarks(
        &self,
        current: &mut Frame,
        landmarks: &[LandmarkId],
        map: &Map,
        th: f64,
    ) -> usize {
        let mut nmatches = 0usize;

        for lm_id in landmarks {
            let Some(lm) = map.landmark(*lm_id) else {
                continue;
            };
            if lm.last_frame_seen == current.id {
                continue; // already matched during the frame-to-frame step
            }
            let Some(proj) = current.project_in_frustum(lm, 0.5) else {
                continue;
            };

            // Wider window for oblique views.
            let base = if proj.view_cos > 0.998 { 2.5 } else { 4.0 };
            let r = th * base * current.pyramid.scale_of(proj.predicted_octave);
            let min_octave = proj.predicted_octave.saturating_sub(1);
            let candidates: Vec<usize> = current
                .features_in_area(proj.u, proj.v, r, Some(min_octave), Some(proj.predicted_octave + 1))
                .into_iter()
                .filter(|i| current.landmarks[*i].is_none())
                .collect();

            let (best_idx, best, second) =
                self.best_two(&lm.descriptor, &candidates, &current.descriptors);
            let Some(i2) = best_idx else { continue };
            if best > TH_HIGH || (best as f64) > self.ratio * second as f64 {
                continue;
            }
            current.landmarks[i2] = Some(*lm_id);
            nmatches += 1;
        }

        nmatches
    }

    /// Relocalization refinement: project a candidate keyframe's landmarks
    /// into the frame, skipping those already found, with a Hamming cap
    /// `orb_dist` (the narrower second pass uses 64).
    pub fn search_by_projection_keyframe(
        &self,
        current: &mut Frame,
        kf: &KeyFrame,
        map: &Map,
        already_found: &HashSet<LandmarkId>,
        th: f64,
        orb_dist: u32,
    ) -> usize {
        let Some(pose) = current.pose_cw.clone() else {
            return 0;
        };
        let mut nmatches = 0usize;

        for (_, lm_id) in kf.landmark_indices() {
            if already_found.contains(&lm_id) {
                continue;
            }
            let Some(lm) = map.landmark(lm_id) else {
                continue;
            };
            let pc = pose.transform_point(&lm.position);
            let Some(px) = current.camera.project(&pc) else {
                continue;
            };
            if !current.camera.in_image(&px) {
                continue;
            }

            let dist = (lm.position - pose.camera_center()).norm();
            let octave = lm.predict_octave(dist, &current.pyramid);
            let r = th * current.pyramid.scale_of(octave);
            let candidates: Vec<usize> = current
                .features_in_area(px.x, px.y, r, Some(octave.saturating_sub(1)), Some(octave + 1))
                .into_iter()
                .filter(|i| current.landmarks[*i].is_none())
                .collect();

            let (best_idx, best, _) =
                self.best_two(&lm.descriptor, &candidates, &current.descriptors);
            let Some(i2) = best_idx else { continue };
            if best > orb_dist {
                continue;
            }
            current.landmarks[i2] = Some(lm_id);
            nmatches += 1;
        }

        nmatches
    }

    /// Match a keyframe's landmarks into a frame through the shared
    /// vocabulary nodes (both must carry feature vectors).
    pub fn search_by_bow(&self, kf: &KeyFrame, current: &mut Frame, map: &Map) -> usize {
        let (Some(fv_kf), Some(fv_frame)) = (kf.feature_vec.as_ref(), current.feature_vec.as_ref())
        else {
            return 0;
        };

        let mut assignments: Vec<(usize, LandmarkId)> = Vec::new();
        let mut taken: HashSet<usize> = HashSet::new();

        for (node, kf_indices) in fv_kf {
            let Some(frame_indices) = fv_frame.get(node) else {
                continue;
            };
            for &i_kf in kf_indices {
                let Some(lm_id) = kf.landmark_at(i_kf) else {
                    continue;
                };
                if map.landmark(lm_id).is_none() {
                    continue;
                }
                let candidates: Vec<usize> = frame_indices
                    .iter()
                    .copied()
                    .filter(|i| !taken.contains(i) && current.landmarks[*i].is_none())
                    .collect();
                let (best_idx, best, second) =
                    self.best_two(&kf.descriptors[i_kf], &candidates, &current.descriptors);
                let Some(i2) = best_idx else { continue };
                if best > TH_LOW || (best as f64) > self.ratio * second as f64 {
                    continue;
                }
                assignments.push((i2, lm_id));
                taken.insert(i2);
            }
        }

        let n = assignments.len();
        for (idx, lm_id) in assignments {
            current.landmarks[idx] = Some(lm_id);
        }
        n
    }

    /// Landmark-to-landmark matches between two keyframes via vocabulary
    /// nodes; used to seed the Sim(3) solver. Returns pairs of keypoint
    /// indices `(idx1, idx2)` whose slots hold landmarks in `map`.
    pub fn search_by_bow_keyframes(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        map: &Map,
    ) -> Vec<(usize, usize)> {
        let (Some(fv1), Some(fv2)) = (kf1.feature_vec.as_ref(), kf2.feature_vec.as_ref()) else {
            return Vec::new();
        };

        let mut pairs = Vec::new();
        let mut taken2: HashSet<usize> = HashSet::new();

        for (node, indices1) in fv1 {
            let Some(indices2) = fv2.get(node) else {
                continue;
            };
            for &i1 in indices1 {
                if kf1
                    .landmark_at(i1)
                    .and_then(|id| map.landmark(id))
                    .is_none()
                {
                    continue;
                }
                let candidates: Vec<usize> = indices2
                    .iter()
                    .copied()
                    .filter(|i| {
                        !taken2.contains(i)
                            && kf2.landmark_at(*i).and_then(|id| map.landmark(id)).is_some()
                    })
                    .collect();
                let (best_idx, best, second) =
                    self.best_two(&kf1.descriptors[i1], &candidates, &kf2.descriptors);
                let Some(i2) = best_idx else { continue };
                if best > TH_LOW || (best as f64) > self.ratio * second as f64 {
                    continue;
                }
                pairs.push((i1, i2));
                taken2.insert(i2);
            }
        }

        pairs
    }

    /// Project landmarks into a keyframe under an explicit pose and merge
    /// duplicates: an unmatched keypoint gains an observation, a matched one
    /// keeps whichever landmark has more observations. With
    /// `prefer_incoming` set (loop fusion), the projected landmark always
    /// absorbs the local duplicate.
    ///
    /// Returns the number of fused or newly observed landmarks.
    pub fn fuse(
        &self,
        map: &mut Map,
        kf_id: crate::map::KeyFrameId,
        pose_cw: &SE3,
        landmarks: &[LandmarkId],
        radius: f64,
        prefer_incoming: bool,
    ) -> usize {
        let mut fused = 0usize;
        for &lm_id in landmarks {
            let Some(lm) = map.landmark(lm_id) else {
                continue;
            };
            let (candidate_idx, best) = {
                let Some(kf) = map.keyframe(kf_id) else {
                    return fused;
                };
                if lm.observations.contains_key(&kf_id) {
                    continue;
                }
                let pc = pose_cw.transform_point(&lm.position);
                let Some(px) = kf.camera.project(&pc) else {
                    continue;
                };
                if !kf.camera.in_image(&px) {
                    continue;
                }
                let dist = (lm.position - pose_cw.camera_center()).norm();
                if !lm.is_in_distance_range(dist) {
                    continue;
                }
                let octave = lm.predict_octave(dist, &kf.pyramid);
                let r = radius * kf.pyramid.scale_of(octave);
                let candidates =
                    kf.features_in_area(px.x, px.y, r, Some(octave.saturating_sub(1)), Some(octave + 1));
                let (best_idx, best, _) =
                    self.best_two(&lm.descriptor, &candidates, &kf.descriptors);
                (best_idx, best)
            };

            let Some(idx) = candidate_idx else { continue };
            if best > TH_LOW {
                continue;
            }

            let existing = map.keyframe(kf_id).and_then(|kf| kf.landmark_at(idx));
            match existing {
                Some(existing_id) if existing_id != lm_id => {
                    let n_existing = map
                        .landmark(existing_id)
                        .map(|l| l.num_observations())
                        .unwrap_or(0);
                    let n_new = map.landmark(lm_id).map(|l| l.num_observations()).unwrap_or(0);
                    if !prefer_incoming && n_existing >= n_new {
                        map.replace_landmark(lm_id, existing_id);
                    } else {
                        map.replace_landmark(existing_id, lm_id);
                    }
                    fused += 1;
                }
                Some(_) => {}
                None => {
                    map.associate(kf_id, idx, lm_id);
                    map.refresh_landmark(lm_id);
                    fused += 1;
                }
            }
        }
        fused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::map::MapId;
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

    fn descriptor(tag: u8) -> Descriptor {
        let mut d = [0u8; DESCRIPTOR_BYTES];
        d[0] = tag;
        d[1] = tag.wrapping_mul(31);
        Descriptor(d)
    }

    fn frame_with(pts: &[(f64, f64, u8)]) -> Frame {
        let features = Features {
            keypoints: pts
                .iter()
                .map(|&(x, y, _)| KeyPoint {
                    x,
                    y,
                    octave: 0,
                    angle: 0.0,
                })
                .collect(),
            descriptors: pts.iter().map(|&(_, _, t)| descriptor(t)).collect(),
        };
        Frame::new(0, 0.0, features, camera(), ScalePyramid::default())
    }

    #[test]
    fn test_search_for_initialization_matches_nearby() {
        let matcher = Matcher::new(0.9);
        let f1 = frame_with(&[(100.0, 100.0, 1), (200.0, 200.0, 2)]);
        let f2 = frame_with(&[(104.0, 101.0, 1), (203.0, 199.0, 2)]);

        let (n, matches) = matcher.search_for_initialization(&f1, &f2, 50.0);
        assert_eq!(n, 2);
        assert_eq!(matches[0], Some(0));
        assert_eq!(matches[1], Some(1));
    }

    #[test]
    fn test_initialization_rejects_far_candidates() {
        let matcher = Matcher::new(0.9);
        let f1 = frame_with(&[(100.0, 100.0, 1)]);
        let f2 = frame_with(&[(400.0, 400.0, 1)]);

        let (n, _) = matcher.search_for_initialization(&f1, &f2, 50.0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_window_search_carries_landmarks() {
        let matcher = Matcher::new(0.9);
        let mut map = Map::new(MapId::next());
        let last = frame_with(&[(100.0, 100.0, 1)]);
        let mut current = frame_with(&[(102.0, 100.0, 1)]);

        // Landmark observed by the previous frame.
        let mut last = last;
        let kf_stub = crate::map::KeyFrameId::next();
        let lm = map.create_landmark(Vector3::new(0.0, 0.0, 2.0), descriptor(1), kf_stub);
        last.landmarks[0] = Some(lm);

        let n = matcher.window_search(&last, &mut current, 50.0, 0, &map);
        assert_eq!(n, 1);
        assert_eq!(current.landmarks[0], Some(lm));
    }
}
