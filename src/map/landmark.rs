//! Landmark (map point) - a 3D point in world coordinates.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::{Descriptor, ScalePyramid};

use super::types::{KeyFrameId, LandmarkId};

#[derive(Clone)]
pub struct Landmark {
    pub id: LandmarkId,

    /// Position in world coordinates.
    pub position: Vector3<f64>,

    /// Mean viewing direction over all observations (unit vector).
    pub normal: Vector3<f64>,

    /// Representative descriptor: minimum median Hamming distance to all
    /// observation descriptors.
    pub descriptor: Descriptor,

    /// Observing keyframes, mapped to the keypoint index in each.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Reference keyframe (usually the creator).
    pub reference_kf: KeyFrameId,

    /// KeyFrame at whose creation this landmark appeared; drives the
    /// recent-landmark culling window.
    pub first_kf: KeyFrameId,

    /// Valid observation distance range derived from the scale pyramid.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the point fell into a tracked frame's frustum.
    pub visible: u32,
    /// Times the point was matched in a tracked frame.
    pub found: u32,

    /// Logical deletion flag; checked on every dereference.
    pub bad: bool,

    /// Last frame id this landmark was seen by Tracking (dedup marker).
    pub last_frame_seen: u64,
    /// Local-map assembly marker (dedup by frame id).
    pub track_reference_for_frame: u64,
}

impl Landmark {
    pub fn new(
        id: LandmarkId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            normal: Vector3::zeros(),
            descriptor,
            observations: HashMap::new(),
            reference_kf,
            first_kf: reference_kf,
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible: 1,
            found: 1,
            bad: false,
            last_frame_seen: 0,
            track_reference_for_frame: 0,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, keypoint_idx: usize) {
        self.observations.insert(kf_id, keypoint_idx);
    }

    /// Remove an observation; returns true if it existed. If the reference
    /// keyframe is removed, another observer takes its place.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        let existed = self.observations.remove(&kf_id).is_some();
        if existed && self.reference_kf == kf_id {
            if let Some((&new_ref, _)) = self.observations.iter().min_by_key(|(id, _)| id.0) {
                self.reference_kf = new_ref;
            }
        }
        existed
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn increase_visible(&mut self) {
        self.visible += 1;
    }

    pub fn increase_found(&mut self) {
        self.found += 1;
    }

    /// found / visible, the stability score used by culling.
    pub fn found_ratio(&self) -> f64 {
        if self.visible == 0 {
            1.0
        } else {
            self.found as f64 / self.visible as f64
        }
    }

    pub fn set_bad(&mut self) {
        self.bad = true;
    }

    /// Scale-invariance range with the usual 0.8/1.2 slack.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }

    /// Pyramid level a keypoint on this landmark is expected at for the
    /// given viewing distance.
    pub fn predict_octave(&self, distance: f64, pyramid: &ScalePyramid) -> u32 {
        if self.max_distance <= 0.0 || !self.max_distance.is_finite() {
            return 0;
        }
        pyramid.predict_octave(self.max_distance / distance.max(1e-12))
    }

    /// Recompute the mean viewing direction and the distance bounds from the
    /// observing keyframe centers and the reference observation's octave.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = (KeyFrameId, &'a Vector3<f64>)>,
        reference_octave: u32,
        pyramid: &ScalePyramid,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        let mut ref_dist = None;

        for (kf_id, center) in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-12 {
                normal_sum += dir / dist;
                n += 1;
            }
            if kf_id == self.reference_kf {
                ref_dist = Some(dist);
            }
        }

        if n > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-12 {
                self.normal = normal_sum / norm;
            }
        }

        if let Some(dist) = ref_dist {
            // The point was detected at `reference_octave`; scale invariance
            // bounds the distances it can be re-detected at.
            let level_scale = pyramid.scale_of(reference_octave);
            self.max_distance = dist * level_scale;
            self.min_distance = self.max_distance / pyramid.level_range();
        }
    }

    /// Pick the descriptor with the least median Hamming distance to all
    /// observation descriptors.
    pub fn compute_distinctive_descriptor(&mut self, observed: &[Descriptor]) {
        if observed.is_empty() {
            return;
        }
        let mut best_median = u32::MAX;
        let mut best = self.descriptor;
        for a in observed {
            let mut dists: Vec<u32> = observed.iter().map(|b| a.distance(b)).collect();
            dists.sort_unstable();
            let median = dists[dists.len() / 2];
            if median < best_median {
                best_median = median;
                best = *a;
            }
        }
        self.descriptor = best;
    }
}

impl std::fmt::Debug for Landmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Landmark")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible", &self.visible)
            .field("found", &self.found)
            .field("bad", &self.bad)
            .finish()
    }
}
