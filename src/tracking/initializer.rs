//! Two-view map initialization.
//!
//! Holds the reference frame picked by `FirstInitialization`, matches it
//! against the current frame, runs the two-view reconstruction, and on
//! success builds a fresh map: two keyframes, the triangulated landmarks, a
//! global bundle-adjustment pass and the rescale to unit median depth.

use std::sync::Arc;

use nalgebra::Vector2;
use tracing::{debug, info};

use crate::geometry::SE3;
use crate::map::{Frame, KeyFrame, KeyFrameId, SharedMap};
use crate::matching::Matcher;
use crate::optim;
use crate::system::SharedContext;
use crate::two_view;

/// Keypoints needed before a frame can seed or continue initialization.
const MIN_KEYPOINTS: usize = 100;
/// Matches needed between the reference and current frames.
const MIN_MATCHES: usize = 100;
/// Landmarks the second keyframe must track after bundle adjustment.
const MIN_TRACKED: usize = 100;
/// Pixel window for the initialization matcher.
const SEARCH_WINDOW: f64 = 100.0;

pub struct InitialMap {
    pub map: Arc<SharedMap>,
    pub kf_ini: KeyFrameId,
    pub kf_cur: KeyFrameId,
}

pub enum InitOutcome {
    /// Too few keypoints or matches; drop back to NOT_INITIALIZED.
    TooFewFeatures,
    /// Geometry did not resolve this frame; stay INITIALIZING.
    NoGeometry,
    /// The reconstruction was rejected (depth or coverage); back to
    /// NOT_INITIALIZED, the partial map already erased.
    Rejected,
    Success(InitialMap),
}

#[derive(Default)]
pub struct Initializer {
    reference: Option<Frame>,
}

impl Initializer {
    /// Store a reference frame if it carries enough keypoints.
    pub fn set_reference(&mut self, frame: &Frame) -> bool {
        if frame.num_keypoints() > MIN_KEYPOINTS {
            self.reference = Some(frame.clone());
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.reference = None;
    }

    /// Attempt initialization against the stored reference frame.
    pub fn initialize(&mut self, current: &mut Frame, shared: &SharedContext) -> InitOutcome {
        if current.num_keypoints() <= MIN_KEYPOINTS {
            self.reference = None;
            return InitOutcome::TooFewFeatures;
        }
        let Some(reference) = self.reference.as_ref() else {
            return InitOutcome::TooFewFeatures;
        };

        let matcher = Matcher::new(0.9);
        let (nmatches, matches) = matcher.search_for_initialization(reference, current, SEARCH_WINDOW);
        if nmatches < MIN_MATCHES {
            self.reference = None;
            return InitOutcome::TooFewFeatures;
        }

        // Two-view geometry over the matched normalized coordinates.
        let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(nmatches);
        let mut xn1: Vec<Vector2<f64>> = Vec::with_capacity(nmatches);
        let mut xn2: Vec<Vector2<f64>> = Vec::with_capacity(nmatches);
        for (i1, m) in matches.iter().enumerate() {
            if let Some(i2) = m {
                pairs.push((i1, *i2));
                xn1.push(reference.normalized(i1));
                xn2.push(current.normalized(*i2));
            }
        }
        let Some(rec) = two_view::reconstruct(&xn1, &xn2) else {
            debug!(matches = nmatches, "two-view geometry not resolved yet");
            return InitOutcome::NoGeometry;
        };
        if rec.n_triangulated < MIN_MATCHES {
            debug!(
                triangulated = rec.n_triangulated,
                "not enough triangulated correspondences"
            );
            return InitOutcome::NoGeometry;
        }

        // Build the map.
        let mut reference = self.reference.take().unwrap();
        reference.pose_cw = Some(SE3::identity());
        current.pose_cw = Some(rec.pose_cw.clone());

        let vocabulary = shared.vocabulary();
        reference.ensure_bow(vocabulary);
        current.ensure_bow(vocabulary);

        let shared_map = shared.map_db.create_map();
        let (kf_ini, kf_cur) = {
            let mut map = shared_map.write();
            let map_id = map.id;
            let kf_ini = map.insert_keyframe(KeyFrame::from_frame(
                KeyFrameId::next(),
                &reference,
                map_id,
            ));
            let kf_cur =
                map.insert_keyframe(KeyFrame::from_frame(KeyFrameId::next(), current, map_id));

            for ((i1, i2), point) in pairs.iter().zip(rec.points.iter()) {
                let Some(point) = point else { continue };
                let lm_id =
                    map.create_landmark(*point, current.descriptors[*i2], kf_cur);
                map.associate(kf_ini, *i1, lm_id);
                map.associate(kf_cur, *i2, lm_id);
                map.refresh_landmark(lm_id);
                current.landmarks[*i2] = Some(lm_id);
            }

            map.update_connections(kf_ini);
            map.update_connections(kf_cur);

            // Retrieval entries for both keyframes.
            for &kf_id in &[kf_ini, kf_cur] {
                if let Some(bow) = map.keyframe(kf_id).and_then(|kf| kf.bow.clone()) {
                    map.keyframe_db.add(kf_id, bow);
                }
            }

            info!(
                landmarks = map.num_landmarks(),
                "new map created from two views"
            );

            // Refine the initial structure.
            if let Some(problem) = optim::collect_global_ba(&map) {
                if let Some(result) = optim::solve_ba(&problem, 20, &|| false) {
                    optim::apply_ba_results(&mut map, &result);
                }
            }

            let median_depth = map.median_scene_depth(kf_ini);
            let tracked = map
                .keyframe(kf_cur)
                .map(|kf| {
                    kf.landmark_indices()
                        .filter(|(_, lm)| map.landmark(*lm).is_some())
                        .count()
                })
                .unwrap_or(0);
            if median_depth < 0.0 || tracked < MIN_TRACKED {
                info!(median_depth, tracked, "wrong initialization, resetting");
                drop(map);
                shared.map_db.erase_map(shared_map.id());
                return InitOutcome::Rejected;
            }

            // Normalize the monocular scale: median scene depth becomes 1.
            map.rescale(1.0 / median_depth);
            if let Some(kf) = map.keyframe(kf_cur) {
                current.pose_cw = Some(kf.pose_cw.clone());
            }

            (kf_ini, kf_cur)
        };

        shared.map_db.set_current(Arc::clone(&shared_map));
        InitOutcome::Success(InitialMap {
            map: shared_map,
            kf_ini,
            kf_cur,
        })
    }
}
