//! Relocalization: recover a pose for the current frame when tracking is
//! lost.
//!
//! The worker consumes frames pushed by Tracking while loss persists and
//! searches every non-erased map (global mode). The inline variant runs on
//! the tracking thread during loop closing and restricts candidates to the
//! last keyframe's covisibility neighborhood. Both share the same candidate
//! ladder: BoW matching, P4P RANSAC, pose optimization, then two projection
//! refinement passes.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nalgebra::Vector2;
use tracing::{debug, info};

use crate::map::{Frame, KeyFrameId, Map, SharedMap};
use crate::matching::Matcher;
use crate::optim;
use crate::pnp::{PnpParams, PnpSolver};
use crate::system::shared::RelocalizationSuccess;
use crate::system::SharedContext;

/// BoW matches a candidate keyframe must reach to stay in the pool.
const MIN_BOW_MATCHES: usize = 15;
/// Inliers required after the final optimization.
const MIN_ACCEPT_INLIERS: usize = 50;
/// RANSAC iterations spent per candidate per outer pass.
const RANSAC_BATCH: usize = 5;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Relocalizer {
    shared: Arc<SharedContext>,
    frames: Receiver<Frame>,
}

impl Relocalizer {
    pub fn new(shared: Arc<SharedContext>, frames: Receiver<Frame>) -> Self {
        Self { shared, frames }
    }

    /// Worker loop. Runs until shutdown; parks on its gate while Tracking
    /// has not requested relocalization.
    pub fn run(&mut self) {
        info!("relocalization thread started");
        loop {
            if self.shared.is_shutdown() {
                break;
            }
            self.shared
                .relocalization_gate
                .check_in(&self.shared.shutdown);
            if self.shared.relocalization_gate.take_reset_request() {
                while self.frames.try_recv().is_ok() {}
                continue;
            }

            let frame = match self.frames.recv_timeout(RECV_TIMEOUT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.shared.relocalization.requested.load(Ordering::SeqCst) {
                continue; // stale frame from a previous episode
            }
            if self.shared.relocalization.success.lock().is_some() {
                continue; // waiting for Tracking to commit
            }

            self.try_frame(frame);
        }
        info!("relocalization thread exiting");
    }

    /// Global mode: search every non-erased map for a consistent pose.
    fn try_frame(&self, mut frame: Frame) {
        frame.ensure_bow(self.shared.vocabulary());

        for shared_map in self.shared.map_db.live_maps() {
            let relocalized = {
                let map = shared_map.read();
                let candidates = candidates_from_database(&frame, &map);
                if candidates.is_empty() {
                    false
                } else {
                    attempt_candidates(&mut frame, &map, &candidates)
                }
            };
            if relocalized {
                info!(map = %shared_map.id(), frame = frame.id, "relocalized into map");
                self.publish_success(frame, shared_map);
                return;
            }
        }
        debug!(frame = frame.id, "relocalization attempt failed");
    }

    fn publish_success(&self, frame: Frame, map: Arc<SharedMap>) {
        self.shared
            .relocalization
            .accepting_frames
            .store(false, Ordering::SeqCst);
        *self.shared.relocalization.success.lock() = Some(RelocalizationSuccess { frame, map });
    }
}

/// Inline relocalization on the tracking thread.
///
/// Candidates come from the current map's database; with no current map the
/// search is the last keyframe's top-9 covisibles plus the last keyframe
/// itself. Returns true when a pose was committed into `frame`.
pub fn relocalize_inline(
    frame: &mut Frame,
    shared: &SharedContext,
    last_keyframe: Option<KeyFrameId>,
) -> bool {
    frame.ensure_bow(shared.vocabulary());

    if let Some(shared_map) = shared.map_db.current() {
        let map = shared_map.read();
        let candidates = candidates_from_database(frame, &map);
        return attempt_candidates(frame, &map, &candidates);
    }

    // No current map: relocalize against the last keyframe's neighborhood.
    let Some(last_kf) = last_keyframe else {
        return false;
    };
    for shared_map in shared.map_db.live_maps() {
        let map = shared_map.read();
        let Some(kf) = map.keyframe(last_kf) else {
            continue;
        };
        let mut candidates = kf.best_covisibles_readonly(9);
        candidates.push(last_kf);
        if attempt_candidates(frame, &map, &candidates) {
            return true;
        }
    }
    false
}

/// Retrieval candidates for a lost frame from a map's keyframe database.
fn candidates_from_database(frame: &Frame, map: &Map) -> Vec<KeyFrameId> {
    let Some(bow) = frame.bow.as_ref() else {
        return Vec::new();
    };
    map.keyframe_db
        .query(bow, &HashSet::new(), 0.0)
        .into_iter()
        .map(|c| c.keyframe_id)
        .collect()
}

struct CandidateState {
    kf_id: KeyFrameId,
    /// The frame with this candidate's BoW matches applied.
    frame: Frame,
    solver: PnpSolver,
    discarded: bool,
}

/// The candidate ladder shared by both modes. On success the pose and the
/// supporting matches are written into `frame`.
fn attempt_candidates(frame: &mut Frame, map: &Map, candidates: &[KeyFrameId]) -> bool {
    let bow_matcher = Matcher::new(0.75);
    let mut states: Vec<CandidateState> = Vec::new();

    for &kf_id in candidates {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        let mut candidate_frame = frame.clone();
        let nmatches = bow_matcher.search_by_bow(kf, &mut candidate_frame, map);
        if nmatches < MIN_BOW_MATCHES {
            continue;
        }

        let correspondences: Vec<(nalgebra::Vector3<f64>, Vector2<f64>, f64)> = candidate_frame
            .landmarks
            .iter()
            .enumerate()
            .filter_map(|(idx, lm_id)| {
                let lm = map.landmark((*lm_id)?)?;
                let kp = &candidate_frame.keypoints[idx];
                Some((
                    lm.position,
                    Vector2::new(kp.x, kp.y),
                    1.0 / candidate_frame.pyramid.sigma2_of(kp.octave),
                ))
            })
            .collect();

        let solver = PnpSolver::new(candidate_frame.camera, correspondences, PnpParams::default());
        states.push(CandidateState {
            kf_id,
            frame: candidate_frame,
            solver,
            discarded: false,
        });
    }

    // Round-robin RANSAC batches until a candidate yields a supported pose.
    let mut remaining = states.len();
    while remaining > 0 {
        for state in states.iter_mut() {
            if state.discarded {
                continue;
            }
            let (result, no_more) = state.solver.iterate(RANSAC_BATCH);
            let had_pose = result.is_some();

            if let Some(pnp) = result {
                // Keep only the inlier associations for optimization.
                let mut working = state.frame.clone();
                working.pose_cw = Some(pnp.pose_cw.clone());
                apply_inlier_mask(&mut working, map, &pnp.inliers);
                if refine_candidate(&mut working, map, state.kf_id) {
                    *frame = working;
                    return true;
                }
            }

            // A refined-but-rejected pose is final for this candidate (the
            // solver would keep returning the same best model), as is an
            // exhausted iteration budget.
            if no_more || had_pose {
                state.discarded = true;
                remaining -= 1;
            }
        }
    }
    false
}

/// Restrict a frame's associations to the PnP inliers.
fn apply_inlier_mask(frame: &mut Frame, map: &Map, inliers: &[bool]) {
    let mut corr_idx = 0usize;
    for idx in 0..frame.landmarks.len() {
        let Some(lm_id) = frame.landmarks[idx] else {
            continue;
        };
        if map.landmark(lm_id).is_none() {
            frame.landmarks[idx] = None;
            continue;
        }
        if corr_idx < inliers.len() && !inliers[corr_idx] {
            frame.landmarks[idx] = None;
        }
        corr_idx += 1;
    }
}

/// Optimization plus the two projection-refinement passes.
fn refine_candidate(frame: &mut Frame, map: &Map, kf_id: KeyFrameId) -> bool {
    let mut n_good = optim::optimize_pose(frame, map);
    if n_good < 10 {
        return false;
    }
    frame.discard_outliers();

    let matcher = Matcher::new(0.9);
    let Some(kf) = map.keyframe(kf_id) else {
        return false;
    };

    if n_good < MIN_ACCEPT_INLIERS {
        let found: HashSet<_> = frame.landmarks.iter().flatten().copied().collect();
        let additional = matcher.search_by_projection_keyframe(frame, kf, map, &found, 10.0, 100);

        if additional + n_good >= MIN_ACCEPT_INLIERS {
            n_good = optim::optimize_pose(frame, map);

            // Many inliers but not quite enough: one narrower pass now that
            // the pose is better conditioned.
            if n_good > 30 && n_good < MIN_ACCEPT_INLIERS {
                let found: HashSet<_> = frame.landmarks.iter().flatten().copied().collect();
                let additional =
                    matcher.search_by_projection_keyframe(frame, kf, map, &found, 3.0, 64);
                if n_good + additional >= MIN_ACCEPT_INLIERS {
                    n_good = optim::optimize_pose(frame, map);
                    frame.discard_outliers();
                }
            }
        }
    }

    n_good >= MIN_ACCEPT_INLIERS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::geometry::SE3;
    use crate::map::{KeyFrame, MapId};
    use crate::vocabulary::Vocabulary;
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

    /// A keyframe observing a grid of landmarks, and a query frame seeing the
    /// same landmarks from a nearby pose, should relocalize.
    #[test]
    fn test_candidate_ladder_recovers_pose() {
        let cam = camera();
        let vocab = Arc::new(Vocabulary::from_words(
            (0..64).map(tag_descriptor).collect(),
        ));
        let mut map = Map::new(MapId::next());

        let world: Vec<Vector3<f64>> = (0..60)
            .map(|i| {
                Vector3::new(
                    (i % 10) as f64 * 0.35 - 1.6,
                    (i / 10) as f64 * 0.4 - 1.2,
                    4.0 + ((i * 3) % 7) as f64 * 0.2,
                )
            })
            .collect();

        let kf_pose = SE3::identity();
        let keypoints: Vec<KeyPoint> = world
            .iter()
            .map(|p| {
                let px = cam.project(&kf_pose.transform_point(p)).unwrap();
                KeyPoint {
                    x: px.x,
                    y: px.y,
                    octave: 0,
                    angle: 0.0,
                }
            })
            .collect();
        let descriptors: Vec<Descriptor> = (0..world.len()).map(tag_descriptor).collect();
        let mut kf_frame = Frame::new(
            0,
            0.0,
            Features {
                keypoints,
                descriptors: descriptors.clone(),
            },
            cam,
            ScalePyramid::default(),
        );
        kf_frame.pose_cw = Some(kf_pose.clone());
        kf_frame.ensure_bow(&vocab);
        let kf = KeyFrame::from_frame(KeyFrameId::next(), &kf_frame, map.id);
        let kf_id = map.insert_keyframe(kf);
        for (i, p) in world.iter().enumerate() {
            let lm = map.create_landmark(*p, descriptors[i], kf_id);
            map.associate(kf_id, i, lm);
            map.refresh_landmark(lm);
        }

        // Query frame from a displaced pose.
        let query_pose = SE3 {
            rotation: nalgebra::UnitQuaternion::from_euler_angles(0.01, -0.02, 0.015),
            translation: Vector3::new(0.1, 0.05, -0.1),
        };
        let q_keypoints: Vec<KeyPoint> = world
            .iter()
            .map(|p| {
                let px = cam.project(&query_pose.transform_point(p)).unwrap();
                KeyPoint {
                    x: px.x,
                    y: px.y,
                    octave: 0,
                    angle: 0.0,
                }
            })
            .collect();
        let mut query = Frame::new(
            10,
            1.0,
            Features {
                keypoints: q_keypoints,
                descriptors,
            },
            cam,
            ScalePyramid::default(),
        );
        query.ensure_bow(&vocab);

        assert!(attempt_candidates(&mut query, &map, &[kf_id]));
        let pose = query.pose_cw.unwrap();
        assert!((pose.translation - query_pose.translation).norm() < 1e-2);
        assert!(pose.rotation.angle_to(&query_pose.rotation) < 1e-2);
    }

    #[test]
    fn test_unrelated_frame_fails() {
        let cam = camera();
        let vocab = Arc::new(Vocabulary::from_words(
            (0..64).map(tag_descriptor).collect(),
        ));
        let map = Map::new(MapId::next());

        let features = Features {
            keypoints: (0..30)
                .map(|i| KeyPoint {
                    x: 10.0 * i as f64,
                    y: 200.0,
                    octave: 0,
                    angle: 0.0,
                })
                .collect(),
            descriptors: (100..130).map(tag_descriptor).collect(),
        };
        let mut query = Frame::new(0, 0.0, features, cam, ScalePyramid::default());
        query.ensure_bow(&vocab);

        assert!(!attempt_candidates(&mut query, &map, &[]));
    }
}
