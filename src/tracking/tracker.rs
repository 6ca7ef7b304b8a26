//! Tracking: per-frame pose estimation and keyframe insertion.
//!
//! One frame at a time: establish a pose prior (motion model or window
//! search against the previous frame), optimize, track the local map,
//! decide keyframe promotion, and coordinate the other workers on loss.
//! Failures never kill the thread; they only downgrade the state machine
//! and hand control to Relocalization.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::features::{Features, ScalePyramid};
use crate::geometry::SE3;
use crate::map::{Frame, KeyFrame, KeyFrameId, Map, SharedMap};
use crate::matching::Matcher;
use crate::optim;
use crate::publish::{FramePublisher, PosePublisher};
use crate::relocalization;
use crate::system::SharedContext;

use super::initializer::{InitOutcome, Initializer};
use super::local_map::LocalMap;
use super::TrackingState;

/// Message to LocalMapping: a keyframe freshly inserted into a map.
pub type NewKeyFrame = (Arc<SharedMap>, KeyFrameId);

pub struct Tracker {
    shared: Arc<SharedContext>,
    settings: Settings,
    pyramid: ScalePyramid,

    pub state: TrackingState,

    initializer: Initializer,
    local_map: LocalMap,

    last_frame: Option<Frame>,
    /// Constant-velocity motion model `V = Tcw · Twc_prev`; cleared on any
    /// tracking failure.
    velocity: Option<SE3>,

    reference_kf: Option<KeyFrameId>,
    last_keyframe: Option<KeyFrameId>,
    /// Frame id at the last keyframe insertion.
    last_kf_frame_id: u64,
    /// Frame id at the last relocalization (or forced request).
    last_reloc_frame_id: u64,

    next_frame_id: u64,
    /// Inliers of the latest local-map optimization.
    matches_inliers: usize,

    kf_sender: Sender<NewKeyFrame>,
    reloc_sender: Sender<Frame>,

    pose_publisher: Arc<dyn PosePublisher>,
    frame_publisher: Arc<dyn FramePublisher>,
}

impl Tracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<SharedContext>,
        settings: Settings,
        pyramid: ScalePyramid,
        kf_sender: Sender<NewKeyFrame>,
        reloc_sender: Sender<Frame>,
        pose_publisher: Arc<dyn PosePublisher>,
        frame_publisher: Arc<dyn FramePublisher>,
    ) -> Self {
        if settings.use_motion_model {
            info!("motion model: enabled");
        } else {
            info!("motion model: disabled (UseMotionModel: 1 is recommended)");
        }
        Self {
            shared,
            settings,
            pyramid,
            state: TrackingState::NoImagesYet,
            initializer: Initializer::default(),
            local_map: LocalMap::default(),
            last_frame: None,
            velocity: None,
            reference_kf: None,
            last_keyframe: None,
            last_kf_frame_id: 0,
            last_reloc_frame_id: 0,
            next_frame_id: 0,
            matches_inliers: 0,
            kf_sender,
            reloc_sender,
            pose_publisher,
            frame_publisher,
        }
    }

    /// Process one image worth of extracted features.
    pub fn process(&mut self, features: Features, timestamp: f64) {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        let mut frame = Frame::new(id, timestamp, features, self.settings.camera, self.pyramid);

        self.service_relocalization(&frame);

        match self.state {
            TrackingState::NoImagesYet => {
                self.state = TrackingState::NotInitialized;
                self.first_initialization(&frame);
            }
            TrackingState::NotInitialized => {
                self.first_initialization(&frame);
            }
            TrackingState::Initializing => {
                self.continue_initialization(&mut frame);
            }
            TrackingState::Working => {
                self.track(&mut frame);
            }
        }

        if self
            .shared
            .relocalization
            .inline_requested
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            self.relocalize_inline(&mut frame);
        }

        self.frame_publisher
            .publish_frame(&frame, self.state.label(), self.matches_inliers);
        if let Some(pose) = frame.pose_cw.as_ref() {
            self.pose_publisher.publish_pose(pose);
        }
        self.shared
            .frames_processed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.last_frame = Some(frame);
    }

    // Relocalization handshake ------------------------------------------------

    fn service_relocalization(&mut self, frame: &Frame) {
        use std::sync::atomic::Ordering;
        if !self.shared.relocalization.requested.load(Ordering::SeqCst) {
            return;
        }
        if self
            .shared
            .relocalization
            .accepting_frames
            .load(Ordering::SeqCst)
        {
            let _ = self.reloc_sender.try_send(frame.clone());
        }
        if let Some(success) = self.shared.relocalization.success.lock().take() {
            info!(frame = success.frame.id, "relocalization committed");
            self.last_reloc_frame_id = success.frame.id;
            self.last_frame = Some(success.frame);
            self.velocity = None;
            self.shared.map_db.set_current(success.map);
            self.state = TrackingState::Working;
            self.shared.leave_relocalization();
            self.shared
                .publisher_reset_requested
                .store(false, Ordering::SeqCst);
        }
    }

    // Initialization ----------------------------------------------------------

    fn first_initialization(&mut self, frame: &Frame) {
        if self.initializer.set_reference(frame) {
            self.state = TrackingState::Initializing;
        }
    }

    fn continue_initialization(&mut self, frame: &mut Frame) {
        match self.initializer.initialize(frame, &self.shared) {
            InitOutcome::TooFewFeatures => {
                self.state = TrackingState::NotInitialized;
            }
            InitOutcome::NoGeometry => {}
            InitOutcome::Rejected => {
                self.state = TrackingState::NotInitialized;
            }
            InitOutcome::Success(initial) => {
                self.reference_kf = Some(initial.kf_cur);
                self.last_keyframe = Some(initial.kf_cur);
                self.last_kf_frame_id = frame.id;
                self.local_map.keyframes = vec![initial.kf_cur, initial.kf_ini];
                self.local_map.reference_kf = Some(initial.kf_cur);
                {
                    let map = initial.map.read();
                    self.local_map.landmarks = map.landmark_ids();
                }
                self.velocity = None;

                // The map is live: restart the builders, park the relocalizer.
                self.shared.leave_relocalization();
                let _ = self.kf_sender.send((Arc::clone(&initial.map), initial.kf_ini));
                let _ = self.kf_sender.send((Arc::clone(&initial.map), initial.kf_cur));

                self.state = TrackingState::Working;
            }
        }
    }

    // Frame tracking ----------------------------------------------------------

    fn track(&mut self, frame: &mut Frame) {
        let Some(shared_map) = self.shared.map_db.current() else {
            warn!("tracking with no current map");
            self.state = TrackingState::NotInitialized;
            return;
        };

        let ok = {
            let mut map = shared_map.write();

            let use_model = self.settings.use_motion_model
                && map.num_keyframes() >= 4
                && self.velocity.is_some()
                && frame.id >= self.last_reloc_frame_id + 2;

            let mut ok = if use_model {
                self.track_with_motion_model(frame, &mut map)
                    || self.track_previous_frame(frame, &mut map)
            } else {
                self.track_previous_frame(frame, &mut map)
            };

            if ok {
                ok = self.track_local_map(frame, &mut map);
            }

            if ok {
                if self.need_new_keyframe(frame, &map) {
                    self.create_new_keyframe(frame, &mut map, &shared_map);
                }
                // High-innovation points were kept for the keyframe; the
                // next frame must not estimate against them.
                frame.discard_outliers();
            }
            ok
        };

        if ok {
            self.state = TrackingState::Working;
        } else {
            info!("lost tracking, forcing relocalization and initialization");
            self.state = TrackingState::NotInitialized;
            self.force_relocalization(frame);
        }

        if self.state == TrackingState::NotInitialized {
            let keyframes = shared_map.read().num_keyframes();
            if keyframes <= 5 {
                info!(keyframes, "erasing map, too few keyframes");
                self.reset_current_map(&shared_map);
            }
        }

        // Motion model; velocity survives only a successful track.
        if self.settings.use_motion_model {
            self.velocity = if ok {
                match (frame.pose_cw.as_ref(), self.last_frame.as_ref().and_then(|f| f.pose_cw.as_ref())) {
                    (Some(current), Some(last)) => Some(current.compose(&last.inverse())),
                    _ => None,
                }
            } else {
                None
            };
        }
    }

    fn track_previous_frame(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let Some(last) = self.last_frame.as_ref() else {
            return false;
        };
        let matcher = Matcher::new(0.9);

        // Coarse scales first for a rough estimate when the map is mature.
        let max_octave = self.pyramid.n_levels.saturating_sub(1);
        let min_octave = if map.num_keyframes() > 5 {
            max_octave / 2 + 1
        } else {
            0
        };

        let mut nmatches = matcher.window_search(last, frame, 200.0, min_octave, map);
        if nmatches < 10 {
            frame.landmarks.iter_mut().for_each(|slot| *slot = None);
            nmatches = matcher.window_search(last, frame, 100.0, 0, map);
            if nmatches < 10 {
                frame.landmarks.iter_mut().for_each(|slot| *slot = None);
                nmatches = 0;
            }
        }

        frame.pose_cw = last.pose_cw.clone();
        if frame.pose_cw.is_none() {
            return false;
        }

        if nmatches >= 10 {
            optim::optimize_pose(frame, map);
            nmatches -= frame.discard_outliers();
            nmatches += matcher.search_by_projection_frame(frame, last, 15.0, map);
        } else {
            // Last opportunity: a wide projection search from the prior pose.
            nmatches = matcher.search_by_projection_frame(frame, last, 50.0, map);
        }

        if nmatches < 10 {
            return false;
        }

        optim::optimize_pose(frame, map);
        frame.discard_outliers();
        frame.num_matches() >= 10
    }

    fn track_with_motion_model(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let (Some(velocity), Some(last)) = (self.velocity.as_ref(), self.last_frame.as_ref())
        else {
            return false;
        };
        let Some(last_pose) = last.pose_cw.as_ref() else {
            return false;
        };

        frame.pose_cw = Some(velocity.compose(last_pose));
        frame.landmarks.iter_mut().for_each(|slot| *slot = None);

        let matcher = Matcher::new(0.9);
        let nmatches = matcher.search_by_projection_frame(frame, last, 15.0, map);
        if nmatches < 20 {
            return false;
        }

        optim::optimize_pose(frame, map);
        frame.discard_outliers();
        frame.num_matches() >= 10
    }

    fn track_local_map(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        self.local_map.update(frame, map);
        if let Some(reference) = self.local_map.reference_kf {
            self.reference_kf = Some(reference);
        }

        self.search_local_landmarks(frame, map);

        self.matches_inliers = optim::optimize_pose(frame, map);

        // Found statistics for the culling heuristics.
        for (idx, lm_id) in frame.landmarks.iter().enumerate() {
            if let Some(lm_id) = lm_id {
                if !frame.outliers[idx] {
                    if let Some(lm) = map.landmark_mut(*lm_id) {
                        lm.increase_found();
                    }
                }
            }
        }

        // Stricter right after a relocalization.
        if frame.id < self.last_reloc_frame_id + self.settings.max_frames()
            && self.matches_inliers < 50
        {
            return false;
        }
        self.matches_inliers >= 30
    }

    fn search_local_landmarks(&mut self, frame: &mut Frame, map: &mut Map) {
        // Already-matched landmarks are seen by definition.
        for (idx, slot) in frame.landmarks.iter_mut().enumerate() {
            let Some(lm_id) = *slot else { continue };
            match map.landmark_mut(lm_id) {
                Some(lm) => {
                    lm.increase_visible();
                    lm.last_frame_seen = frame.id;
                }
                None => {
                    *slot = None;
                    frame.outliers[idx] = false;
                }
            }
        }

        let mut to_match = 0usize;
        for lm_id in &self.local_map.landmarks {
            let Some(lm) = map.landmark(*lm_id) else { continue };
            if lm.last_frame_seen == frame.id {
                continue;
            }
            if frame.project_in_frustum(lm, 0.5).is_some() {
                if let Some(lm) = map.landmark_mut(*lm_id) {
                    lm.increase_visible();
                }
                to_match += 1;
            }
        }

        if to_match > 0 {
            // Coarser search right after a relocalization.
            let th = if frame.id < self.last_reloc_frame_id + 2 {
                5.0
            } else {
                1.0
            };
            let matcher = Matcher::new(0.8);
            matcher.search_by_projection_landmarks(frame, &self.local_map.landmarks, map, th);
        }
    }

    // Keyframe policy ---------------------------------------------------------

    fn need_new_keyframe(&self, frame: &Frame, map: &Map) -> bool {
        let gate = &self.shared.local_mapping_gate;
        if gate.is_stopped() || gate.stop_requested() {
            return false;
        }

        let max_frames = self.settings.max_frames();
        // Hold off soon after a relocalization unless the map is tiny.
        if frame.id < self.last_reloc_frame_id + max_frames
            && map.num_keyframes() as u64 > max_frames
        {
            return false;
        }

        let n_ref_matches = self
            .reference_kf
            .and_then(|id| map.keyframe(id))
            .map(|kf| {
                kf.landmark_indices()
                    .filter(|(_, lm)| map.landmark(*lm).is_some())
                    .count()
            })
            .unwrap_or(0);

        let idle = self.shared.local_mapping_idle();

        let c1a = frame.id >= self.last_kf_frame_id + max_frames;
        let c1b = frame.id >= self.last_kf_frame_id + self.settings.min_frames() && idle;
        let c2 = (self.matches_inliers as f64) < (n_ref_matches as f64) * 0.9
            && self.matches_inliers > 15;

        if (c1a || c1b) && c2 {
            if idle {
                true
            } else {
                self.shared.request_interrupt_ba();
                false
            }
        } else {
            false
        }
    }

    fn create_new_keyframe(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
        shared_map: &Arc<SharedMap>,
    ) {
        frame.ensure_bow(self.shared.vocabulary());
        let kf = KeyFrame::from_frame(KeyFrameId::next(), frame, map.id);
        let kf_id = map.insert_keyframe(kf);
        debug!(%kf_id, frame = frame.id, "new keyframe");

        if self
            .kf_sender
            .try_send((Arc::clone(shared_map), kf_id))
            .is_err()
        {
            warn!(%kf_id, "local mapping queue full, keyframe delayed in map");
        }
        self.last_kf_frame_id = frame.id;
        self.last_keyframe = Some(kf_id);
    }

    // Loss handling -----------------------------------------------------------

    fn force_relocalization(&mut self, frame: &Frame) {
        self.last_reloc_frame_id = frame.id;
        self.velocity = None;
        self.shared.enter_relocalization();
    }

    /// Erase the current map after an early loss; a fresh initialization
    /// will build the next one.
    fn reset_current_map(&mut self, shared_map: &Arc<SharedMap>) {
        use std::sync::atomic::Ordering;
        self.shared.local_mapping_gate.request_reset();
        self.shared.loop_closing_gate.request_reset();
        self.shared.map_merging_gate.request_reset();
        self.shared.local_mapping_gate.request_stop();
        self.shared.loop_closing_gate.request_stop();
        self.shared.map_merging_gate.request_stop();

        self.shared.map_db.erase_map(shared_map.id());
        self.shared
            .publisher_reset_requested
            .store(true, Ordering::SeqCst);

        self.initializer.clear();
        self.local_map = LocalMap::default();
        self.reference_kf = None;
        self.last_keyframe = None;
        self.velocity = None;
    }

    // Inline relocalization ---------------------------------------------------

    /// Relocalize on the tracking thread against the last keyframe's
    /// covisibility neighborhood (used during loop closing).
    fn relocalize_inline(&mut self, frame: &mut Frame) {
        let committed = relocalization::relocalize_inline(
            frame,
            &self.shared,
            self.last_keyframe,
        );
        if committed {
            info!(frame = frame.id, "successful inline relocalization");
            self.last_reloc_frame_id = frame.id;
            self.velocity = None;
            self.state = TrackingState::Working;
            self.shared.leave_relocalization();
        }
    }
}
