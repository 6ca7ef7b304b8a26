//! Local Mapping worker.
//!
//! Consumes keyframes inserted by Tracking in FIFO order. For each one:
//! retrieval bookkeeping and covisibility update, recent-landmark culling,
//! triangulation of new landmarks against covisible keyframes, duplicate
//! fusion, an interruptible local bundle adjustment when the queue is
//! drained, and keyframe culling. Stop/Release parks the thread during loop
//! closure; Reset drains everything.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::map::{KeyFrameId, LandmarkId, SharedMap};
use crate::matching::Matcher;
use crate::optim;
use crate::system::SharedContext;
use crate::tracking::NewKeyFrame;

use super::triangulate::triangulate_new_landmarks;

/// Landmarks with a found ratio below this are culled.
const MIN_FOUND_RATIO: f64 = 0.25;
/// Observers a recent landmark must gather to survive.
const MIN_OBSERVATIONS: usize = 3;
/// Keyframes a landmark stays on probation after creation.
const PROBATION_KEYFRAMES: u64 = 3;
/// A keyframe whose landmarks are this redundantly observed is culled.
const REDUNDANCY_RATIO: f64 = 0.9;
/// Covisible keyframes searched during duplicate fusion.
const FUSE_NEIGHBORS: usize = 20;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

pub struct LocalMapper {
    shared: Arc<SharedContext>,
    kf_receiver: Receiver<NewKeyFrame>,
    loop_sender: Sender<NewKeyFrame>,
    merge_sender: Sender<NewKeyFrame>,

    /// Recently created landmarks on probation: (landmark, keyframe
    /// sequence number at creation).
    recent: Vec<(LandmarkId, u64)>,
    /// Keyframes processed since startup or the last reset.
    kf_sequence: u64,
}

impl LocalMapper {
    pub fn new(
        shared: Arc<SharedContext>,
        kf_receiver: Receiver<NewKeyFrame>,
        loop_sender: Sender<NewKeyFrame>,
        merge_sender: Sender<NewKeyFrame>,
    ) -> Self {
        Self {
            shared,
            kf_receiver,
            loop_sender,
            merge_sender,
            recent: Vec::new(),
            kf_sequence: 0,
        }
    }

    pub fn run(&mut self) {
        info!("local mapping thread started");
        loop {
            if self.shared.is_shutdown() {
                break;
            }
            self.shared
                .local_mapping_gate
                .check_in(&self.shared.shutdown);
            if self.shared.local_mapping_gate.take_reset_request() {
                while self.kf_receiver.try_recv().is_ok() {}
                self.recent.clear();
                self.kf_sequence = 0;
                continue;
            }

            match self.kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok((shared_map, kf_id)) => {
                    self.shared.set_local_mapping_idle(false);
                    self.process_keyframe(&shared_map, kf_id);
                    if self.kf_receiver.is_empty() {
                        self.shared.set_local_mapping_idle(true);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.shared.set_local_mapping_idle(true);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("local mapping thread exiting");
    }

    fn process_keyframe(&mut self, shared_map: &Arc<SharedMap>, kf_id: KeyFrameId) {
        if shared_map.is_erased() {
            return;
        }
        self.shared.clear_interrupt_ba();
        self.kf_sequence += 1;

        self.integrate_keyframe(shared_map, kf_id);
        self.cull_recent_landmarks(shared_map);
        let created = {
            let mut map = shared_map.write();
            triangulate_new_landmarks(&mut map, kf_id)
        };
        let seq = self.kf_sequence;
        self.recent.extend(created.into_iter().map(|lm| (lm, seq)));

        self.fuse_duplicates(shared_map, kf_id);

        if self.kf_receiver.is_empty() {
            self.local_bundle_adjustment(shared_map, kf_id);
            self.cull_keyframes(shared_map, kf_id);
        }

        let _ = self.loop_sender.try_send((Arc::clone(shared_map), kf_id));
        let _ = self.merge_sender.try_send((Arc::clone(shared_map), kf_id));
    }

    /// Retrieval entry, landmark observations and covisibility for the new
    /// keyframe; its tracked landmarks enter the probation list.
    fn integrate_keyframe(&mut self, shared_map: &Arc<SharedMap>, kf_id: KeyFrameId) {
        let mut map = shared_map.write();
        let Some(kf) = map.keyframe(kf_id) else {
            return;
        };
        let bow = kf.bow.clone();
        let observations: Vec<(usize, LandmarkId)> = kf.landmark_indices().collect();

        for (idx, lm_id) in &observations {
            let newly_observed = map
                .landmark(*lm_id)
                .map(|lm| !lm.observations.contains_key(&kf_id))
                .unwrap_or(false);
            if newly_observed {
                map.associate(kf_id, *idx, *lm_id);
                map.refresh_landmark(*lm_id);
            }
        }

        map.update_connections(kf_id);
        if let Some(bow) = bow {
            map.keyframe_db.add(kf_id, bow);
        }
    }

    /// Probation test for recently created landmarks.
    fn cull_recent_landmarks(&mut self, shared_map: &Arc<SharedMap>) {
        let mut map = shared_map.write();
        let seq = self.kf_sequence;
        let mut culled = 0usize;

        self.recent.retain(|&(lm_id, created_at)| {
            let stats = map
                .landmark(lm_id)
                .map(|lm| (lm.found_ratio(), lm.num_observations()));
            let Some((found_ratio, n_obs)) = stats else {
                return false; // already bad
            };
            let age = seq.saturating_sub(created_at);
            if found_ratio < MIN_FOUND_RATIO || (age >= 2 && n_obs < MIN_OBSERVATIONS) {
                map.set_landmark_bad(lm_id);
                culled += 1;
                return false;
            }
            // Probation over, the landmark survives.
            age < PROBATION_KEYFRAMES
        });

        if culled > 0 {
            debug!(culled, remaining = map.num_landmarks(), "landmark culling");
        }
    }

    /// Project the keyframe's landmarks into its covisibles and back,
    /// replacing duplicates.
    fn fuse_duplicates(&self, shared_map: &Arc<SharedMap>, kf_id: KeyFrameId) {
        let matcher = Matcher::new(0.8);
        let mut map = shared_map.write();

        let Some(kf) = map.keyframe(kf_id) else {
            return;
        };
        let neighbors = kf.best_covisibles_readonly(FUSE_NEIGHBORS);
        let own_landmarks: Vec<LandmarkId> = kf.landmark_indices().map(|(_, lm)| lm).collect();

        let mut fused = 0usize;
        // Forward: this keyframe's landmarks into the neighbors.
        for &neighbor_id in &neighbors {
            let Some(neighbor) = map.keyframe(neighbor_id) else {
                continue;
            };
            let pose = neighbor.pose_cw.clone();
            fused += matcher.fuse(&mut map, neighbor_id, &pose, &own_landmarks, 3.0, false);
        }
        // Backward: the neighbors' landmarks into this keyframe.
        let mut neighbor_landmarks: Vec<LandmarkId> = Vec::new();
        {
            let mut seen = std::collections::HashSet::new();
            for &neighbor_id in &neighbors {
                if let Some(neighbor) = map.keyframe(neighbor_id) {
                    for (_, lm) in neighbor.landmark_indices() {
                        if seen.insert(lm) {
                            neighbor_landmarks.push(lm);
                        }
                    }
                }
            }
        }
        if let Some(kf) = map.keyframe(kf_id) {
            let pose = kf.pose_cw.clone();
            fused += matcher.fuse(&mut map, kf_id, &pose, &neighbor_landmarks, 3.0, false);
        }

        if fused > 0 {
            debug!(%kf_id, fused, "duplicate landmarks fused");
            map.update_connections(kf_id);
        }
    }

    /// Three-phase local BA honoring the tracking interrupt.
    fn local_bundle_adjustment(&self, shared_map: &Arc<SharedMap>, kf_id: KeyFrameId) {
        let problem = {
            let map = shared_map.read();
            optim::collect_local_ba(&map, kf_id)
        };
        let Some(problem) = problem else { return };

        let shared = Arc::clone(&self.shared);
        let receiver = self.kf_receiver.clone();
        let interrupt = move || shared.ba_interrupted() || !receiver.is_empty();

        let Some(result) = optim::solve_ba(&problem, 10, &interrupt) else {
            return;
        };
        if result.iterations == 0 {
            return;
        }

        let mut map = shared_map.write();
        let updated = optim::apply_ba_results(&mut map, &result);
        debug!(
            %kf_id,
            iterations = result.iterations,
            initial = result.initial_error,
            refined = result.final_error,
            updated,
            "local bundle adjustment"
        );
    }

    /// Cull covisible keyframes whose landmarks are redundantly observed at
    /// the same or a finer scale by at least three other keyframes.
    fn cull_keyframes(&self, shared_map: &Arc<SharedMap>, kf_id: KeyFrameId) {
        let mut map = shared_map.write();
        let Some(kf) = map.keyframe(kf_id) else {
            return;
        };
        let candidates = kf.best_covisibles_readonly(usize::MAX);

        let mut to_cull = Vec::new();
        for candidate_id in candidates {
            if candidate_id == kf_id {
                continue;
            }
            let Some(candidate) = map.keyframe(candidate_id) else {
                continue;
            };
            if Some(candidate_id) == map.origin_keyframe() {
                continue;
            }

            let mut total = 0usize;
            let mut redundant = 0usize;
            for (idx, lm_id) in candidate.landmark_indices() {
                let Some(lm) = map.landmark(lm_id) else {
                    continue;
                };
                total += 1;
                let own_octave = candidate.keypoints[idx].octave;
                let observers_at_scale = lm
                    .observations
                    .iter()
                    .filter(|(&obs_kf, &obs_idx)| {
                        if obs_kf == candidate_id {
                            return false;
                        }
                        map.keyframe(obs_kf)
                            .and_then(|okf| okf.keypoints.get(obs_idx))
                            .map(|kp| kp.octave <= own_octave)
                            .unwrap_or(false)
                    })
                    .count();
                if observers_at_scale >= MIN_OBSERVATIONS {
                    redundant += 1;
                }
            }

            if total > 0 && (redundant as f64) >= REDUNDANCY_RATIO * (total as f64) {
                to_cull.push(candidate_id);
            }
        }

        for id in &to_cull {
            map.set_keyframe_bad(*id);
        }
        if !to_cull.is_empty() {
            info!(
                culled = to_cull.len(),
                remaining = map.num_keyframes(),
                "keyframe culling"
            );
        }
    }
}
