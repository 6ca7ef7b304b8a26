//! Loop closing worker.
//!
//! Per keyframe committed by LocalMapping: detect revisit candidates,
//! require temporal consistency, verify with a Sim(3) fit over matched
//! landmarks. Then, with LocalMapping stopped, propagate the corrected
//! poses through the covisibility window, fuse duplicate landmarks across
//! the loop, and run the essential-graph optimization. A global bundle
//! adjustment can follow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::geometry::Sim3;
use crate::map::{KeyFrameId, LandmarkId, Map, SharedMap};
use crate::matching::Matcher;
use crate::optim::{self, PoseGraphConfig};
use crate::system::SharedContext;
use crate::tracking::NewKeyFrame;

use super::detector::{detect_candidates, ConsistencyChecker};
use super::sim3_solver::{compute_sim3_ransac, Sim3SolverConfig};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Search radius for cross-loop landmark fusion.
const FUSE_RADIUS: f64 = 4.0;

pub struct LoopCloserConfig {
    pub sim3: Sim3SolverConfig,
    pub pose_graph: PoseGraphConfig,
    /// Run a global bundle adjustment after the pose-graph correction.
    pub run_global_ba: bool,
}

impl Default for LoopCloserConfig {
    fn default() -> Self {
        Self {
            sim3: Sim3SolverConfig::default(),
            pose_graph: PoseGraphConfig::default(),
            run_global_ba: true,
        }
    }
}

pub struct LoopCloser {
    shared: Arc<SharedContext>,
    receiver: Receiver<NewKeyFrame>,
    checker: ConsistencyChecker,
    config: LoopCloserConfig,
}

impl LoopCloser {
    pub fn new(
        shared: Arc<SharedContext>,
        receiver: Receiver<NewKeyFrame>,
        config: LoopCloserConfig,
    ) -> Self {
        Self {
            shared,
            receiver,
            checker: ConsistencyChecker::new(),
            config,
        }
    }

    pub fn run(&mut self) {
        info!("loop closing thread started");
        loop {
            if self.shared.is_shutdown() {
                break;
            }
            self.shared
                .loop_closing_gate
                .check_in(&self.shared.shutdown);
            if self.shared.loop_closing_gate.take_reset_request() {
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
        info!("loop closing thread exiting");
    }

    fn process_keyframe(&mut self, shared_map: &Arc<SharedMap>, kf_id: KeyFrameId) {
        if shared_map.is_erased() {
            return;
        }

        let consistent = {
            let map = shared_map.read();
            let raw = detect_candidates(&map, kf_id);
            self.checker.check(&map, &raw)
        };

        for candidate in consistent {
            if self.try_close(shared_map, kf_id, candidate) {
                break;
            }
        }
    }

    fn try_close(
        &mut self,
        shared_map: &Arc<SharedMap>,
        kf_id: KeyFrameId,
        loop_kf: KeyFrameId,
    ) -> bool {
        // Verify the candidate with a similarity fit over matched landmarks,
        // expressed in each keyframe's camera frame.
        let sim3_cur_from_loop = {
            let map = shared_map.read();
            let Some(sim3) = compute_loop_sim3(&map, kf_id, loop_kf, &self.config.sim3) else {
                debug!(%kf_id, %loop_kf, "loop candidate failed similarity verification");
                return false;
            };
            sim3
        };

        info!(%kf_id, %loop_kf, scale = sim3_cur_from_loop.scale, "loop detected");

        // Structure mutation ahead: park LocalMapping first.
        self.shared.local_mapping_gate.request_stop();
        self.wait_for_local_mapping();

        {
            let mut map = shared_map.write();
            correct_and_fuse(
                &mut map,
                kf_id,
                loop_kf,
                &sim3_cur_from_loop,
                &self.config.pose_graph,
            );

            if self.config.run_global_ba {
                if let Some(problem) = optim::collect_global_ba(&map) {
                    let shared = Arc::clone(&self.shared);
                    let interrupt = move || shared.is_shutdown();
                    if let Some(result) = optim::solve_ba(&problem, 20, &interrupt) {
                        optim::apply_ba_results(&mut map, &result);
                        debug!(
                            initial = result.initial_error,
                            refined = result.final_error,
                            "global bundle adjustment after loop"
                        );
                    }
                }
            }
        }

        self.shared.local_mapping_gate.release();
        info!(%kf_id, %loop_kf, "loop closed");
        true
    }

    fn wait_for_local_mapping(&self) {
        let start = Instant::now();
        while !self.shared.local_mapping_gate.is_stopped() {
            if self.shared.is_shutdown() || start.elapsed() > Duration::from_secs(5) {
                warn!("proceeding without local mapping pause acknowledgment");
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Match landmarks between the two loop ends and fit `Sim(3)` mapping the
/// loop keyframe's camera frame onto the current keyframe's camera frame.
pub fn compute_loop_sim3(
    map: &Map,
    kf_id: KeyFrameId,
    loop_kf: KeyFrameId,
    config: &Sim3SolverConfig,
) -> Option<Sim3> {
    let current = map.keyframe(kf_id)?;
    let loop_end = map.keyframe(loop_kf)?;

    let matcher = Matcher::new(0.75);
    let pairs = matcher.search_by_bow_keyframes(current, loop_end, map);

    let mut pts_loop: Vec<Vector3<f64>> = Vec::with_capacity(pairs.len());
    let mut pts_cur: Vec<Vector3<f64>> = Vec::with_capacity(pairs.len());
    for (i1, i2) in pairs {
        let lm_cur = current.landmark_at(i1).and_then(|id| map.landmark(id));
        let lm_loop = loop_end.landmark_at(i2).and_then(|id| map.landmark(id));
        let (Some(lm_cur), Some(lm_loop)) = (lm_cur, lm_loop) else {
            continue;
        };
        pts_cur.push(current.pose_cw.transform_point(&lm_cur.position));
        pts_loop.push(loop_end.pose_cw.transform_point(&lm_loop.position));
    }

    let result = compute_sim3_ransac(&pts_loop, &pts_cur, config)?;
    Some(result.sim3)
}

/// Propagate the loop correction through the current keyframe's window,
/// fuse landmarks across the loop, and optimize the essential graph.
fn correct_and_fuse(
    map: &mut Map,
    kf_id: KeyFrameId,
    loop_kf: KeyFrameId,
    sim3_cur_from_loop: &Sim3,
    pose_graph: &PoseGraphConfig,
) {
    let Some(current) = map.keyframe(kf_id) else {
        return;
    };

    // Corrected world→camera similarity of the current keyframe.
    let s_loop_w = Sim3::from_se3(&map.keyframe(loop_kf).map(|k| k.pose_cw.clone()).unwrap_or_else(
        || current.pose_cw.clone(),
    ));
    let s_cur_w_old = Sim3::from_se3(&current.pose_cw);
    let s_cur_w_corrected = sim3_cur_from_loop.compose(&s_loop_w);

    // Propagate through the covisibility window: S_iw' = S_ic · S_cw'.
    let mut corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
    corrected.insert(kf_id, s_cur_w_corrected.clone());
    let window: Vec<KeyFrameId> = current.covisibility_weights().keys().copied().collect();
    for other in &window {
        if let Some(other_kf) = map.keyframe(*other) {
            let s_ic = Sim3::from_se3(&other_kf.pose_cw).compose(&s_cur_w_old.inverse());
            corrected.insert(*other, s_ic.compose(&s_cur_w_corrected));
        }
    }

    // Landmarks visible from the loop side.
    let mut loop_landmarks: Vec<LandmarkId> = Vec::new();
    {
        let mut seen = std::collections::HashSet::new();
        let mut loop_side: Vec<KeyFrameId> = vec![loop_kf];
        if let Some(loop_end) = map.keyframe(loop_kf) {
            loop_side.extend(loop_end.covisibility_weights().keys().copied());
        }
        for id in loop_side {
            if let Some(kf) = map.keyframe(id) {
                for (_, lm) in kf.landmark_indices() {
                    if seen.insert(lm) {
                        loop_landmarks.push(lm);
                    }
                }
            }
        }
    }

    // Covisibility before fusion, to find the connections the loop creates.
    let window_neighbors_before: HashMap<KeyFrameId, std::collections::HashSet<KeyFrameId>> =
        corrected
            .keys()
            .filter_map(|id| {
                map.keyframe(*id).map(|kf| {
                    (*id, kf.covisibility_weights().keys().copied().collect())
                })
            })
            .collect();

    // Fuse loop landmarks into the corrected window; duplicates resolve to
    // the loop side.
    let matcher = Matcher::new(0.8);
    for (window_kf, sim) in &corrected {
        let pose = sim.to_se3();
        matcher.fuse(map, *window_kf, &pose, &loop_landmarks, FUSE_RADIUS, true);
    }
    for (window_kf, _) in &window_neighbors_before {
        map.update_connections(*window_kf);
    }

    // New edges created by the fusion.
    let mut extra_edges: Vec<(KeyFrameId, KeyFrameId)> = vec![(loop_kf, kf_id)];
    for (window_kf, before) in &window_neighbors_before {
        if let Some(kf) = map.keyframe(*window_kf) {
            for other in kf.covisibility_weights().keys() {
                if !before.contains(other) && !corrected.contains_key(other) {
                    extra_edges.push((*other, *window_kf));
                }
            }
        }
    }

    // Explicit loop edges survive for future essential graphs.
    if let Some(kf) = map.keyframe_mut(kf_id) {
        kf.add_loop_edge(loop_kf);
    }
    if let Some(kf) = map.keyframe_mut(loop_kf) {
        kf.add_loop_edge(kf_id);
    }

    optim::optimize_essential_graph(map, loop_kf, &corrected, &extra_edges, pose_graph);
}
