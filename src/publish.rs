//! Publisher seams for the observable topics.
//!
//! The real visualization transports (pose TF, annotated frame, global map)
//! live outside the core; the system talks to them through these traits.
//! `LogPublisher` is the default wiring and just traces.

use crate::geometry::SE3;
use crate::map::{Frame, MapDatabase};

/// Receives the current camera pose, frame id "World" → "Camera".
pub trait PosePublisher: Send + Sync {
    fn publish_pose(&self, pose_cw: &SE3);
}

/// Receives the processed frame with its matches and state text.
pub trait FramePublisher: Send + Sync {
    fn publish_frame(&self, frame: &Frame, state_text: &str, matches: usize);
    /// Drop any retained frame data (reset barrier).
    fn reset(&self);
}

/// Periodically walks the map database: keyframe poses, landmarks,
/// covisibility edges.
pub trait MapPublisher: Send + Sync {
    fn publish_map(&self, db: &MapDatabase);
    fn reset(&self);
}

/// Default publishers backed by structured logging.
#[derive(Default)]
pub struct LogPublisher;

impl PosePublisher for LogPublisher {
    fn publish_pose(&self, pose_cw: &SE3) {
        let c = pose_cw.camera_center();
        tracing::trace!(x = c.x, y = c.y, z = c.z, "camera pose");
    }
}

impl FramePublisher for LogPublisher {
    fn publish_frame(&self, frame: &Frame, state_text: &str, matches: usize) {
        tracing::trace!(
            frame = frame.id,
            state = state_text,
            matches,
            keypoints = frame.num_keypoints(),
            "frame"
        );
    }

    fn reset(&self) {}
}

impl MapPublisher for LogPublisher {
    fn publish_map(&self, db: &MapDatabase) {
        for map in db.live_maps() {
            let m = map.read();
            tracing::trace!(
                map = %map.id(),
                keyframes = m.num_keyframes(),
                landmarks = m.num_landmarks(),
                "map"
            );
        }
    }

    fn reset(&self) {}
}
