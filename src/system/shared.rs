//! Shared state between the five worker threads.
//!
//! One `SharedContext` is created by the system and handed to every worker
//! as a borrowed handle (`Arc`). It owns the map database, the vocabulary,
//! the per-worker gates and the cross-thread flags.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::map::{Frame, MapDatabase, SharedMap};
use crate::vocabulary::Vocabulary;

/// Handed from Relocalization back to Tracking on success.
pub struct RelocalizationSuccess {
    /// The relocalized frame, pose and landmark matches filled in.
    pub frame: Frame,
    /// The map the pose lives in; Tracking makes it current (global mode).
    pub map: Arc<SharedMap>,
}

/// Flags shared with the Relocalization worker.
#[derive(Default)]
pub struct RelocalizationShared {
    /// Tracking lost; Relocalization should consume frames.
    pub requested: AtomicBool,
    /// Inline variant: restrict the search to the last keyframe's covisibles.
    pub inline_requested: AtomicBool,
    /// Whether the worker currently accepts frames from Tracking.
    pub accepting_frames: AtomicBool,
    /// A computed pose waiting for Tracking to commit.
    pub success: Mutex<Option<RelocalizationSuccess>>,
}

pub struct SharedContext {
    pub map_db: MapDatabase,

    /// Worker gates, one per thread.
    pub local_mapping_gate: crate::system::WorkerGate,
    pub loop_closing_gate: crate::system::WorkerGate,
    pub map_merging_gate: crate::system::WorkerGate,
    pub relocalization_gate: crate::system::WorkerGate,

    /// Global exit flag checked by every worker each iteration.
    pub shutdown: AtomicBool,

    /// Tracking → LocalMapping: abort the in-flight local BA.
    pub interrupt_ba: AtomicBool,
    /// LocalMapping is idle (its queue is empty and no step is running).
    pub local_mapping_idle: AtomicBool,

    pub relocalization: RelocalizationShared,

    /// Publisher reset barrier: Tracking raises the request when it erases a
    /// map; the publisher loop acknowledges at 200 Hz until it is cleared.
    pub publisher_reset_requested: AtomicBool,
    pub publisher_stopped: AtomicBool,

    /// Frames since startup, for diagnostics.
    pub frames_processed: AtomicU64,
}

impl SharedContext {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Arc<Self> {
        Arc::new(Self {
            map_db: MapDatabase::new(vocabulary),
            local_mapping_gate: crate::system::WorkerGate::new(),
            loop_closing_gate: crate::system::WorkerGate::new(),
            map_merging_gate: crate::system::WorkerGate::new(),
            relocalization_gate: crate::system::WorkerGate::new(),
            shutdown: AtomicBool::new(false),
            interrupt_ba: AtomicBool::new(false),
            local_mapping_idle: AtomicBool::new(true),
            relocalization: RelocalizationShared::default(),
            publisher_reset_requested: AtomicBool::new(false),
            publisher_stopped: AtomicBool::new(false),
            frames_processed: AtomicU64::new(0),
        })
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        self.map_db.vocabulary()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock anything parked on a gate.
        self.local_mapping_gate.release();
        self.loop_closing_gate.release();
        self.map_merging_gate.release();
        self.relocalization_gate.release();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_interrupt_ba(&self) {
        self.interrupt_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupt_ba(&self) {
        self.interrupt_ba.store(false, Ordering::SeqCst);
    }

    pub fn ba_interrupted(&self) -> bool {
        self.interrupt_ba.load(Ordering::SeqCst)
    }

    pub fn set_local_mapping_idle(&self, idle: bool) {
        self.local_mapping_idle.store(idle, Ordering::SeqCst);
    }

    pub fn local_mapping_idle(&self) -> bool {
        self.local_mapping_idle.load(Ordering::SeqCst)
    }

    /// Stop the map-building workers and start the relocalizer; called by
    /// Tracking when it loses the camera.
    pub fn enter_relocalization(&self) {
        self.local_mapping_gate.request_stop();
        self.loop_closing_gate.request_stop();
        self.map_merging_gate.request_stop();
        self.relocalization.requested.store(true, Ordering::SeqCst);
        self.relocalization
            .accepting_frames
            .store(true, Ordering::SeqCst);
        self.relocalization_gate.release();
    }

    /// Reset and restart the map-building workers after a successful
    /// relocalization or a fresh initialization, then park the relocalizer.
    pub fn leave_relocalization(&self) {
        self.relocalization.requested.store(false, Ordering::SeqCst);
        self.relocalization
            .inline_requested
            .store(false, Ordering::SeqCst);
        self.relocalization
            .accepting_frames
            .store(false, Ordering::SeqCst);
        self.local_mapping_gate.request_reset();
        self.loop_closing_gate.request_reset();
        self.map_merging_gate.request_reset();
        self.local_mapping_gate.release();
        self.loop_closing_gate.release();
        self.map_merging_gate.release();
        self.relocalization_gate.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, DESCRIPTOR_BYTES};

    fn context() -> Arc<SharedContext> {
        let vocab = Vocabulary::from_words(vec![
            Descriptor([0u8; DESCRIPTOR_BYTES]),
            Descriptor([0xff; DESCRIPTOR_BYTES]),
        ]);
        SharedContext::new(Arc::new(vocab))
    }

    #[test]
    fn test_relocalization_round_trip() {
        let ctx = context();
        ctx.enter_relocalization();
        assert!(ctx.relocalization.requested.load(Ordering::SeqCst));
        assert!(ctx.local_mapping_gate.stop_requested());

        ctx.leave_relocalization();
        assert!(!ctx.relocalization.requested.load(Ordering::SeqCst));
        assert!(!ctx.local_mapping_gate.stop_requested());
        assert!(ctx.local_mapping_gate.take_reset_request());
        assert!(ctx.relocalization_gate.stop_requested());
    }

    #[test]
    fn test_shutdown_releases_gates() {
        let ctx = context();
        ctx.local_mapping_gate.request_stop();
        ctx.request_shutdown();
        assert!(ctx.is_shutdown());
        assert!(!ctx.local_mapping_gate.stop_requested());
    }
}
