//! WorkerGate - the stop/release/reset control each worker thread owns.
//!
//! `request_stop` is non-blocking; the worker parks itself at its next
//! loop-top `check_in` and stays blocked on the condition variable until
//! `release`. A stop followed by a release leaves the worker exactly as if
//! it had never stopped: queues and local state are untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    stop_requested: bool,
    stopped: bool,
}

pub struct WorkerGate {
    state: Mutex<GateState>,
    released: Condvar,
    reset_requested: AtomicBool,
}

impl Default for WorkerGate {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            released: Condvar::new(),
            reset_requested: AtomicBool::new(false),
        }
    }

    /// Ask the worker to pause at its next check-in. Non-blocking.
    pub fn request_stop(&self) {
        self.state.lock().stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.state.lock().stop_requested
    }

    /// Whether the worker is currently parked.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Clear the stop request and wake the worker.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.stop_requested = false;
        state.stopped = false;
        self.released.notify_all();
    }

    /// Ask the worker to drain its queue and clear local state at the next
    /// opportunity.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reset request.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    /// Worker loop-top: block while a stop is requested. Re-checks the
    /// shutdown flag periodically so shutdown always wins over a stop.
    pub fn check_in(&self, shutdown: &AtomicBool) {
        let mut state = self.state.lock();
        while state.stop_requested && !shutdown.load(Ordering::SeqCst) {
            state.stopped = true;
            let _ = self
                .released
                .wait_for(&mut state, Duration::from_millis(50));
        }
        state.stopped = false;
    }
}
