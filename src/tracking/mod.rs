//! Per-frame tracking: the state machine, the local-map window and the
//! two-view initializer.

pub mod initializer;
pub mod local_map;
pub mod state;
pub mod tracker;

pub use state::TrackingState;
pub use tracker::{NewKeyFrame, Tracker};
