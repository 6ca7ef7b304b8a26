//! The shared map data model: frames, keyframes, landmarks, maps and the
//! process-wide map database.

pub mod database;
pub mod frame;
pub mod keyframe;
pub mod keyframe_db;
pub mod landmark;
#[allow(clippy::module_inception)]
pub mod map;
pub mod types;

pub use database::{MapDatabase, SharedMap};
pub use frame::Frame;
pub use keyframe::KeyFrame;
pub use keyframe_db::KeyFrameDatabase;
pub use landmark::Landmark;
pub use map::Map;
pub use types::{KeyFrameId, LandmarkId, MapId};
