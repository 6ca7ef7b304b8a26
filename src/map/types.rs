//! Stable id types for the map structures.
//!
//! Ids are lightweight handles used for every cross-reference
//! (landmark ↔ keyframe, covisibility, spanning tree) so the arenas stay free
//! of `Arc` cycles. Allocation is process-wide: a keyframe keeps its id when
//! its map is absorbed during a merge.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEYFRAME_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_LANDMARK_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier of a KeyFrame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// Allocate the next process-wide id.
    pub fn next() -> Self {
        Self(NEXT_KEYFRAME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier of a Landmark (map point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn next() -> Self {
        Self(NEXT_LANDMARK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

/// Unique identifier of a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u64);

impl MapId {
    pub fn next() -> Self {
        Self(NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for MapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Map{}", self.0)
    }
}
