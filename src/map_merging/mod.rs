//! Map merging: cross-map overlap detection and fusion.

pub mod merger;

pub use merger::MapMerger;
