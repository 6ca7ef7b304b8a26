//! Relocalization worker and the inline variant used during loop closing.

pub mod relocalizer;

pub use relocalizer::{relocalize_inline, Relocalizer};
