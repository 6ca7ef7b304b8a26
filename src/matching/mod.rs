//! Descriptor matching: window, projection, BoW and fusion searches.

pub mod matcher;

pub use matcher::{Matcher, TH_HIGH, TH_LOW};
