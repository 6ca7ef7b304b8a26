//! Dataset replay input and trajectory output.

pub mod replay;
pub mod trajectory;

pub use replay::ReplayDataset;
pub use trajectory::save_trajectories;
