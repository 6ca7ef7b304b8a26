//! Nonlinear optimization: pose-only, bundle adjustment, essential graph.

pub mod bundle;
pub mod pose_graph;
pub mod pose_optimizer;

pub use bundle::{
    apply_ba_results, collect_global_ba, collect_local_ba, solve_ba, BaProblem, BaResult,
};
pub use pose_graph::{optimize_essential_graph, PoseGraphConfig};
pub use pose_optimizer::{optimize_pose, CHI2_MONO};
