//! System plumbing: worker gates, shared context, thread orchestration.

pub mod gate;
pub mod shared;
pub mod slam;

pub use gate::WorkerGate;
pub use shared::SharedContext;
pub use slam::{SlamSystem, TrackerInput};
