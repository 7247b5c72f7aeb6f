//! Service lifecycle: states, run state and the per-service controller.

mod controller;
mod state;

pub use controller::{ControllerSettings, LifecycleController};
pub use state::{RunState, ServiceRecord, ServiceState, StopOutcome};
