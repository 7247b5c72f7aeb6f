//! convoy core library
//!
//! Manifest model, dependency resolution, resource provisioning and service
//! lifecycle for the convoy multi-container orchestration engine.

pub mod compose;
pub mod config;
pub mod error;
pub mod images;
pub mod lifecycle;
pub mod manifest;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod provisioner;
pub mod resolver;
pub mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used items
pub use config::EngineConfig;
pub use error::{ConvoyError, ParseError, ParseErrorKind, Result, ServiceFailure};
pub use lifecycle::{ServiceState, StopOutcome};
pub use manifest::Manifest;
pub use orchestrator::{
    cancel_on_interrupt, CancelHandle, DownReport, DriverSettings, Orchestrator, ServiceStatus,
    StopReport, UpOptions, UpReport,
};
pub use resolver::StartupPlan;
pub use runtime::{ContainerRuntime, DockerCli};
