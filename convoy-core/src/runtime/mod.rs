//! Container runtime abstraction.
//!
//! The engine only talks to containers, networks, volumes and images through
//! the `ContainerRuntime` trait. `DockerCli` binds it to a `docker`-compatible
//! command-line client.

use crate::error::Result;
use crate::manifest::{Healthcheck, PortMapping};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

pub mod docker;

pub use docker::DockerCli;

/// Container runtime trait.
///
/// Implementations are shared across concurrent workers. Methods are
/// instrumented by implementations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name (for logging).
    fn name(&self) -> &str;

    /// Create a container without starting it.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Start a created container.
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Stop a container, giving it `grace` to exit before the runtime kills it.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<()>;

    /// Force kill a container immediately.
    async fn kill(&self, id: &ContainerId) -> Result<()>;

    /// Remove a container, optionally with its anonymous volumes.
    async fn remove(&self, id: &ContainerId, remove_anonymous_volumes: bool) -> Result<()>;

    /// Create a network.
    async fn create_network(&self, config: &NetworkConfig) -> Result<NetworkHandle>;

    /// Create a named volume.
    async fn create_volume(&self, config: &VolumeConfig) -> Result<VolumeHandle>;

    /// Follow the container's output until it exits or the stream is dropped.
    async fn stream_logs(&self, id: &ContainerId) -> Result<LogStream>;

    /// Look up a network by name. `None` when it does not exist.
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkHandle>>;

    /// Look up a volume by name. `None` when it does not exist.
    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeHandle>>;

    /// Current status of a container.
    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo>;

    /// Look up a container by name. `None` when it does not exist.
    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>>;

    /// Remove a network. Removing a missing network succeeds.
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Remove a volume. Removing a missing volume succeeds.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Whether an image is present locally.
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Pull an image from its registry.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Build an image from a local context.
    async fn build_image(&self, request: &BuildRequest) -> Result<()>;
}

/// Runtime identifier of a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,

    /// Image tag to run
    pub image: String,

    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,

    /// Environment variables
    pub env: BTreeMap<String, String>,

    /// Volume and bind mounts
    pub mounts: Vec<Mount>,

    /// Networks to join; the first one is used at creation time
    pub networks: Vec<NetworkEndpoint>,

    /// Published ports
    pub ports: Vec<PortMapping>,

    /// Allocate a pseudo-TTY
    pub tty: bool,

    /// Keep stdin open
    pub stdin_open: bool,

    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub restart: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub healthcheck: Option<Healthcheck>,
}

/// A mount inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub source: MountSource,

    /// Mount path inside the container
    pub target: String,

    pub read_only: bool,
}

/// Backing of a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "source", rename_all = "lowercase")]
pub enum MountSource {
    /// Named volume, by runtime name
    Volume(String),
    /// Absolute host path
    Bind(PathBuf),
    /// Anonymous volume owned by the container
    Anonymous,
}

/// Network membership of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkEndpoint {
    /// Runtime network name
    pub network: String,

    /// DNS aliases (always includes the service name)
    pub aliases: Vec<String>,
}

/// Network creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: String,
    pub driver: String,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
}

/// Volume creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// An existing network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub id: String,
    pub name: String,
    pub driver: String,
}

/// An existing volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub name: String,
    pub driver: String,
}

/// Image build parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build context directory
    pub context: PathBuf,

    /// Dockerfile relative to the context
    pub dockerfile: Option<String>,

    pub args: BTreeMap<String, String>,

    /// Multi-stage target
    pub target: Option<String>,

    /// Tag for the resulting image
    pub tag: String,
}

/// Container status reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub status: ContainerStatus,

    /// Health check status, `None` when the container has no health check
    pub health: Option<HealthStatus>,

    /// Exit code once the container has exited
    pub exit_code: Option<i64>,
}

/// Coarse container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parse the runtime's status string.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starting" => Some(HealthStatus::Starting),
            "healthy" => Some(HealthStatus::Healthy),
            "unhealthy" => Some(HealthStatus::Unhealthy),
            _ => None,
        }
    }
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: LogSource,
    pub line: String,
}

/// Stream of container output lines.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogLine>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_parse() {
        assert_eq!(ContainerStatus::parse("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("Exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::parse("removing"), ContainerStatus::Unknown);
    }

    #[test]
    fn test_health_status_parse() {
        assert_eq!(HealthStatus::parse("healthy"), Some(HealthStatus::Healthy));
        assert_eq!(HealthStatus::parse(""), None);
    }
}
