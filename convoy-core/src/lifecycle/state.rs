//! Service lifecycle states and the run-state table.

use crate::error::{ConvoyError, Result};
use crate::manifest::ServiceId;
use crate::resolver::StartupPlan;
use crate::runtime::{ContainerId, ContainerInfo, ContainerStatus, HealthStatus};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not created yet
    Pending,
    /// Container exists, not started
    Created,
    /// Start requested
    Starting,
    /// Process is running (default readiness signal)
    Running,
    /// Health check passed
    Healthy,
    /// Creation, start or health check failed, or the process crashed
    Failed,
    /// Stop requested
    Stopping,
    /// Process exited after a stop
    Stopped,
    /// Container removed
    Removed,
}

impl ServiceState {
    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        use ServiceState::*;

        matches!(
            (self, to),
            (Pending, Created | Failed | Removed)
                | (Created, Starting | Stopping | Failed | Removed)
                | (Starting, Running | Failed)
                | (Running, Healthy | Failed | Stopping)
                | (Healthy, Failed | Stopping)
                | (Failed, Starting | Stopping | Removed)
                | (Stopping, Stopped | Failed)
                | (Stopped, Starting | Removed)
        )
    }

    /// Readiness reached for dependents using the default condition.
    pub fn is_up(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Healthy)
    }

    /// A container may be running and needs a stop before removal.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServiceState::Created
                | ServiceState::Starting
                | ServiceState::Running
                | ServiceState::Healthy
                | ServiceState::Failed
        )
    }

    /// State implied by what the runtime reports for an existing container.
    pub fn from_runtime(info: &ContainerInfo) -> Self {
        match info.status {
            ContainerStatus::Created => ServiceState::Created,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting => {
                match info.health {
                    Some(HealthStatus::Healthy) => ServiceState::Healthy,
                    Some(HealthStatus::Unhealthy) => ServiceState::Failed,
                    _ => ServiceState::Running,
                }
            }
            ContainerStatus::Exited if info.exit_code.unwrap_or(0) != 0 => ServiceState::Failed,
            ContainerStatus::Exited | ContainerStatus::Dead | ContainerStatus::Unknown => {
                ServiceState::Stopped
            }
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Pending => "pending",
            ServiceState::Created => "created",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Healthy => "healthy",
            ServiceState::Failed => "failed",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Exited within the grace period
    Graceful,
    /// The runtime did not acknowledge in time; the container was killed
    TimedOut,
    /// The stop call failed; the container was killed
    Killed,
    /// Nothing to stop
    NotRunning,
}

/// Mutable record of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub state: ServiceState,
    pub container: Option<ContainerId>,
    /// Cause of the last failure
    pub last_error: Option<String>,
    pub stop_outcome: Option<StopOutcome>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self { state: ServiceState::Pending, container: None, last_error: None, stop_outcome: None }
    }
}

impl ServiceRecord {
    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: ServiceState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(ConvoyError::Internal(format!(
                "illegal lifecycle transition {} -> {}",
                self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Record a failure with its cause.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(ServiceState::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Forget a service whose container is gone, so it can be created again.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Register a container found on the runtime, with the state it reports.
    pub fn adopt(&mut self, info: &ContainerInfo) {
        self.container = Some(info.id.clone());
        self.state = ServiceState::from_runtime(info);
        if self.state == ServiceState::Failed {
            self.last_error = info.exit_code.map(|code| format!("exited with code {}", code));
        }
    }
}

/// Run state of a project: one exclusively locked record per service.
///
/// Owned by the driver and shared with workers behind an `Arc`.
#[derive(Debug)]
pub struct RunState {
    records: Vec<Arc<Mutex<ServiceRecord>>>,
    last_startup: RwLock<Option<StartupPlan>>,
}

impl RunState {
    /// Fresh state with every service `pending`.
    pub fn new(service_count: usize) -> Self {
        Self {
            records: (0..service_count).map(|_| Arc::new(Mutex::new(ServiceRecord::default()))).collect(),
            last_startup: RwLock::new(None),
        }
    }

    /// Record of one service.
    pub fn record(&self, id: ServiceId) -> Arc<Mutex<ServiceRecord>> {
        Arc::clone(&self.records[id.index()])
    }

    pub async fn state(&self, id: ServiceId) -> ServiceState {
        self.records[id.index()].lock().await.state
    }

    /// Copy of every record, in declaration order.
    pub async fn snapshot(&self) -> Vec<ServiceRecord> {
        let mut out = Vec::with_capacity(self.records.len());
        for record in &self.records {
            out.push(record.lock().await.clone());
        }
        out
    }

    /// Remember the levels that were started, for teardown.
    pub async fn record_startup(&self, plan: StartupPlan) {
        *self.last_startup.write().await = Some(plan);
    }

    pub async fn last_startup(&self) -> Option<StartupPlan> {
        self.last_startup.read().await.clone()
    }
}
