//! Service lifecycle controller.
//!
//! Drives one service at a time through its state machine. Every operation
//! holds the service's record lock for the state change it makes, so workers
//! never race on the same service.

use super::state::{RunState, ServiceRecord, ServiceState, StopOutcome};
use crate::error::{ConvoyError, Result};
use crate::manifest::{Manifest, MountMode, ServiceId, VolumeKind};
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, ContainerStatus, HealthStatus, Mount, MountSource,
    NetworkEndpoint,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Timing knobs of the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Grace period handed to the runtime on stop
    pub stop_grace: Duration,

    /// Extra time the runtime gets to acknowledge a stop before we kill
    pub stop_slack: Duration,

    /// How long a `service_healthy` dependency may take to turn healthy
    pub health_timeout: Duration,

    /// Delay between health polls
    pub health_poll_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            stop_slack: Duration::from_secs(5),
            health_timeout: Duration::from_secs(60),
            health_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Lifecycle controller for the services of one manifest.
pub struct LifecycleController {
    manifest: Arc<Manifest>,
    runtime: Arc<dyn ContainerRuntime>,
    state: Arc<RunState>,
    settings: ControllerSettings,
}

impl LifecycleController {
    pub fn new(
        manifest: Arc<Manifest>,
        runtime: Arc<dyn ContainerRuntime>,
        state: Arc<RunState>,
        settings: ControllerSettings,
    ) -> Self {
        Self { manifest, runtime, state, settings }
    }

    /// Translate a manifest service into what the runtime creates.
    pub fn container_spec(&self, id: ServiceId) -> ContainerSpec {
        let manifest = &self.manifest;
        let service = manifest.service(id);

        let mounts = service
            .volumes
            .iter()
            .map(|binding| Mount {
                source: match &binding.kind {
                    VolumeKind::Named(volume) => MountSource::Volume(manifest.volume(*volume).name.clone()),
                    VolumeKind::Bind(path) => MountSource::Bind(path.clone()),
                    VolumeKind::Anonymous => MountSource::Anonymous,
                },
                target: binding.target.clone(),
                read_only: binding.mode == MountMode::Ro,
            })
            .collect();

        // Peers reach a service by its name on every network it joins
        let networks = service
            .networks
            .iter()
            .map(|attachment| {
                let mut aliases = vec![service.name.clone()];
                for alias in &attachment.aliases {
                    if !aliases.contains(alias) {
                        aliases.push(alias.clone());
                    }
                }
                NetworkEndpoint { network: manifest.network(attachment.network).name.clone(), aliases }
            })
            .collect();

        ContainerSpec {
            name: manifest.container_name(id),
            image: service.image.tag().to_string(),
            command: service.command.clone(),
            entrypoint: service.entrypoint.clone(),
            env: service.environment.clone(),
            mounts,
            networks,
            ports: service.ports.clone(),
            tty: service.tty,
            stdin_open: service.stdin_open,
            working_dir: service.working_dir.clone(),
            user: service.user.clone(),
            restart: service.restart.clone(),
            labels: service.labels.clone(),
            healthcheck: service.healthcheck.clone(),
        }
    }

    /// Create the service's container: `pending -> created`.
    ///
    /// An existing container (adopted or from an earlier `up`) is reused.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn create(&self, id: ServiceId) -> Result<()> {
        let name = &self.manifest.service(id).name;
        let entry = self.state.record(id);
        let mut record = entry.lock().await;

        if record.container.is_some() {
            debug!("Reusing existing container");
            return Ok(());
        }
        if matches!(record.state, ServiceState::Removed | ServiceState::Failed) {
            record.reset();
        }

        let spec = self.container_spec(id);
        match self.runtime.create_container(&spec).await {
            Ok(container) => {
                record.transition(ServiceState::Created)?;
                info!(container = %container, "Container created");
                record.container = Some(container);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(error = %reason, "Container creation failed");
                record.fail(reason.clone())?;
                Err(ConvoyError::Creation { service: name.clone(), reason })
            }
        }
    }

    /// Start the container: `created -> starting -> running`.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn start(&self, id: ServiceId) -> Result<()> {
        let name = &self.manifest.service(id).name;
        let entry = self.state.record(id);
        let mut record = entry.lock().await;

        if record.state.is_up() {
            debug!("Already running");
            return Ok(());
        }
        let container = record.container.clone().ok_or_else(|| {
            ConvoyError::Internal(format!("service '{}' has no container to start", name))
        })?;

        record.transition(ServiceState::Starting)?;
        match self.runtime.start(&container).await {
            Ok(()) => {
                record.transition(ServiceState::Running)?;
                record.last_error = None;
                info!("Service running");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(error = %reason, "Service failed to start");
                record.fail(reason.clone())?;
                Err(ConvoyError::Runtime {
                    service: name.clone(),
                    state: ServiceState::Starting,
                    reason,
                })
            }
        }
    }

    /// Poll the runtime until the service reports healthy: `running -> healthy`.
    ///
    /// Unhealthy, exited and timed-out services move to `failed`.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn wait_healthy(&self, id: ServiceId) -> Result<()> {
        let name = &self.manifest.service(id).name;
        let entry = self.state.record(id);

        let container = {
            let record = entry.lock().await;
            if record.state == ServiceState::Healthy {
                return Ok(());
            }
            record.container.clone().ok_or_else(|| {
                ConvoyError::Internal(format!("service '{}' has no container", name))
            })?
        };

        debug!(timeout = ?self.settings.health_timeout, "Waiting for service to become healthy");
        let poll = self.poll_health(&container);
        let outcome: std::result::Result<(), HealthError> =
            match tokio::time::timeout(self.settings.health_timeout, poll).await {
                Ok(result) => result,
                Err(_) => Err(HealthError::Unhealthy(format!(
                    "did not become healthy within {}s",
                    self.settings.health_timeout.as_secs()
                ))),
            };

        let mut record = entry.lock().await;
        match outcome {
            Ok(()) => {
                record.transition(ServiceState::Healthy)?;
                info!("Service healthy");
                Ok(())
            }
            Err(HealthError::Runtime(e)) => Err(e),
            Err(HealthError::Unhealthy(reason)) => {
                warn!(error = %reason, "Service did not become healthy");
                record.fail(reason.clone())?;
                Err(ConvoyError::Runtime { service: name.clone(), state: ServiceState::Running, reason })
            }
        }
    }

    /// Mark a service failed outside the runtime calls (e.g. its image could
    /// not be resolved).
    pub async fn mark_failed(&self, id: ServiceId, reason: &str) -> Result<()> {
        let entry = self.state.record(id);
        let mut record = entry.lock().await;
        if record.container.is_none() && record.state == ServiceState::Removed {
            record.reset();
        }
        if record.state.can_transition_to(ServiceState::Failed) {
            record.fail(reason)?;
        } else {
            record.last_error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn poll_health(&self, container: &ContainerId) -> std::result::Result<(), HealthError> {
        loop {
            let info = self.runtime.inspect_container(container).await?;
            match (info.status, info.health) {
                (ContainerStatus::Running, Some(HealthStatus::Healthy)) => return Ok(()),
                (ContainerStatus::Running, Some(HealthStatus::Unhealthy)) => {
                    return Err(HealthError::Unhealthy("health check reported unhealthy".into()))
                }
                (ContainerStatus::Running, None) => {
                    return Err(HealthError::Unhealthy("no health check configured".into()))
                }
                (ContainerStatus::Exited | ContainerStatus::Dead, _) => {
                    return Err(HealthError::Unhealthy(exit_reason(info.exit_code)))
                }
                _ => tokio::time::sleep(self.settings.health_poll_interval).await,
            }
        }
    }

    /// Reconcile a running service with what the runtime reports.
    ///
    /// A crash or non-zero exit moves the service to `failed`.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn refresh(&self, id: ServiceId) -> Result<ServiceState> {
        let entry = self.state.record(id);
        let mut record = entry.lock().await;

        let Some(container) = record.container.clone() else {
            return Ok(record.state);
        };
        if !record.state.is_up() {
            return Ok(record.state);
        }

        let info = self.runtime.inspect_container(&container).await?;
        match info.status {
            ContainerStatus::Exited | ContainerStatus::Dead => match info.exit_code {
                Some(0) => {
                    record.transition(ServiceState::Stopping)?;
                    record.transition(ServiceState::Stopped)?;
                }
                code => {
                    let reason = exit_reason(code);
                    warn!(error = %reason, "Service crashed");
                    record.fail(reason)?;
                }
            },
            ContainerStatus::Running if info.health == Some(HealthStatus::Unhealthy) => {
                record.fail("health check reported unhealthy")?;
            }
            _ => {}
        }
        Ok(record.state)
    }

    /// Stop the service's container with a bounded grace period.
    ///
    /// When the runtime does not acknowledge in time the container is killed
    /// and the degraded outcome is recorded; that is not an error.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn stop(&self, id: ServiceId) -> Result<StopOutcome> {
        let name = &self.manifest.service(id).name;
        let entry = self.state.record(id);
        let mut record = entry.lock().await;

        let Some(container) = record.container.clone() else {
            return Ok(StopOutcome::NotRunning);
        };
        if !record.state.is_active() {
            return Ok(StopOutcome::NotRunning);
        }

        record.transition(ServiceState::Stopping)?;
        let grace = self.settings.stop_grace;
        let deadline = grace + self.settings.stop_slack;

        let outcome = match tokio::time::timeout(deadline, self.runtime.stop(&container, grace)).await
        {
            Ok(Ok(())) => {
                info!("Service stopped");
                StopOutcome::Graceful
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Graceful stop failed, force killing");
                self.force_kill(name, &mut record).await?;
                StopOutcome::Killed
            }
            Err(_) => {
                let degraded =
                    ConvoyError::Timeout { service: name.clone(), grace_secs: grace.as_secs() };
                warn!(error = %degraded, "Graceful stop timed out, force killing");
                self.force_kill(name, &mut record).await?;
                StopOutcome::TimedOut
            }
        };

        record.transition(ServiceState::Stopped)?;
        record.stop_outcome = Some(outcome);
        Ok(outcome)
    }

    async fn force_kill(&self, name: &str, record: &mut ServiceRecord) -> Result<()> {
        let Some(container) = record.container.clone() else {
            return Ok(());
        };
        if let Err(e) = self.runtime.kill(&container).await {
            let reason = format!("kill failed: {}", e);
            record.fail(reason.clone())?;
            return Err(ConvoyError::Runtime {
                service: name.to_string(),
                state: ServiceState::Stopping,
                reason,
            });
        }
        Ok(())
    }

    /// Remove the container together with its anonymous volumes.
    ///
    /// Services that never got a container move straight to `removed`.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn remove(&self, id: ServiceId) -> Result<()> {
        let name = &self.manifest.service(id).name;
        let entry = self.state.record(id);
        let mut record = entry.lock().await;

        let Some(container) = record.container.clone() else {
            if matches!(record.state, ServiceState::Pending | ServiceState::Failed) {
                record.transition(ServiceState::Removed)?;
            }
            return Ok(());
        };

        if matches!(
            record.state,
            ServiceState::Starting | ServiceState::Running | ServiceState::Healthy
        ) {
            return Err(ConvoyError::Internal(format!(
                "service '{}' must be stopped before removal (state: {})",
                name, record.state
            )));
        }

        self.runtime.remove(&container, true).await.map_err(|e| ConvoyError::Runtime {
            service: name.clone(),
            state: record.state,
            reason: e.to_string(),
        })?;

        record.transition(ServiceState::Removed)?;
        record.container = None;
        info!(container = %container, "Container removed");
        Ok(())
    }

    pub async fn has_container(&self, id: ServiceId) -> bool {
        self.state.record(id).lock().await.container.is_some()
    }

    /// Register the service's container if the runtime already has one.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn adopt(&self, id: ServiceId) -> Result<()> {
        let entry = self.state.record(id);
        let mut record = entry.lock().await;
        if record.container.is_some() {
            return Ok(());
        }

        let container_name = self.manifest.container_name(id);
        if let Some(info) = self.runtime.find_container(&container_name).await? {
            record.adopt(&info);
            debug!(container = %info.id, state = %record.state, "Adopted existing container");
        }
        Ok(())
    }
}

/// Why a health wait ended without success.
enum HealthError {
    /// The runtime call itself failed
    Runtime(ConvoyError),
    /// The service is not healthy
    Unhealthy(String),
}

impl From<ConvoyError> for HealthError {
    fn from(e: ConvoyError) -> Self {
        HealthError::Runtime(e)
    }
}

fn exit_reason(code: Option<i64>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "exited".to_string(),
    }
}
