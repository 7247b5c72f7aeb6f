//! Orchestration driver.
//!
//! Brings a project up level by level and tears it down in the exact reverse
//! order. Services of one level run concurrently in a `JoinSet` gated by a
//! semaphore; levels are separated by a barrier. An interrupt (see
//! [`CancelHandle`]) stops dispatching, lets in-flight work finish and tears
//! down the interrupted level.

mod render;
mod signal;

pub use signal::{cancel_on_interrupt, CancelHandle};

use crate::config::EngineConfig;
use crate::error::{ConvoyError, Result, ServiceFailure};
use crate::images::{ImageAction, ImageResolver};
use crate::lifecycle::{ControllerSettings, LifecycleController, RunState, ServiceState, StopOutcome};
use crate::manifest::{Manifest, ServiceId};
use crate::provisioner::Provisioner;
use crate::resolver::{self, StartupPlan};
use crate::runtime::ContainerRuntime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

/// Concurrency and timing knobs of the driver.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Concurrent workers per level
    pub max_parallel: usize,
    /// Upper bound for bringing up one level
    pub level_timeout: Duration,
    pub controller: ControllerSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            level_timeout: Duration::from_secs(300),
            controller: ControllerSettings::default(),
        }
    }
}

impl From<&EngineConfig> for DriverSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_parallel: config.max_parallel.max(1),
            level_timeout: config.level_timeout(),
            controller: config.controller_settings(),
        }
    }
}

/// Options of `up`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpOptions {
    /// Return once every level is up instead of attaching to logs
    pub detached: bool,
    /// Rebuild every service that has a build context
    pub build: bool,
}

/// Result of a successful `up`.
#[derive(Debug, Clone, Serialize)]
pub struct UpReport {
    /// Service names per started level
    pub levels: Vec<Vec<String>>,
    /// What image resolution did per service
    pub images: BTreeMap<String, ImageAction>,
    /// Service whose logs were followed in the foreground
    pub attached: Option<String>,
}

/// Result of `stop`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    /// Services that were stopped, in teardown order
    pub stopped: Vec<(String, StopOutcome)>,
}

impl StopReport {
    /// Services whose stop was degraded to a kill.
    pub fn degraded(&self) -> impl Iterator<Item = &str> {
        self.stopped
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StopOutcome::TimedOut | StopOutcome::Killed))
            .map(|(name, _)| name.as_str())
    }
}

/// Result of `down`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownReport {
    pub stopped: Vec<(String, StopOutcome)>,
    /// Services whose container was removed, in teardown order
    pub removed: Vec<String>,
    pub networks_removed: bool,
    pub volumes_removed: bool,
}

/// One row of `ps`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container_name: String,
    pub image: String,
    pub state: ServiceState,
    pub container_id: Option<String>,
    pub ports: Vec<String>,
    pub last_error: Option<String>,
}

/// Outcome of one level.
#[derive(Default)]
struct LevelOutcome {
    images: Vec<(ServiceId, ImageAction)>,
    failures: Vec<ServiceFailure>,
    cancelled: bool,
}

/// Collaborators a worker needs, cloned into each task.
#[derive(Clone)]
struct Worker {
    manifest: Arc<Manifest>,
    controller: Arc<LifecycleController>,
    images: Arc<ImageResolver>,
}

impl Worker {
    /// Resolve the image, create, start and (when a dependent asks for it)
    /// wait for health.
    async fn bring_up(&self, id: ServiceId, build: bool) -> Result<ImageAction> {
        let action = match self.images.ensure(id, build).await {
            Ok(action) => action,
            Err(e) => {
                self.controller.mark_failed(id, &e.to_string()).await?;
                return Err(e);
            }
        };

        self.controller.create(id).await?;
        self.controller.start(id).await?;
        if self.manifest.readiness_requires_health(id) {
            self.controller.wait_healthy(id).await?;
        }
        Ok(action)
    }
}

/// Orchestrator for one project.
pub struct Orchestrator {
    manifest: Arc<Manifest>,
    state: Arc<RunState>,
    controller: Arc<LifecycleController>,
    provisioner: Provisioner,
    images: Arc<ImageResolver>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: DriverSettings,
    cancel: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    /// Create an orchestrator configured from the engine configuration.
    pub fn new(manifest: Manifest, runtime: Arc<dyn ContainerRuntime>, config: &EngineConfig) -> Self {
        Self::with_settings(manifest, runtime, DriverSettings::from(config))
    }

    pub fn with_settings(
        manifest: Manifest,
        runtime: Arc<dyn ContainerRuntime>,
        settings: DriverSettings,
    ) -> Self {
        let manifest = Arc::new(manifest);
        let state = Arc::new(RunState::new(manifest.services().len()));
        let controller = Arc::new(LifecycleController::new(
            manifest.clone(),
            runtime.clone(),
            state.clone(),
            settings.controller.clone(),
        ));
        let provisioner = Provisioner::new(manifest.clone(), runtime.clone());
        let images = Arc::new(ImageResolver::new(manifest.clone(), runtime.clone()));
        let (cancel, _) = watch::channel(false);

        Self {
            manifest,
            state,
            controller,
            provisioner,
            images,
            runtime,
            settings,
            cancel: Arc::new(cancel),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Run state of the project.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Handle that interrupts the running operation.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.cancel.clone())
    }

    /// Bring the project up.
    ///
    /// Ordering errors are raised before any side effect and provisioning
    /// errors before any container exists. Containers left by an earlier run
    /// are adopted by name and started again instead of being recreated.
    /// Per-service failures of a level are aggregated into `PartialFailure`
    /// once the whole level has settled, and no later level starts.
    #[instrument(skip(self), fields(project = %self.manifest.project()))]
    pub async fn up(&self, options: UpOptions) -> Result<UpReport> {
        let plan = resolver::order(&self.manifest)?;
        self.provisioner.provision_all().await?;
        self.adopt_all().await?;

        let mut cancel_rx = self.cancel.subscribe();
        let mut started: Vec<Vec<ServiceId>> = Vec::new();
        let mut images = BTreeMap::new();

        for (index, level) in plan.levels().iter().enumerate() {
            if *cancel_rx.borrow() {
                info!(level = index, "Interrupted before level, nothing in flight");
                return Err(ConvoyError::Cancelled);
            }

            info!(level = index, services = ?self.manifest.names(level), "Starting level");
            let outcome = self.run_level(level, options.build, &mut cancel_rx).await;

            if outcome.cancelled {
                warn!(level = index, "Interrupted, tearing down the level in flight");
                let teardown: Vec<ServiceId> = level.iter().rev().copied().collect();
                let (_, failures) = self.stop_levels(std::slice::from_ref(&teardown)).await;
                for failure in &failures {
                    warn!(service = %failure.service, error = %failure.reason, "Teardown after interrupt failed");
                }
                self.remove_levels(std::slice::from_ref(&teardown)).await;
                self.state.record_startup(StartupPlan::from_levels(started)).await;
                return Err(ConvoyError::Cancelled);
            }

            started.push(level.clone());
            self.state.record_startup(StartupPlan::from_levels(started.clone())).await;
            for (id, action) in outcome.images {
                images.insert(self.manifest.service(id).name.clone(), action);
            }

            if !outcome.failures.is_empty() {
                error!(
                    level = index,
                    failed = outcome.failures.len(),
                    "Level failed, not starting dependents"
                );
                return Err(ConvoyError::PartialFailure { failures: outcome.failures });
            }
        }

        let levels = StartupPlan::from_levels(started).level_names(&self.manifest);
        info!(services = self.manifest.services().len(), "Project is up");

        let mut report = UpReport { levels, images, attached: None };
        if options.detached {
            return Ok(report);
        }

        // Foreground: follow the last-started service until interrupted
        if let Some(id) = plan.levels().last().and_then(|level| level.last()).copied() {
            report.attached = Some(self.manifest.service(id).name.clone());
            self.attach(id, &mut cancel_rx).await?;
        }
        self.stop().await?;
        Ok(report)
    }

    /// Bring up one level and wait for every worker to settle.
    async fn run_level(
        &self,
        level: &[ServiceId],
        build: bool,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> LevelOutcome {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel));
        let worker = self.worker();
        let mut workers = JoinSet::new();

        for &id in level {
            let sem = semaphore.clone();
            let worker = worker.clone();
            let cancel = cancel_rx.clone();
            workers.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (id, Err(ConvoyError::Internal("worker pool closed".into()))),
                };
                // No new work once interrupted
                if *cancel.borrow() {
                    return (id, Err(ConvoyError::Cancelled));
                }
                (id, worker.bring_up(id, build).await)
            });
        }

        let mut outcome = LevelOutcome::default();
        let mut unfinished: BTreeSet<ServiceId> = level.iter().copied().collect();
        let mut timed_out = false;
        let mut watching = true;
        let deadline = tokio::time::Instant::now() + self.settings.level_timeout;

        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((id, result)) => {
                            unfinished.remove(&id);
                            self.settle(id, result, &mut outcome).await;
                        }
                        Err(e) => warn!(error = %e, "Worker task ended abnormally"),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(timeout = ?self.settings.level_timeout, "Level timed out, aborting workers");
                    timed_out = true;
                    workers.abort_all();
                    while let Some(joined) = workers.join_next().await {
                        if let Ok((id, result)) = joined {
                            unfinished.remove(&id);
                            self.settle(id, result, &mut outcome).await;
                        }
                    }
                    break;
                }
                changed = cancel_rx.changed(), if watching => {
                    watching = false;
                    if changed.is_ok() && *cancel_rx.borrow() {
                        info!("Interrupt received, waiting for in-flight work");
                        outcome.cancelled = true;
                    }
                }
            }
        }

        for id in unfinished {
            let name = &self.manifest.service(id).name;
            let reason = if timed_out {
                format!("level did not come up within {:?}", self.settings.level_timeout)
            } else {
                "worker task ended abnormally".to_string()
            };
            if let Err(e) = self.controller.mark_failed(id, &reason).await {
                warn!(service = %name, error = %e, "Failed to record failure");
            }
            let state = self.state.state(id).await;
            outcome.failures.push(ServiceFailure { service: name.clone(), state, reason });
        }

        outcome.cancelled |= *cancel_rx.borrow();
        if !outcome.cancelled {
            self.confirm_up(&mut outcome).await;
        }
        outcome
    }

    /// Ask the runtime about every service the level brought up. One that
    /// already exited with a non-zero code or crashed fails the level.
    async fn confirm_up(&self, outcome: &mut LevelOutcome) {
        let started: Vec<ServiceId> = outcome.images.iter().map(|(id, _)| *id).collect();
        let results = self
            .for_each_service(&started, |controller, id| async move { controller.refresh(id).await })
            .await;

        for (id, result) in results {
            let name = &self.manifest.service(id).name;
            match result {
                Ok(ServiceState::Failed) => {
                    let reason = self
                        .state
                        .record(id)
                        .lock()
                        .await
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "exited".to_string());
                    warn!(service = %name, error = %reason, "Service exited after start");
                    outcome.failures.push(ServiceFailure {
                        service: name.clone(),
                        state: ServiceState::Running,
                        reason,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(service = %name, error = %e, "Failed to confirm service is up");
                    outcome.failures.push(e.service_failure(name, ServiceState::Running));
                }
            }
        }
    }

    /// Fold one worker result into the level outcome.
    async fn settle(&self, id: ServiceId, result: Result<ImageAction>, outcome: &mut LevelOutcome) {
        let name = &self.manifest.service(id).name;
        match result {
            Ok(action) => outcome.images.push((id, action)),
            Err(ConvoyError::Cancelled) => debug!(service = %name, "Not dispatched after interrupt"),
            Err(e) => {
                warn!(service = %name, error = %e, "Service failed to come up");
                let state = self.state.state(id).await;
                outcome.failures.push(e.service_failure(name, state));
            }
        }
    }

    /// Follow the logs of one service until the stream ends or an interrupt.
    async fn attach(&self, id: ServiceId, cancel_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let name = self.manifest.service(id).name.clone();
        let Some(container) = self.state.record(id).lock().await.container.clone() else {
            return Ok(());
        };

        info!(service = %name, "Attaching to logs, press Ctrl+C to stop");
        let mut logs = self.runtime.stream_logs(&container).await?;
        let mut stdout = tokio::io::stdout();

        loop {
            if *cancel_rx.borrow() {
                break;
            }
            tokio::select! {
                line = logs.next() => match line {
                    Some(Ok(line)) => {
                        let text = format!("{} | {}\n", name, line.line);
                        if let Err(e) = stdout.write_all(text.as_bytes()).await {
                            warn!(error = %e, "Failed to write logs");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(service = %name, error = %e, "Log stream failed");
                        break;
                    }
                    None => {
                        debug!(service = %name, "Log stream ended");
                        break;
                    }
                },
                changed = cancel_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = stdout.flush().await;
        Ok(())
    }

    /// Stop every service in reverse startup order; resources are untouched.
    #[instrument(skip(self), fields(project = %self.manifest.project()))]
    pub async fn stop(&self) -> Result<StopReport> {
        self.adopt_all().await?;
        let levels = self.teardown_order().await?;
        let (report, failures) = self.stop_levels(&levels).await;

        if !failures.is_empty() {
            return Err(ConvoyError::PartialFailure { failures });
        }
        info!(stopped = report.stopped.len(), "Project stopped");
        Ok(report)
    }

    /// Stop, remove every container with its anonymous volumes, remove
    /// networks, and named volumes only when `remove_volumes` is set.
    #[instrument(skip(self), fields(project = %self.manifest.project()))]
    pub async fn down(&self, remove_volumes: bool) -> Result<DownReport> {
        self.adopt_all().await?;
        let levels = self.teardown_order().await?;

        let (stop_report, mut failures) = self.stop_levels(&levels).await;
        let (removed, remove_failures) = self.remove_levels(&levels).await;
        failures.extend(remove_failures);

        if !failures.is_empty() {
            warn!("Containers left behind, keeping networks and volumes");
            return Err(ConvoyError::PartialFailure { failures });
        }

        self.provisioner.remove_networks().await?;
        if remove_volumes {
            self.provisioner.remove_volumes().await?;
        }

        info!(removed = removed.len(), volumes = remove_volumes, "Project removed");
        Ok(DownReport {
            stopped: stop_report.stopped,
            removed,
            networks_removed: true,
            volumes_removed: remove_volumes,
        })
    }

    /// Adopt existing containers, reconcile their state and report every service.
    #[instrument(skip(self), fields(project = %self.manifest.project()))]
    pub async fn ps(&self) -> Result<Vec<ServiceStatus>> {
        self.adopt_all().await?;
        for service in self.manifest.services() {
            self.controller.refresh(service.id).await?;
        }

        let records = self.state.snapshot().await;
        Ok(self
            .manifest
            .services()
            .iter()
            .zip(records)
            .map(|(service, record)| ServiceStatus {
                service: service.name.clone(),
                container_name: self.manifest.container_name(service.id),
                image: service.image.tag().to_string(),
                state: record.state,
                container_id: record.container.map(|c| c.to_string()),
                ports: service.ports.iter().map(ToString::to_string).collect(),
                last_error: record.last_error,
            })
            .collect())
    }

    /// Render the resolved manifest as YAML in startup order.
    pub fn config(&self) -> Result<String> {
        let plan = resolver::order(&self.manifest)?;
        render::render(&self.manifest, &plan)
    }

    fn worker(&self) -> Worker {
        Worker {
            manifest: self.manifest.clone(),
            controller: self.controller.clone(),
            images: self.images.clone(),
        }
    }

    async fn adopt_all(&self) -> Result<()> {
        for service in self.manifest.services() {
            self.controller.adopt(service.id).await?;
        }
        Ok(())
    }

    /// Teardown levels: the exact reverse of the last startup, preceded by
    /// services that startup never reached (reverse resolver order).
    async fn teardown_order(&self) -> Result<Vec<Vec<ServiceId>>> {
        let full = resolver::order(&self.manifest)?;
        let Some(last) = self.state.last_startup().await else {
            return Ok(full.teardown());
        };

        let started: HashSet<ServiceId> = last.services().collect();
        let mut levels: Vec<Vec<ServiceId>> = full
            .teardown()
            .into_iter()
            .map(|level| level.into_iter().filter(|id| !started.contains(id)).collect::<Vec<_>>())
            .filter(|level| !level.is_empty())
            .collect();
        levels.extend(last.teardown());
        Ok(levels)
    }

    /// Stop the given levels in order, concurrently within a level.
    async fn stop_levels(&self, levels: &[Vec<ServiceId>]) -> (StopReport, Vec<ServiceFailure>) {
        let mut report = StopReport::default();
        let mut failures = Vec::new();

        for level in levels {
            let results = self
                .for_each_service(level, |controller, id| async move { controller.stop(id).await })
                .await;
            for (id, result) in results {
                let name = &self.manifest.service(id).name;
                match result {
                    Ok(StopOutcome::NotRunning) => {}
                    Ok(outcome) => report.stopped.push((name.clone(), outcome)),
                    Err(e) => {
                        warn!(service = %name, error = %e, "Failed to stop service");
                        failures.push(e.service_failure(name, ServiceState::Stopping));
                    }
                }
            }
        }
        (report, failures)
    }

    /// Remove the containers of the given levels in order.
    async fn remove_levels(&self, levels: &[Vec<ServiceId>]) -> (Vec<String>, Vec<ServiceFailure>) {
        let mut removed = Vec::new();
        let mut failures = Vec::new();

        for level in levels {
            let results = self
                .for_each_service(level, |controller, id| async move {
                    let had_container = controller.has_container(id).await;
                    controller.remove(id).await.map(|()| had_container)
                })
                .await;
            for (id, result) in results {
                let name = &self.manifest.service(id).name;
                match result {
                    Ok(true) => removed.push(name.clone()),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(service = %name, error = %e, "Failed to remove service");
                        let state = self.state.state(id).await;
                        failures.push(e.service_failure(name, state));
                    }
                }
            }
        }
        (removed, failures)
    }

    /// Run `op` for every service of a level on the bounded worker pool.
    ///
    /// Results come back in level order.
    async fn for_each_service<F, Fut, T>(
        &self,
        level: &[ServiceId],
        op: F,
    ) -> Vec<(ServiceId, Result<T>)>
    where
        F: Fn(Arc<LifecycleController>, ServiceId) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel));
        let mut workers = JoinSet::new();

        for (position, &id) in level.iter().enumerate() {
            let sem = semaphore.clone();
            let task = op(self.controller.clone(), id);
            workers.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (position, Err(ConvoyError::Internal("worker pool closed".into())))
                    }
                };
                (position, task.await)
            });
        }

        let mut results: Vec<Option<Result<T>>> = level.iter().map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = Some(result),
                Err(e) => warn!(error = %e, "Worker task ended abnormally"),
            }
        }

        level
            .iter()
            .zip(results)
            .map(|(id, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(ConvoyError::Internal("worker task ended abnormally".into()))
                });
                (*id, result)
            })
            .collect()
    }
}
