//! In-memory container runtime for tests.
//!
//! Available to the crate's own unit tests and, with the `testing` feature,
//! to integration tests and downstream crates.

use crate::error::{ConvoyError, Result};
use crate::runtime::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps runtime objects in memory and records every call as
/// `"<operation> <target>"`.
///
/// Container ids equal container names. Creating a container under a name
/// that is already taken fails the way Docker does.
#[derive(Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, ContainerInfo>>,
    specs: Mutex<HashMap<String, ContainerSpec>>,
    networks: Mutex<HashMap<String, String>>,
    volumes: Mutex<HashMap<String, String>>,
    images: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    create_delays: Mutex<HashMap<String, Duration>>,
    hanging_stops: Mutex<HashSet<String>>,
    health_on_start: Mutex<HashMap<String, HealthStatus>>,
    exit_on_start: Mutex<HashMap<String, i64>>,
    anonymous_volumes_removed: Mutex<Vec<String>>,
    log_lines: Mutex<Vec<String>>,
}

impl MockRuntime {
    /// Make `"<operation> <target>"` fail.
    pub fn fail_on(&self, call: &str) {
        lock(&self.failing).insert(call.into());
    }

    /// Hold container creation for `delay` before it happens.
    pub fn delay_create(&self, container: &str, delay: Duration) {
        lock(&self.create_delays).insert(container.into(), delay);
    }

    /// Never acknowledge a stop of `container`.
    pub fn hang_on_stop(&self, container: &str) {
        lock(&self.hanging_stops).insert(container.into());
    }

    /// Report `health` once `container` has started.
    pub fn health_after_start(&self, container: &str, health: HealthStatus) {
        lock(&self.health_on_start).insert(container.into(), health);
    }

    /// Let `container` exit with `code` as soon as it starts.
    pub fn exit_after_start(&self, container: &str, code: i64) {
        lock(&self.exit_on_start).insert(container.into(), code);
    }

    /// Mark a running container as exited.
    pub fn exit(&self, container: &str, code: i64) -> Result<()> {
        self.update(&ContainerId::new(container), |info| {
            info.status = ContainerStatus::Exited;
            info.exit_code = Some(code);
        })
    }

    pub fn add_network(&self, name: &str, driver: &str) {
        lock(&self.networks).insert(name.into(), driver.into());
    }

    pub fn add_image(&self, reference: &str) {
        lock(&self.images).insert(reference.into());
    }

    /// Line served by every log stream.
    pub fn push_log_line(&self, line: &str) {
        lock(&self.log_lines).push(line.into());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.split(' ').next() == Some(op)).collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls_of(op).len()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        lock(&self.volumes).contains_key(name)
    }

    pub fn has_container(&self, name: &str) -> bool {
        lock(&self.containers).contains_key(name)
    }

    /// Spec the container was last created with.
    pub fn spec(&self, container: &str) -> Option<ContainerSpec> {
        lock(&self.specs).get(container).cloned()
    }

    /// Containers removed together with their anonymous volumes.
    pub fn anonymous_volumes_removed(&self) -> Vec<String> {
        lock(&self.anonymous_volumes_removed).clone()
    }

    fn record(&self, op: &str, target: &str) -> Result<()> {
        let call = format!("{} {}", op, target);
        lock(&self.calls).push(call.clone());
        if lock(&self.failing).contains(&call) {
            return Err(ConvoyError::RuntimeCall(format!("{} failed", call)));
        }
        Ok(())
    }

    fn update(&self, id: &ContainerId, f: impl FnOnce(&mut ContainerInfo)) -> Result<()> {
        let mut containers = lock(&self.containers);
        let info = containers
            .get_mut(id.as_str())
            .ok_or_else(|| ConvoyError::RuntimeCall(format!("no such container: {}", id)))?;
        f(info);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let delay = lock(&self.create_delays).get(&spec.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record("create_container", &spec.name)?;

        let mut containers = lock(&self.containers);
        if containers.contains_key(&spec.name) {
            return Err(ConvoyError::RuntimeCall(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let id = ContainerId::new(spec.name.clone());
        containers.insert(
            spec.name.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                status: ContainerStatus::Created,
                health: None,
                exit_code: None,
            },
        );
        lock(&self.specs).insert(spec.name.clone(), spec.clone());
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.record("start", id.as_str())?;
        let health = lock(&self.health_on_start).get(id.as_str()).copied();
        let exit = lock(&self.exit_on_start).get(id.as_str()).copied();
        self.update(id, |info| match exit {
            Some(code) => {
                info.status = ContainerStatus::Exited;
                info.health = None;
                info.exit_code = Some(code);
            }
            None => {
                info.status = ContainerStatus::Running;
                info.health = health;
                info.exit_code = None;
            }
        })
    }

    async fn stop(&self, id: &ContainerId, _grace: Duration) -> Result<()> {
        self.record("stop", id.as_str())?;
        let hangs = lock(&self.hanging_stops).contains(id.as_str());
        if hangs {
            std::future::pending::<()>().await;
        }
        self.update(id, |info| {
            info.status = ContainerStatus::Exited;
            info.exit_code = Some(0);
        })
    }

    async fn kill(&self, id: &ContainerId) -> Result<()> {
        self.record("kill", id.as_str())?;
        self.update(id, |info| {
            info.status = ContainerStatus::Exited;
            info.exit_code = Some(137);
        })
    }

    async fn remove(&self, id: &ContainerId, remove_anonymous_volumes: bool) -> Result<()> {
        self.record("remove", id.as_str())?;
        if remove_anonymous_volumes {
            lock(&self.anonymous_volumes_removed).push(id.to_string());
        }
        lock(&self.containers).remove(id.as_str());
        Ok(())
    }

    async fn create_network(&self, config: &NetworkConfig) -> Result<NetworkHandle> {
        self.record("create_network", &config.name)?;
        self.add_network(&config.name, &config.driver);
        Ok(NetworkHandle {
            id: config.name.clone(),
            name: config.name.clone(),
            driver: config.driver.clone(),
        })
    }

    async fn create_volume(&self, config: &VolumeConfig) -> Result<VolumeHandle> {
        self.record("create_volume", &config.name)?;
        lock(&self.volumes).insert(config.name.clone(), config.driver.clone());
        Ok(VolumeHandle { name: config.name.clone(), driver: config.driver.clone() })
    }

    async fn stream_logs(&self, id: &ContainerId) -> Result<LogStream> {
        self.record("stream_logs", id.as_str())?;
        let lines: Vec<Result<LogLine>> = lock(&self.log_lines)
            .iter()
            .map(|line| Ok(LogLine { source: LogSource::Stdout, line: line.clone() }))
            .collect();
        Ok(Box::pin(tokio_stream::iter(lines)))
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkHandle>> {
        self.record("inspect_network", name)?;
        Ok(lock(&self.networks).get(name).map(|driver| NetworkHandle {
            id: name.to_string(),
            name: name.to_string(),
            driver: driver.clone(),
        }))
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeHandle>> {
        self.record("inspect_volume", name)?;
        Ok(lock(&self.volumes)
            .get(name)
            .map(|driver| VolumeHandle { name: name.to_string(), driver: driver.clone() }))
    }

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo> {
        self.record("inspect_container", id.as_str())?;
        lock(&self.containers)
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| ConvoyError::RuntimeCall(format!("no such container: {}", id)))
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        self.record("find_container", name)?;
        Ok(lock(&self.containers).get(name).cloned())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record("remove_network", name)?;
        lock(&self.networks).remove(name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record("remove_volume", name)?;
        lock(&self.volumes).remove(name);
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        self.record("image_exists", reference)?;
        Ok(lock(&self.images).contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.record("pull_image", reference)?;
        self.add_image(reference);
        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<()> {
        self.record("build_image", &request.tag)?;
        self.add_image(&request.tag);
        Ok(())
    }
}
