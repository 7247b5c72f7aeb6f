//! Shared resource provisioning.
//!
//! Networks and named volumes are ensured once per run before any service
//! starts. Handles are memoized and the runtime is inspected before anything
//! is created, so ensuring twice never creates twice.

use crate::error::{ConvoyError, ResourceKind, Result};
use crate::manifest::{Manifest, NetworkId, VolumeId, VolumeKind, LABEL_PROJECT};
use crate::runtime::{ContainerRuntime, NetworkConfig, NetworkHandle, VolumeConfig, VolumeHandle};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Creates and removes the networks and volumes of one manifest.
pub struct Provisioner {
    manifest: Arc<Manifest>,
    runtime: Arc<dyn ContainerRuntime>,
    networks: Mutex<HashMap<NetworkId, NetworkHandle>>,
    volumes: Mutex<HashMap<VolumeId, VolumeHandle>>,
}

impl Provisioner {
    pub fn new(manifest: Arc<Manifest>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            manifest,
            runtime,
            networks: Mutex::new(HashMap::new()),
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Networks joined by at least one service, in declaration order.
    pub fn used_networks(&self) -> Vec<NetworkId> {
        self.manifest
            .networks()
            .iter()
            .map(|n| n.id)
            .filter(|id| {
                self.manifest.services().iter().any(|s| s.networks.iter().any(|a| a.network == *id))
            })
            .collect()
    }

    /// Named volumes mounted by at least one service, in declaration order.
    pub fn used_volumes(&self) -> Vec<VolumeId> {
        self.manifest
            .volumes()
            .iter()
            .map(|v| v.id)
            .filter(|id| {
                self.manifest
                    .services()
                    .iter()
                    .any(|s| s.volumes.iter().any(|b| b.kind == VolumeKind::Named(*id)))
            })
            .collect()
    }

    /// Ensure a network exists and return its handle.
    #[instrument(skip(self), fields(network = %self.manifest.network(id).name))]
    pub async fn ensure_network(&self, id: NetworkId) -> Result<NetworkHandle> {
        let mut cache = self.networks.lock().await;
        if let Some(handle) = cache.get(&id) {
            return Ok(handle.clone());
        }

        let network = self.manifest.network(id);
        let fail = |reason: String| ConvoyError::Provisioning {
            resource: ResourceKind::Network,
            name: network.name.clone(),
            reason,
        };

        let existing = self.runtime.inspect_network(&network.name).await.map_err(|e| fail(e.to_string()))?;
        let handle = match existing {
            Some(handle) => {
                if !network.external && handle.driver != network.driver {
                    return Err(fail(format!(
                        "exists with driver '{}', declared driver is '{}'",
                        handle.driver, network.driver
                    )));
                }
                debug!("Network already exists");
                handle
            }
            None if network.external => {
                return Err(fail("external network does not exist".to_string()));
            }
            None => {
                let config = NetworkConfig {
                    name: network.name.clone(),
                    driver: network.driver.clone(),
                    internal: network.internal,
                    labels: self.labels(),
                };
                let handle =
                    self.runtime.create_network(&config).await.map_err(|e| fail(e.to_string()))?;
                info!(driver = %network.driver, "Network created");
                handle
            }
        };

        cache.insert(id, handle.clone());
        Ok(handle)
    }

    /// Ensure a named volume exists and return its handle.
    #[instrument(skip(self), fields(volume = %self.manifest.volume(id).name))]
    pub async fn ensure_volume(&self, id: VolumeId) -> Result<VolumeHandle> {
        let mut cache = self.volumes.lock().await;
        if let Some(handle) = cache.get(&id) {
            return Ok(handle.clone());
        }

        let volume = self.manifest.volume(id);
        let fail = |reason: String| ConvoyError::Provisioning {
            resource: ResourceKind::Volume,
            name: volume.name.clone(),
            reason,
        };

        let existing = self.runtime.inspect_volume(&volume.name).await.map_err(|e| fail(e.to_string()))?;
        let handle = match existing {
            Some(handle) => {
                if !volume.external && handle.driver != volume.driver {
                    return Err(fail(format!(
                        "exists with driver '{}', declared driver is '{}'",
                        handle.driver, volume.driver
                    )));
                }
                debug!("Volume already exists");
                handle
            }
            None if volume.external => {
                return Err(fail("external volume does not exist".to_string()));
            }
            None => {
                let config = VolumeConfig {
                    name: volume.name.clone(),
                    driver: volume.driver.clone(),
                    driver_opts: volume.driver_opts.clone(),
                    labels: self.labels(),
                };
                let handle =
                    self.runtime.create_volume(&config).await.map_err(|e| fail(e.to_string()))?;
                info!(driver = %volume.driver, "Volume created");
                handle
            }
        };

        cache.insert(id, handle.clone());
        Ok(handle)
    }

    /// Ensure every network and named volume a service uses.
    ///
    /// Stops at the first failure; resources created so far are kept.
    #[instrument(skip(self), fields(project = %self.manifest.project()))]
    pub async fn provision_all(&self) -> Result<()> {
        for id in self.used_networks() {
            self.ensure_network(id).await?;
        }
        for id in self.used_volumes() {
            self.ensure_volume(id).await?;
        }
        Ok(())
    }

    /// Remove the project's networks. External networks are left alone.
    ///
    /// Every network is attempted; the first failure is returned.
    #[instrument(skip(self), fields(project = %self.manifest.project()))]
    pub async fn remove_networks(&self) -> Result<()> {
        let mut first_error = None;
        for id in self.used_networks() {
            let network = self.manifest.network(id);
            if network.external {
                debug!(network = %network.name, "Skipping external network");
                continue;
            }
            match self.runtime.remove_network(&network.name).await {
                Ok(()) => {
                    self.networks.lock().await.remove(&id);
                    info!(network = %network.name, "Network removed");
                }
                Err(e) => {
                    warn!(network = %network.name, error = %e, "Failed to remove network");
                    first_error.get_or_insert(ConvoyError::Provisioning {
                        resource: ResourceKind::Network,
                        name: network.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove the project's named volumes. External volumes are left alone.
    #[instrument(skip(self), fields(project = %self.manifest.project()))]
    pub async fn remove_volumes(&self) -> Result<()> {
        let mut first_error = None;
        for id in self.used_volumes() {
            let volume = self.manifest.volume(id);
            if volume.external {
                debug!(volume = %volume.name, "Skipping external volume");
                continue;
            }
            match self.runtime.remove_volume(&volume.name).await {
                Ok(()) => {
                    self.volumes.lock().await.remove(&id);
                    info!(volume = %volume.name, "Volume removed");
                }
                Err(e) => {
                    warn!(volume = %volume.name, error = %e, "Failed to remove volume");
                    first_error.get_or_insert(ConvoyError::Provisioning {
                        resource: ResourceKind::Volume,
                        name: volume.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_PROJECT.to_string(), self.manifest.project().to_string())])
    }
}
