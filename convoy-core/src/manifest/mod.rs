//! Manifest model.
//!
//! The validated, immutable description of one application instance. Services,
//! networks and volumes are stored in arenas and refer to each other through
//! typed indices resolved once at load time, so nothing downstream performs
//! string lookups against the manifest.

pub mod binding;
pub mod env_file;
mod loader;

pub use binding::{MountMode, PortMapping, Protocol};

use crate::compose::DependencyCondition;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Label carrying the project name on every runtime object convoy creates.
pub const LABEL_PROJECT: &str = "io.convoy.project";
/// Label carrying the service name on containers.
pub const LABEL_SERVICE: &str = "io.convoy.service";

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(usize);

        impl $name {
            /// Position in the owning arena (declaration order).
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

arena_id!(
    /// Index of a service in the manifest.
    ServiceId
);
arena_id!(
    /// Index of a network in the manifest.
    NetworkId
);
arena_id!(
    /// Index of a volume in the manifest.
    VolumeId
);

/// Where a service's image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ImageSource {
    /// Pull `reference` when it is not present locally.
    Pull { reference: String },
    /// Build `context` and tag the result as `tag`.
    Build {
        context: PathBuf,
        dockerfile: Option<String>,
        args: BTreeMap<String, String>,
        target: Option<String>,
        tag: String,
    },
}

impl ImageSource {
    /// The single image tag a container of this service runs.
    pub fn tag(&self) -> &str {
        match self {
            ImageSource::Pull { reference } => reference,
            ImageSource::Build { tag, .. } => tag,
        }
    }
}

/// Backing of a volume binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "source", rename_all = "lowercase")]
pub enum VolumeKind {
    /// Runtime-managed persistent volume declared at the top level.
    Named(VolumeId),
    /// Host path mapped into the container (absolute after load).
    Bind(PathBuf),
    /// Ephemeral volume removed together with its container.
    Anonymous,
}

/// One volume binding of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeBinding {
    pub kind: VolumeKind,
    /// Mount path inside the container
    pub target: String,
    pub mode: MountMode,
}

/// Membership of a service in a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAttachment {
    pub network: NetworkId,
    /// Extra DNS names besides the service name
    pub aliases: Vec<String>,
}

/// Dependency edge of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub service: ServiceId,
    pub condition: DependencyCondition,
}

/// Health check passed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Healthcheck {
    /// `CMD`/`CMD-SHELL` prefixed test, as in the compose format
    pub test: Vec<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    pub start_period: Option<String>,
}

/// A service after validation.
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub id: ServiceId,
    /// Unique service name
    pub name: String,
    pub image: ImageSource,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeBinding>,
    /// Env files merged in order, then inline entries
    pub environment: BTreeMap<String, String>,
    pub networks: Vec<NetworkAttachment>,
    pub depends_on: Vec<Dependency>,
    pub stdin_open: bool,
    pub tty: bool,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub container_name: Option<String>,
    pub restart: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub healthcheck: Option<Healthcheck>,
}

impl Service {
    pub fn has_build_context(&self) -> bool {
        matches!(self.image, ImageSource::Build { .. })
    }
}

/// A network after validation.
#[derive(Debug, Clone, Serialize)]
pub struct Network {
    pub id: NetworkId,
    /// Key in the manifest (`default` for the implicit network)
    pub key: String,
    /// Name on the runtime side
    pub name: String,
    pub driver: String,
    pub external: bool,
    pub internal: bool,
}

/// A top-level named volume after validation.
#[derive(Debug, Clone, Serialize)]
pub struct Volume {
    pub id: VolumeId,
    /// Key in the manifest
    pub key: String,
    /// Name on the runtime side
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub external: bool,
}

/// The closed set of services, networks and volumes of one project.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    project: String,
    base_dir: PathBuf,
    services: Vec<Service>,
    networks: Vec<Network>,
    volumes: Vec<Volume>,
}

impl Manifest {
    /// Project name used to scope runtime object names.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Directory relative paths were resolved against.
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Services in declaration order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    pub fn network(&self, id: NetworkId) -> &Network {
        &self.networks[id.0]
    }

    pub fn volume(&self, id: VolumeId) -> &Volume {
        &self.volumes[id.0]
    }

    pub fn service_by_name(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Names of the given services, in the given order.
    pub fn names(&self, ids: &[ServiceId]) -> Vec<String> {
        ids.iter().map(|id| self.service(*id).name.clone()).collect()
    }

    /// Deterministic container name for a service.
    pub fn container_name(&self, id: ServiceId) -> String {
        let service = self.service(id);
        service
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", self.project, service.name))
    }

    /// Whether some service waits for `id` to report healthy.
    pub fn readiness_requires_health(&self, id: ServiceId) -> bool {
        self.services.iter().any(|s| {
            s.depends_on
                .iter()
                .any(|d| d.service == id && d.condition == DependencyCondition::ServiceHealthy)
        })
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Normalize a project name to lowercase `[a-z0-9_-]`.
pub fn normalize_project_name(raw: &str) -> String {
    let name: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let name = name.trim_start_matches(['_', '-']).to_string();
    if name.is_empty() {
        "default".to_string()
    } else {
        name
    }
}
