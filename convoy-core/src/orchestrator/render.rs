//! Resolved manifest rendering for `convoy config`.

use crate::compose::{DependencyCondition, OrderedMap};
use crate::error::{ConvoyError, Result};
use crate::manifest::{ImageSource, Manifest, VolumeKind};
use crate::resolver::StartupPlan;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct ConfigView<'a> {
    name: &'a str,
    services: OrderedMap<ServiceView<'a>>,
    #[serde(skip_serializing_if = "OrderedMap::is_empty")]
    networks: OrderedMap<NetworkView<'a>>,
    #[serde(skip_serializing_if = "OrderedMap::is_empty")]
    volumes: OrderedMap<VolumeView<'a>>,
}

#[derive(Serialize)]
struct ServiceView<'a> {
    container_name: String,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    build: Option<BuildView<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entrypoint: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a [String]>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    depends_on: BTreeMap<&'a str, DependencyCondition>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    networks: Vec<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stdin_open: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    tty: bool,
}

#[derive(Serialize)]
struct BuildView<'a> {
    context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dockerfile: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
}

#[derive(Serialize)]
struct NetworkView<'a> {
    name: &'a str,
    driver: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    external: bool,
}

#[derive(Serialize)]
struct VolumeView<'a> {
    name: &'a str,
    driver: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    external: bool,
}

/// Render the resolved manifest as YAML, services in startup order.
pub fn render(manifest: &Manifest, plan: &StartupPlan) -> Result<String> {
    let mut services = OrderedMap::new();
    for id in plan.services() {
        let service = manifest.service(id);

        let build = match &service.image {
            ImageSource::Build { context, dockerfile, target, .. } => Some(BuildView {
                context: context.display().to_string(),
                dockerfile: dockerfile.as_deref(),
                target: target.as_deref(),
            }),
            ImageSource::Pull { .. } => None,
        };

        let volumes = service
            .volumes
            .iter()
            .map(|binding| match &binding.kind {
                VolumeKind::Named(volume) => {
                    format!("{}:{}:{}", manifest.volume(*volume).name, binding.target, binding.mode)
                }
                VolumeKind::Bind(path) => {
                    format!("{}:{}:{}", path.display(), binding.target, binding.mode)
                }
                VolumeKind::Anonymous => binding.target.clone(),
            })
            .collect();

        services.insert(
            service.name.clone(),
            ServiceView {
                container_name: manifest.container_name(id),
                image: service.image.tag(),
                build,
                entrypoint: service.entrypoint.as_deref(),
                command: service.command.as_deref(),
                depends_on: service
                    .depends_on
                    .iter()
                    .map(|d| (manifest.service(d.service).name.as_str(), d.condition))
                    .collect(),
                environment: &service.environment,
                ports: service.ports.iter().map(ToString::to_string).collect(),
                volumes,
                networks: service
                    .networks
                    .iter()
                    .map(|a| manifest.network(a.network).name.as_str())
                    .collect(),
                stdin_open: service.stdin_open,
                tty: service.tty,
            },
        );
    }

    let networks = manifest
        .networks()
        .iter()
        .map(|n| {
            (n.key.clone(), NetworkView { name: &n.name, driver: &n.driver, external: n.external })
        })
        .collect();
    let volumes = manifest
        .volumes()
        .iter()
        .map(|v| {
            (v.key.clone(), VolumeView { name: &v.name, driver: &v.driver, external: v.external })
        })
        .collect();

    let view = ConfigView { name: manifest.project(), services, networks, volumes };
    serde_yaml::to_string(&view)
        .map_err(|e| ConvoyError::Internal(format!("failed to render manifest: {}", e)))
}
