//! Manifest loading: name resolution and validation.

use super::binding::{parse_port, parse_volume, RawBinding};
use super::env_file::load_env_file;
use super::*;
use crate::compose::{
    BuildSpec, ComposeFile, ComposeParser, HealthcheckDefinition, ServiceDefinition,
};
use crate::error::{ConvoyError, ParseError, ParseErrorKind, Result};
use crate::resolver;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Key of the network services join when they declare none.
const DEFAULT_NETWORK: &str = "default";

impl Manifest {
    /// Load and fully validate a definition.
    ///
    /// Relative paths are resolved against `base_dir`. Fails with a
    /// `ParseError` naming the offending service, volume, network or file;
    /// a dependency cycle is reported as `CyclicDependency`.
    #[instrument(skip(compose, base_dir), fields(project = %project))]
    pub fn load(compose: ComposeFile, base_dir: &Path, project: &str) -> Result<Manifest> {
        let manifest = Self::resolve(compose, base_dir, project)?;

        if let Err(ConvoyError::CycleDetected { participants }) = resolver::order(&manifest) {
            return Err(ParseError::new(
                ParseErrorKind::CyclicDependency,
                participants.join(", "),
                "services depend on each other",
            )
            .into());
        }

        info!(
            services = manifest.services.len(),
            networks = manifest.networks.len(),
            volumes = manifest.volumes.len(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    /// Read a definition file and load it.
    ///
    /// The project name is, in order of preference: `project`, the document's
    /// `name`, the name of the directory holding the file.
    pub fn load_file(path: &Path, project: Option<&str>) -> Result<Manifest> {
        let compose = ComposeParser::parse_file(path)?;

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| ConvoyError::IoError { path: path.to_path_buf(), source: e })?
                .join(path)
        };
        let base_dir = absolute.parent().map(Path::to_path_buf).unwrap_or_else(|| "/".into());

        let project = project
            .map(str::to_string)
            .or_else(|| compose.name.clone())
            .or_else(|| base_dir.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_default();

        Self::load(compose, &base_dir, &normalize_project_name(&project))
    }

    /// Resolve names to arena indices and validate cross references.
    ///
    /// Everything `load` checks except acyclicity, so cyclic definitions can
    /// still be handed to the resolver.
    pub fn resolve(compose: ComposeFile, base_dir: &Path, project: &str) -> Result<Manifest> {
        if let Some(dup) = compose.services.first_duplicate() {
            return Err(parse_err(ParseErrorKind::DuplicateServiceName, dup, "declared twice"));
        }
        if let Some(dup) = compose.volumes.first_duplicate() {
            return Err(parse_err(ParseErrorKind::DuplicateVolume, dup, "declared twice"));
        }
        if let Some(dup) = compose.networks.first_duplicate() {
            return Err(parse_err(ParseErrorKind::DuplicateNetwork, dup, "declared twice"));
        }

        let volumes: Vec<Volume> = compose
            .volumes
            .iter()
            .enumerate()
            .map(|(idx, (key, def))| Volume {
                id: VolumeId(idx),
                key: key.to_string(),
                name: def.name.clone().unwrap_or_else(|| format!("{}_{}", project, key)),
                driver: def.driver.clone().unwrap_or_else(|| "local".to_string()),
                driver_opts: def.driver_opts.clone().into_iter().collect(),
                external: def.external,
            })
            .collect();

        let mut networks: Vec<Network> = compose
            .networks
            .iter()
            .enumerate()
            .map(|(idx, (key, def))| Network {
                id: NetworkId(idx),
                key: key.to_string(),
                name: def.name.clone().unwrap_or_else(|| format!("{}_{}", project, key)),
                driver: def.driver.clone().unwrap_or_else(|| "bridge".to_string()),
                external: def.external,
                internal: def.internal,
            })
            .collect();

        // The implicit default network only exists when some service lands on it
        let needs_default = compose.services.iter().any(|(_, s)| {
            s.networks.as_ref().map(|n| n.attachments().is_empty()).unwrap_or(true)
        });
        if needs_default && !networks.iter().any(|n| n.key == DEFAULT_NETWORK) {
            networks.push(Network {
                id: NetworkId(networks.len()),
                key: DEFAULT_NETWORK.to_string(),
                name: format!("{}_{}", project, DEFAULT_NETWORK),
                driver: "bridge".to_string(),
                external: false,
                internal: false,
            });
        }

        let service_ids: HashMap<&str, ServiceId> = compose
            .services
            .keys()
            .enumerate()
            .map(|(idx, name)| (name, ServiceId(idx)))
            .collect();
        let volume_ids: HashMap<&str, VolumeId> =
            volumes.iter().map(|v| (v.key.as_str(), v.id)).collect();
        let network_ids: HashMap<&str, NetworkId> =
            networks.iter().map(|n| (n.key.as_str(), n.id)).collect();

        let ctx = ResolveContext {
            project,
            base_dir,
            service_ids: &service_ids,
            volume_ids: &volume_ids,
            network_ids: &network_ids,
        };

        let services = compose
            .services
            .iter()
            .enumerate()
            .map(|(idx, (name, def))| ctx.service(ServiceId(idx), name, def))
            .collect::<Result<Vec<_>>>()?;

        debug!(project, services = services.len(), "Resolved manifest references");

        Ok(Manifest {
            project: project.to_string(),
            base_dir: base_dir.to_path_buf(),
            services,
            networks,
            volumes,
        })
    }
}

struct ResolveContext<'a> {
    project: &'a str,
    base_dir: &'a Path,
    service_ids: &'a HashMap<&'a str, ServiceId>,
    volume_ids: &'a HashMap<&'a str, VolumeId>,
    network_ids: &'a HashMap<&'a str, NetworkId>,
}

impl ResolveContext<'_> {
    fn service(&self, id: ServiceId, name: &str, def: &ServiceDefinition) -> Result<Service> {
        let image = self.image_source(name, def)?;

        let ports = def
            .ports
            .iter()
            .map(|p| parse_port(name, p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let volumes = def
            .volumes
            .iter()
            .map(|v| self.volume_binding(name, v))
            .collect::<Result<Vec<_>>>()?;

        let environment = self.environment(def)?;

        let attachments = def.networks.as_ref().map(|n| n.attachments()).unwrap_or_default();
        let networks = if attachments.is_empty() {
            let network = self.network_ids[DEFAULT_NETWORK];
            vec![NetworkAttachment { network, aliases: Vec::new() }]
        } else {
            attachments
                .into_iter()
                .map(|(net, aliases)| match self.network_ids.get(net.as_str()) {
                    Some(network) => Ok(NetworkAttachment { network: *network, aliases }),
                    None => Err(parse_err(
                        ParseErrorKind::UndeclaredNetwork,
                        &net,
                        &format!("used by service '{}' but not declared", name),
                    )),
                })
                .collect::<Result<Vec<_>>>()?
        };

        let mut depends_on: Vec<Dependency> = Vec::new();
        for (dep, condition) in def.depends_on.as_ref().map(|d| d.entries()).unwrap_or_default() {
            let service = self.service_ids.get(dep.as_str()).copied().ok_or_else(|| {
                parse_err(
                    ParseErrorKind::UndeclaredDependency,
                    &dep,
                    &format!("service '{}' depends on it but it is not declared", name),
                )
            })?;
            if !depends_on.iter().any(|d| d.service == service) {
                depends_on.push(Dependency { service, condition });
            }
        }

        let mut labels: BTreeMap<String, String> = def.labels.to_pairs().into_iter().collect();
        labels.insert(LABEL_PROJECT.to_string(), self.project.to_string());
        labels.insert(LABEL_SERVICE.to_string(), name.to_string());

        Ok(Service {
            id,
            name: name.to_string(),
            image,
            ports,
            volumes,
            environment,
            networks,
            depends_on,
            stdin_open: def.stdin_open,
            tty: def.tty,
            command: def.command.as_ref().map(|c| c.to_args()),
            entrypoint: def.entrypoint.as_ref().map(|e| e.to_args()),
            working_dir: def.working_dir.clone(),
            user: def.user.clone(),
            container_name: def.container_name.clone(),
            restart: def.restart.clone(),
            labels,
            healthcheck: def.healthcheck.as_ref().and_then(convert_healthcheck),
        })
    }

    fn image_source(&self, name: &str, def: &ServiceDefinition) -> Result<ImageSource> {
        let image = def.image.as_deref().map(str::trim).filter(|i| !i.is_empty());

        match (&def.build, image) {
            (Some(build), image) => {
                let (context, dockerfile, args, target) = match build {
                    BuildSpec::Path(path) => (path.clone(), None, BTreeMap::new(), None),
                    BuildSpec::Full(cfg) => (
                        cfg.context.clone(),
                        cfg.dockerfile.clone(),
                        cfg.args.to_pairs().into_iter().collect(),
                        cfg.target.clone(),
                    ),
                };
                let tag = image
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}-{}:latest", self.project, name));
                Ok(ImageSource::Build {
                    context: self.host_path(&context),
                    dockerfile,
                    args,
                    target,
                    tag,
                })
            }
            (None, Some(reference)) => Ok(ImageSource::Pull { reference: reference.to_string() }),
            (None, None) => Err(parse_err(
                ParseErrorKind::MissingImage,
                name,
                "service must declare `image` or `build`",
            )),
        }
    }

    fn volume_binding(
        &self,
        service: &str,
        spec: &crate::compose::VolumeSpec,
    ) -> Result<VolumeBinding> {
        match parse_volume(service, spec)? {
            RawBinding::Anonymous { target } => {
                Ok(VolumeBinding { kind: VolumeKind::Anonymous, target, mode: MountMode::Rw })
            }
            RawBinding::Named { name, target, mode } => match self.volume_ids.get(name.as_str()) {
                Some(id) => Ok(VolumeBinding { kind: VolumeKind::Named(*id), target, mode }),
                None => Err(parse_err(
                    ParseErrorKind::UndeclaredVolume,
                    &name,
                    &format!("used by service '{}' but not declared", service),
                )),
            },
            RawBinding::Bind { source, target, mode } => {
                let path = self.host_path(&source);
                if !is_creatable(&path) {
                    return Err(parse_err(
                        ParseErrorKind::InvalidBindSource,
                        service,
                        &format!("bind source {} does not exist and cannot be created", path.display()),
                    ));
                }
                Ok(VolumeBinding { kind: VolumeKind::Bind(path), target, mode })
            }
        }
    }

    /// Env files in order, then inline entries on top.
    fn environment(&self, def: &ServiceDefinition) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        for file in def.env_file.as_ref().map(|f| f.to_vec()).unwrap_or_default() {
            env.extend(load_env_file(&self.host_path(&file))?);
        }
        env.extend(def.environment.to_pairs());
        Ok(env)
    }

    /// Absolute host path: `~` expanded, relative paths joined to the base dir.
    fn host_path(&self, raw: &str) -> PathBuf {
        let expanded = match raw.strip_prefix('~') {
            Some(rest) => match dirs::home_dir() {
                Some(home) => home.join(rest.trim_start_matches('/')),
                None => PathBuf::from(raw),
            },
            None => PathBuf::from(raw),
        };
        let joined =
            if expanded.is_absolute() { expanded } else { self.base_dir.join(expanded) };
        lexical_normalize(&joined)
    }
}

fn convert_healthcheck(def: &HealthcheckDefinition) -> Option<Healthcheck> {
    if def.disable {
        return None;
    }
    let test = match def.test.as_ref()? {
        crate::compose::StringOrList::Single(cmd) => vec!["CMD-SHELL".to_string(), cmd.clone()],
        crate::compose::StringOrList::List(list) => list.clone(),
    };
    if test.first().map(String::as_str) == Some("NONE") {
        return None;
    }
    Some(Healthcheck {
        test,
        interval: def.interval.clone(),
        timeout: def.timeout.clone(),
        retries: def.retries,
        start_period: def.start_period.clone(),
    })
}

/// A path exists, or its nearest existing ancestor is a directory.
fn is_creatable(path: &Path) -> bool {
    path.ancestors().find(|p| p.exists()).map(|p| p == path || p.is_dir()).unwrap_or(false)
}

/// Drop `.` and fold `..` without touching the file system.
fn lexical_normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn parse_err(kind: ParseErrorKind, name: &str, detail: &str) -> ConvoyError {
    ParseError::new(kind, name, detail).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::OrderedMap;
    use tempfile::TempDir;

    fn load(yaml: &str, dir: &Path) -> Result<Manifest> {
        Manifest::load(ComposeParser::parse(yaml)?, dir, "demo")
    }

    fn parse_kind(result: Result<Manifest>) -> (ParseErrorKind, String) {
        match result {
            Err(ConvoyError::Parse(e)) => (e.kind, e.name),
            other => panic!("expected parse error, got {:?}", other.map(|m| m.project)),
        }
    }

    #[test]
    fn test_load_three_tier_manifest() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("frontend/src")).unwrap();
        std::fs::create_dir_all(dir.path().join("backend")).unwrap();
        std::fs::write(dir.path().join("backend/.env"), "PORT=5000\nMONGO_URI=mongodb://x\n")
            .unwrap();

        let manifest = load(
            r#"
services:
  mongodb:
    image: mongo:7
    volumes: ["mongo-data:/data/db"]
  backend:
    build: ./backend
    env_file: ./backend/.env
    environment:
      MONGO_URI: mongodb://mongodb:27017/app
    depends_on: [mongodb]
  frontend:
    build: ./frontend
    image: mern-frontend:dev
    volumes: ["./frontend/src:/app/src", "/app/node_modules"]
    depends_on: [backend]
volumes:
  mongo-data:
"#,
            dir.path(),
        )
        .unwrap();

        assert_eq!(manifest.project(), "demo");
        assert_eq!(manifest.services().len(), 3);
        assert_eq!(manifest.networks().len(), 1);
        assert_eq!(manifest.networks()[0].name, "demo_default");
        assert_eq!(manifest.volumes()[0].name, "demo_mongo-data");

        let backend = manifest.service_by_name("backend").unwrap();
        assert_eq!(backend.image.tag(), "demo-backend:latest");
        assert_eq!(backend.environment["PORT"], "5000");
        // Inline entries override the env file
        assert_eq!(backend.environment["MONGO_URI"], "mongodb://mongodb:27017/app");
        assert_eq!(backend.depends_on[0].service, manifest.service_by_name("mongodb").unwrap().id);

        let frontend = manifest.service_by_name("frontend").unwrap();
        assert_eq!(frontend.image.tag(), "mern-frontend:dev");
        assert_eq!(frontend.volumes[0].kind, VolumeKind::Bind(dir.path().join("frontend/src")));
        assert_eq!(frontend.volumes[1].kind, VolumeKind::Anonymous);
        assert_eq!(manifest.container_name(frontend.id), "demo-frontend-1");
    }

    #[test]
    fn test_undeclared_dependency() {
        let dir = TempDir::new().unwrap();
        let (kind, name) = parse_kind(load(
            "services:\n  web:\n    image: nginx\n    depends_on: [api]\n",
            dir.path(),
        ));
        assert_eq!(kind, ParseErrorKind::UndeclaredDependency);
        assert_eq!(name, "api");
    }

    #[test]
    fn test_undeclared_volume() {
        let dir = TempDir::new().unwrap();
        let (kind, name) = parse_kind(load(
            "services:\n  db:\n    image: mongo\n    volumes: [\"data:/data/db\"]\n",
            dir.path(),
        ));
        assert_eq!(kind, ParseErrorKind::UndeclaredVolume);
        assert_eq!(name, "data");
    }

    #[test]
    fn test_undeclared_network() {
        let dir = TempDir::new().unwrap();
        let (kind, name) = parse_kind(load(
            "services:\n  db:\n    image: mongo\n    networks: [backend]\n",
            dir.path(),
        ));
        assert_eq!(kind, ParseErrorKind::UndeclaredNetwork);
        assert_eq!(name, "backend");
    }

    #[test]
    fn test_cyclic_dependency() {
        let dir = TempDir::new().unwrap();
        let (kind, name) = parse_kind(load(
            "services:\n  backend:\n    image: a\n    depends_on: [frontend]\n  frontend:\n    image: b\n    depends_on: [backend]\n",
            dir.path(),
        ));
        assert_eq!(kind, ParseErrorKind::CyclicDependency);
        assert_eq!(name, "backend, frontend");
    }

    #[test]
    fn test_duplicate_service_name() {
        let dir = TempDir::new().unwrap();
        let mut services = OrderedMap::new();
        for _ in 0..2 {
            services.insert(
                "web",
                ServiceDefinition { image: Some("nginx".into()), ..Default::default() },
            );
        }
        let compose = ComposeFile { services, ..Default::default() };
        let (kind, name) = parse_kind(Manifest::load(compose, dir.path(), "demo"));
        assert_eq!(kind, ParseErrorKind::DuplicateServiceName);
        assert_eq!(name, "web");
    }

    #[test]
    fn test_bind_source_must_be_creatable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file"), "x").unwrap();

        // Missing path under an existing directory is fine
        load("services:\n  web:\n    image: nginx\n    volumes: [\"./new/dir:/srv\"]\n", dir.path())
            .unwrap();

        // A regular file in the way is not
        let (kind, name) = parse_kind(load(
            "services:\n  web:\n    image: nginx\n    volumes: [\"./file/sub:/srv\"]\n",
            dir.path(),
        ));
        assert_eq!(kind, ParseErrorKind::InvalidBindSource);
        assert_eq!(name, "web");
    }

    #[test]
    fn test_missing_env_file() {
        let dir = TempDir::new().unwrap();
        let (kind, _) = parse_kind(load(
            "services:\n  api:\n    image: node\n    env_file: [missing.env]\n",
            dir.path(),
        ));
        assert_eq!(kind, ParseErrorKind::EnvFile);
    }

    #[test]
    fn test_explicit_networks_skip_default() {
        let dir = TempDir::new().unwrap();
        let manifest = load(
            "services:\n  api:\n    image: node\n    networks:\n      mern:\n        aliases: [server]\nnetworks:\n  mern:\n",
            dir.path(),
        )
        .unwrap();
        assert_eq!(manifest.networks().len(), 1);
        let api = manifest.service_by_name("api").unwrap();
        assert_eq!(manifest.network(api.networks[0].network).name, "demo_mern");
        assert_eq!(api.networks[0].aliases, vec!["server".to_string()]);
    }

    #[test]
    fn test_healthcheck_conversion() {
        let dir = TempDir::new().unwrap();
        let manifest = load(
            "services:\n  db:\n    image: mongo\n    healthcheck:\n      test: mongosh --eval 'db.ping'\n      interval: 5s\n      retries: 3\n",
            dir.path(),
        )
        .unwrap();
        let hc = manifest.services()[0].healthcheck.as_ref().unwrap();
        assert_eq!(hc.test[0], "CMD-SHELL");
        assert_eq!(hc.interval.as_deref(), Some("5s"));
        assert_eq!(hc.retries, Some(3));
    }

    #[test]
    fn test_lexical_normalize() {
        assert_eq!(lexical_normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }
}
