//! Compose definition format types.
//!
//! Raw document shapes, accepted in both the short and long forms of the
//! Compose file format. Keys convoy does not understand are ignored.

use super::ordered::OrderedMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Root structure of a compose document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Compose file format version (informational only)
    #[serde(default)]
    pub version: Option<String>,

    /// Project name declared in the document
    #[serde(default)]
    pub name: Option<String>,

    /// Services to be created, in declaration order
    #[serde(default)]
    pub services: OrderedMap<ServiceDefinition>,

    /// Named volumes
    #[serde(default)]
    pub volumes: OrderedMap<VolumeDefinition>,

    /// Networks
    #[serde(default)]
    pub networks: OrderedMap<NetworkDefinition>,
}

/// A service in a compose document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Image reference to run (or the tag to give a built image)
    #[serde(default)]
    pub image: Option<String>,

    /// Build context for the image
    #[serde(default)]
    pub build: Option<BuildSpec>,

    /// Port mappings (e.g., ["8080:80", "127.0.0.1:5432:5432/tcp"])
    #[serde(default)]
    pub ports: Vec<PortSpec>,

    /// Volume bindings (e.g., ["./data:/data", "db:/var/lib/db:ro", "/tmp/cache"])
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    /// Inline environment variables
    #[serde(default)]
    pub environment: Environment,

    /// Environment files, applied before `environment`
    #[serde(default)]
    pub env_file: Option<StringOrList>,

    /// Networks to connect to
    #[serde(default)]
    pub networks: Option<ServiceNetworks>,

    /// Services this service depends on
    #[serde(default)]
    pub depends_on: Option<DependsOn>,

    /// Keep stdin open (`docker run -i`)
    #[serde(default)]
    pub stdin_open: bool,

    /// Allocate a pseudo-TTY (`docker run -t`)
    #[serde(default)]
    pub tty: bool,

    /// Override the default command
    #[serde(default)]
    pub command: Option<StringOrList>,

    /// Override the default entrypoint
    #[serde(default)]
    pub entrypoint: Option<StringOrList>,

    /// Working directory inside the container
    #[serde(default)]
    pub working_dir: Option<String>,

    /// User to run as
    #[serde(default)]
    pub user: Option<String>,

    /// Fixed container name instead of `{project}-{service}-1`
    #[serde(default)]
    pub container_name: Option<String>,

    /// Restart policy, passed through to the runtime
    #[serde(default)]
    pub restart: Option<String>,

    /// Metadata labels
    #[serde(default)]
    pub labels: Environment,

    /// Health check run by the runtime
    #[serde(default)]
    pub healthcheck: Option<HealthcheckDefinition>,
}

/// A value that may be written as a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    List(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s.clone()],
            StringOrList::List(list) => list.clone(),
        }
    }

    /// Split a shell-style command into words, honouring simple quotes.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => split_command(s),
            StringOrList::List(list) => list.clone(),
        }
    }
}

/// Build configuration can be a bare context path or a full block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildSpec {
    /// `build: ./backend`
    Path(String),
    /// `build: { context: ./backend, dockerfile: Dockerfile.dev }`
    Full(BuildConfig),
}

/// Full build configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build context directory
    #[serde(default = "default_context")]
    pub context: String,

    /// Dockerfile path relative to the context
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Build arguments
    #[serde(default)]
    pub args: Environment,

    /// Target stage
    #[serde(default)]
    pub target: Option<String>,
}

fn default_context() -> String {
    ".".to_string()
}

/// Port mapping in short, numeric or long form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// `- 3000`
    Number(u32),
    /// `- "8080:80/tcp"`
    Short(String),
    /// `- { target: 80, published: 8080, protocol: tcp }`
    Long(LongPort),
}

/// Long-form port mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPort {
    pub target: u16,
    #[serde(default)]
    pub published: Option<PortNumber>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
}

/// Published port written as a number or a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortNumber {
    Number(u16),
    Text(String),
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Number(n) => write!(f, "{}", n),
            PortSpec::Short(s) => f.write_str(s),
            PortSpec::Long(l) => match &l.published {
                Some(PortNumber::Number(p)) => write!(f, "{}:{}", p, l.target),
                Some(PortNumber::Text(p)) => write!(f, "{}:{}", p, l.target),
                None => write!(f, "{}", l.target),
            },
        }
    }
}

/// Volume binding in short or long form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeSpec {
    /// `- db-data:/data/db`
    Short(String),
    /// `- { type: bind, source: ./src, target: /app/src, read_only: true }`
    Long(LongVolume),
}

/// Long-form volume binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongVolume {
    /// `volume`, `bind` (anything else is rejected at load)
    #[serde(rename = "type", default = "default_volume_type")]
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_volume_type() -> String {
    "volume".to_string()
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeSpec::Short(s) => f.write_str(s),
            VolumeSpec::Long(l) => match &l.source {
                Some(src) => write!(f, "{}:{}", src, l.target),
                None => f.write_str(&l.target),
            },
        }
    }
}

/// Environment variables can be specified as a map or list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    /// Environment as key-value map
    Map(OrderedMap<Option<EnvValue>>),
    /// Environment as list of KEY=value strings
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(OrderedMap::new())
    }
}

impl Environment {
    /// Flatten into ordered `(key, value)` pairs.
    ///
    /// Entries without a value (`KEY` or `KEY:`) take the value from the
    /// calling process environment and are dropped when it is unset there.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        match self {
            Environment::Map(map) => map
                .iter()
                .filter_map(|(k, v)| match v {
                    Some(v) => Some((k.to_string(), v.to_string())),
                    None => std::env::var(k).ok().map(|v| (k.to_string(), v)),
                })
                .collect(),
            Environment::List(list) => list
                .iter()
                .filter_map(|s| match s.split_once('=') {
                    Some((k, v)) => Some((k.to_string(), v.to_string())),
                    None => std::env::var(s).ok().map(|v| (s.clone(), v)),
                })
                .collect(),
        }
    }

    /// Convert to a map; later keys win.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.to_pairs().into_iter().collect()
    }
}

/// Scalar environment value (YAML lets `DEBUG: false` through unquoted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    String(String),
    Bool(bool),
    Integer(i64),
    Float(f64),
}

impl Default for EnvValue {
    fn default() -> Self {
        EnvValue::String(String::new())
    }
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::String(s) => f.write_str(s),
            EnvValue::Bool(b) => write!(f, "{}", b),
            EnvValue::Integer(i) => write!(f, "{}", i),
            EnvValue::Float(x) => write!(f, "{}", x),
        }
    }
}

/// Service network memberships in list or map form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(OrderedMap<ServiceNetworkAttachment>),
}

impl ServiceNetworks {
    /// `(network, extra aliases)` in declaration order.
    pub fn attachments(&self) -> Vec<(String, Vec<String>)> {
        match self {
            ServiceNetworks::List(list) => list.iter().map(|n| (n.clone(), Vec::new())).collect(),
            ServiceNetworks::Map(map) => {
                map.iter().map(|(n, a)| (n.to_string(), a.aliases.clone())).collect()
            }
        }
    }
}

/// Per-network attachment options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkAttachment {
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// `depends_on` in list or map form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(OrderedMap<DependencyDefinition>),
}

impl DependsOn {
    /// `(service, condition)` in declaration order.
    pub fn entries(&self) -> Vec<(String, DependencyCondition)> {
        match self {
            DependsOn::List(list) => {
                list.iter().map(|s| (s.clone(), DependencyCondition::ServiceStarted)).collect()
            }
            DependsOn::Map(map) => map.iter().map(|(s, d)| (s.to_string(), d.condition)).collect(),
        }
    }
}

/// Long-form dependency entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyDefinition {
    #[serde(default)]
    pub condition: DependencyCondition,
}

/// When a dependency counts as ready for its dependents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Dependency reached `running`.
    #[default]
    ServiceStarted,
    /// Dependency reported healthy by its health check.
    ServiceHealthy,
}

/// Health check definition (durations are passed to the runtime verbatim).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckDefinition {
    #[serde(default)]
    pub test: Option<StringOrList>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub start_period: Option<String>,
    #[serde(default)]
    pub disable: bool,
}

/// Volume definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDefinition {
    /// Volume driver to use
    #[serde(default)]
    pub driver: Option<String>,

    /// Driver-specific options
    #[serde(default)]
    pub driver_opts: HashMap<String, String>,

    /// Volume is managed outside this project
    #[serde(default)]
    pub external: bool,

    /// Runtime-side name overriding `{project}_{key}`
    #[serde(default)]
    pub name: Option<String>,
}

/// Network definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Network driver to use
    #[serde(default)]
    pub driver: Option<String>,

    /// Network is managed outside this project
    #[serde(default)]
    pub external: bool,

    /// Runtime-side name overriding `{project}_{key}`
    #[serde(default)]
    pub name: Option<String>,

    /// Restrict external access
    #[serde(default)]
    pub internal: bool,
}

/// Split a command string on whitespace, keeping quoted sections together.
fn split_command(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in s.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}
