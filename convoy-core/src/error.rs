//! Error types for convoy.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Structural errors (`Parse`, `CycleDetected`) are raised before the runtime is
//! ever touched; per-service errors are collected into `PartialFailure`.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::lifecycle::ServiceState;

/// Result type alias for convoy operations.
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Main error type for convoy.
#[derive(Error, Debug)]
pub enum ConvoyError {
    // Structural errors (no side effects happened)
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("Dependency cycle detected between services: {}", participants.join(", "))]
    CycleDetected { participants: Vec<String> },

    // Resource errors
    #[error("Failed to provision {resource} '{name}': {reason}")]
    Provisioning { resource: ResourceKind, name: String, reason: String },

    // Per-service errors
    #[error("Failed to create container for service '{service}': {reason}")]
    Creation { service: String, reason: String },

    #[error("Service '{service}' failed while {state}: {reason}")]
    Runtime { service: String, state: ServiceState, reason: String },

    #[error("Service '{service}' did not stop within {grace_secs}s and was killed")]
    Timeout { service: String, grace_secs: u64 },

    #[error("{} service(s) failed: {}", failures.len(), summarize(failures))]
    PartialFailure { failures: Vec<ServiceFailure> },

    #[error("Operation cancelled by interrupt")]
    Cancelled,

    // Runtime collaborator errors (raw, before being attributed to a service)
    #[error("Container runtime error: {0}")]
    RuntimeCall(String),

    #[error("Container runtime binary '{binary}' could not be executed: {source}")]
    RuntimeUnavailable {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvoyError {
    /// Attribute this error to a service for an aggregate report.
    ///
    /// `fallback` is used when the error does not carry a lifecycle state.
    pub fn service_failure(&self, service: &str, fallback: ServiceState) -> ServiceFailure {
        let (state, reason) = match self {
            Self::Creation { reason, .. } => (ServiceState::Pending, reason.clone()),
            Self::Runtime { state, reason, .. } => (*state, reason.clone()),
            other => (fallback, other.to_string()),
        };
        ServiceFailure { service: service.to_string(), state, reason }
    }

    /// Process exit code for this error class.
    ///
    /// `0` is reserved for success and `1` for anything not listed here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(e) if e.kind == ParseErrorKind::CyclicDependency => 3,
            Self::Parse(_) => 2,
            Self::CycleDetected { .. } => 3,
            Self::Provisioning { .. } => 4,
            Self::PartialFailure { .. } | Self::Creation { .. } | Self::Runtime { .. } => 5,
            Self::Cancelled => 6,
            _ => 1,
        }
    }
}

/// Kind of shared resource handled by the provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Network,
    Volume,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Volume => write!(f, "volume"),
        }
    }
}

/// Manifest validation error.
///
/// Always names the offending service, volume, network or file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid manifest ({kind}): {name}: {detail}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub name: String,
    pub detail: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { kind, name: name.into(), detail: detail.into() }
    }
}

/// Classification of manifest errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The document is not valid YAML or has the wrong shape.
    Syntax,
    /// The document declares no services.
    NoServices,
    /// A service is declared more than once.
    DuplicateServiceName,
    /// A top-level volume is declared more than once.
    DuplicateVolume,
    /// A top-level network is declared more than once.
    DuplicateNetwork,
    /// `depends_on` references an unknown service.
    UndeclaredDependency,
    /// A named volume is used but not declared.
    UndeclaredVolume,
    /// A network is used but not declared.
    UndeclaredNetwork,
    /// The depends-on graph has a cycle.
    CyclicDependency,
    /// Neither `image` nor `build` is set.
    MissingImage,
    /// A port mapping cannot be parsed.
    InvalidPort,
    /// A volume binding cannot be parsed.
    InvalidVolume,
    /// A bind-mount source neither exists nor can be created.
    InvalidBindSource,
    /// An env file is missing or malformed.
    EnvFile,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::Syntax => "syntax",
            ParseErrorKind::NoServices => "no services",
            ParseErrorKind::DuplicateServiceName => "duplicate service name",
            ParseErrorKind::DuplicateVolume => "duplicate volume",
            ParseErrorKind::DuplicateNetwork => "duplicate network",
            ParseErrorKind::UndeclaredDependency => "undeclared dependency",
            ParseErrorKind::UndeclaredVolume => "undeclared volume",
            ParseErrorKind::UndeclaredNetwork => "undeclared network",
            ParseErrorKind::CyclicDependency => "cyclic dependency",
            ParseErrorKind::MissingImage => "missing image",
            ParseErrorKind::InvalidPort => "invalid port",
            ParseErrorKind::InvalidVolume => "invalid volume",
            ParseErrorKind::InvalidBindSource => "invalid bind source",
            ParseErrorKind::EnvFile => "env file",
        };
        f.write_str(s)
    }
}

/// One entry of an aggregate failure report.
#[derive(Debug, Clone)]
pub struct ServiceFailure {
    /// Service that failed.
    pub service: String,
    /// Lifecycle state the service was in when it failed.
    pub state: ServiceState,
    /// Human-readable cause.
    pub reason: String,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.service, self.state, self.reason)
    }
}

fn summarize(failures: &[ServiceFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
