//! Port and volume binding parsing.
//!
//! Short forms follow the Compose conventions:
//! - ports: `"GUEST"`, `"HOST:GUEST"`, `"IP:HOST:GUEST"`, each with an optional `/tcp|/udp`
//! - volumes: `"TARGET"` (anonymous), `"SOURCE:TARGET"`, `"SOURCE:TARGET:MODE"`

use crate::compose::{LongPort, PortNumber, PortSpec, VolumeSpec};
use crate::error::{ParseError, ParseErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Port mapping (host:container).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface to bind, all interfaces when unset
    pub host_ip: Option<String>,

    /// Host port
    pub host_port: u16,

    /// Container port
    pub container_port: u16,

    /// Protocol (tcp, udp)
    pub protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        write!(f, "{}:{}/{}", self.host_port, self.container_port, self.protocol)
    }
}

/// Network protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Mount access mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[default]
    Rw,
    Ro,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountMode::Rw => write!(f, "rw"),
            MountMode::Ro => write!(f, "ro"),
        }
    }
}

/// Volume binding before names are resolved against the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawBinding {
    /// Named volume key
    Named { name: String, target: String, mode: MountMode },
    /// Host path, unresolved
    Bind { source: String, target: String, mode: MountMode },
    /// Ephemeral, owned by the container
    Anonymous { target: String },
}

/// Parse one port entry of a service.
pub(crate) fn parse_port(service: &str, spec: &PortSpec) -> Result<PortMapping, ParseError> {
    let invalid = |detail: String| ParseError::new(ParseErrorKind::InvalidPort, service, detail);

    match spec {
        PortSpec::Number(n) => {
            let port = u16::try_from(*n)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid(format!("port {} out of range", n)))?;
            Ok(PortMapping {
                host_ip: None,
                host_port: port,
                container_port: port,
                protocol: Protocol::Tcp,
            })
        }
        PortSpec::Long(long) => parse_long_port(long).map_err(invalid),
        PortSpec::Short(s) => parse_short_port(s).map_err(invalid),
    }
}

fn parse_long_port(long: &LongPort) -> Result<PortMapping, String> {
    let protocol = parse_protocol(long.protocol.as_deref().unwrap_or("tcp"))?;
    let host_port = match &long.published {
        None => long.target,
        Some(PortNumber::Number(p)) => *p,
        Some(PortNumber::Text(p)) => parse_port_number(p)?,
    };
    Ok(PortMapping {
        host_ip: long.host_ip.clone(),
        host_port,
        container_port: long.target,
        protocol,
    })
}

fn parse_short_port(spec: &str) -> Result<PortMapping, String> {
    let (mapping, protocol) = match spec.rsplit_once('/') {
        Some((mapping, proto)) => (mapping, parse_protocol(proto)?),
        None => (spec, Protocol::Tcp),
    };

    // IPv6 host addresses are written in brackets: "[::1]:8080:80"
    let (host_ip, rest) = match mapping.strip_prefix('[') {
        Some(bracketed) => {
            let (ip, rest) = bracketed
                .split_once("]:")
                .ok_or_else(|| format!("invalid IPv6 port spec '{}'", spec))?;
            (Some(ip.to_string()), rest)
        }
        None => (None, mapping),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    let (host_ip, host, guest) = match (host_ip, parts.as_slice()) {
        (None, [guest]) => (None, *guest, *guest),
        (ip, [host, guest]) => (ip, *host, *guest),
        (None, [ip, host, guest]) => (Some(ip.to_string()), *host, *guest),
        _ => return Err(format!("invalid port spec '{}'", spec)),
    };

    let container_port = parse_port_number(guest)?;
    // "127.0.0.1::80" leaves the host side empty: publish on the same port
    let host_port = if host.is_empty() { container_port } else { parse_port_number(host)? };

    Ok(PortMapping { host_ip, host_port, container_port, protocol })
}

fn parse_port_number(s: &str) -> Result<u16, String> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port number '{}'", s)),
        Ok(p) => Ok(p),
    }
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    match s.to_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(format!("unsupported protocol '{}'", other)),
    }
}

/// Parse one volume entry of a service.
pub(crate) fn parse_volume(service: &str, spec: &VolumeSpec) -> Result<RawBinding, ParseError> {
    let invalid = |detail: String| ParseError::new(ParseErrorKind::InvalidVolume, service, detail);

    match spec {
        VolumeSpec::Short(s) => parse_short_volume(s).map_err(invalid),
        VolumeSpec::Long(long) => {
            let mode = if long.read_only { MountMode::Ro } else { MountMode::Rw };
            let target = long.target.clone();
            if !target.starts_with('/') {
                return Err(invalid(format!("mount target '{}' must be absolute", target)));
            }
            match (long.kind.as_str(), long.source.as_deref()) {
                ("volume", None) | ("volume", Some("")) => Ok(RawBinding::Anonymous { target }),
                ("volume", Some(name)) => {
                    Ok(RawBinding::Named { name: name.to_string(), target, mode })
                }
                ("bind", Some(source)) if !source.is_empty() => {
                    Ok(RawBinding::Bind { source: source.to_string(), target, mode })
                }
                ("bind", _) => Err(invalid(format!("bind mount for '{}' has no source", target))),
                (other, _) => Err(invalid(format!("unsupported volume type '{}'", other))),
            }
        }
    }
}

fn parse_short_volume(spec: &str) -> Result<RawBinding, String> {
    let parts: Vec<&str> = spec.split(':').collect();

    let (source, target, mode) = match parts.as_slice() {
        [target] => return anonymous(target, spec),
        [source, target] => (*source, *target, MountMode::Rw),
        [source, target, options] => (*source, *target, parse_mode(options)),
        _ => return Err(format!("invalid volume spec '{}'", spec)),
    };

    if source.is_empty() {
        return anonymous(target, spec);
    }
    if !target.starts_with('/') {
        return Err(format!("mount target '{}' must be absolute", target));
    }

    let target = target.to_string();
    if is_host_path(source) {
        Ok(RawBinding::Bind { source: source.to_string(), target, mode })
    } else {
        Ok(RawBinding::Named { name: source.to_string(), target, mode })
    }
}

fn anonymous(target: &str, spec: &str) -> Result<RawBinding, String> {
    if target.starts_with('/') {
        Ok(RawBinding::Anonymous { target: target.to_string() })
    } else {
        Err(format!("invalid volume spec '{}'", spec))
    }
}

/// Mode options are comma separated (`ro,z`); anything but `ro` is left to the runtime.
fn parse_mode(options: &str) -> MountMode {
    if options.split(',').any(|o| o == "ro") {
        MountMode::Ro
    } else {
        MountMode::Rw
    }
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}
