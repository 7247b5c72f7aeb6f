//! `docker` command-line binding.
//!
//! Every operation shells out to a docker-compatible client (`docker`,
//! `podman`, ...) through `tokio::process` and parses its JSON output.

use super::*;
use crate::error::ConvoyError;
use serde::Deserialize;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Runtime backed by a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    /// Create a runtime that invokes `binary` (looked up on `PATH`).
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Run the client and return its raw output, successful or not.
    async fn output(&self, args: &[String]) -> Result<Output> {
        debug!(binary = %self.binary, args = ?args, "Invoking runtime client");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ConvoyError::RuntimeUnavailable { binary: self.binary.clone(), source: e })
    }

    /// Run the client and return trimmed stdout, failing on a non-zero exit.
    async fn run(&self, args: Vec<String>) -> Result<String> {
        let output = self.output(&args).await?;
        if !output.status.success() {
            return Err(command_error(&args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run an `inspect`-style command. `None` when the object does not exist.
    async fn inspect<T: for<'de> Deserialize<'de>>(&self, args: Vec<String>) -> Result<Option<T>> {
        let output = self.output(&args).await?;
        if !output.status.success() {
            if is_not_found(&output) {
                return Ok(None);
            }
            return Err(command_error(&args, &output));
        }

        let mut items: Vec<T> = serde_json::from_slice(&output.stdout).map_err(|e| {
            ConvoyError::RuntimeCall(format!("unexpected output from {} {}: {}", self.binary, args[0], e))
        })?;
        Ok(if items.is_empty() { None } else { Some(items.swap_remove(0)) })
    }

    /// Run a removal command, treating a missing object as success.
    async fn remove_quietly(&self, args: Vec<String>) -> Result<()> {
        let output = self.output(&args).await?;
        if output.status.success() || is_not_found(&output) {
            return Ok(());
        }
        Err(command_error(&args, &output))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    #[instrument(skip(self, spec), fields(container = %spec.name))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let id = ContainerId::new(self.run(create_args(spec)).await?);

        // The client only accepts one network at creation time
        for endpoint in spec.networks.iter().skip(1) {
            let mut cmd = args(["network", "connect"]);
            for alias in &endpoint.aliases {
                cmd.extend(["--alias".to_string(), alias.clone()]);
            }
            cmd.extend([endpoint.network.clone(), id.0.clone()]);
            self.run(cmd).await?;
        }

        debug!(id = %id, "Container created");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.run(args(["start", id.as_str()])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        self.run(args(["stop", "-t", secs.as_str(), id.as_str()])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn kill(&self, id: &ContainerId) -> Result<()> {
        self.run(args(["kill", id.as_str()])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove(&self, id: &ContainerId, remove_anonymous_volumes: bool) -> Result<()> {
        let mut cmd = args(["rm", "-f"]);
        if remove_anonymous_volumes {
            cmd.push("-v".to_string());
        }
        cmd.push(id.0.clone());
        self.remove_quietly(cmd).await
    }

    #[instrument(skip(self, config), fields(network = %config.name))]
    async fn create_network(&self, config: &NetworkConfig) -> Result<NetworkHandle> {
        let mut cmd = args(["network", "create", "--driver", config.driver.as_str()]);
        if config.internal {
            cmd.push("--internal".to_string());
        }
        push_labels(&mut cmd, &config.labels);
        cmd.push(config.name.clone());

        let id = self.run(cmd).await?;
        Ok(NetworkHandle { id, name: config.name.clone(), driver: config.driver.clone() })
    }

    #[instrument(skip(self, config), fields(volume = %config.name))]
    async fn create_volume(&self, config: &VolumeConfig) -> Result<VolumeHandle> {
        let mut cmd = args(["volume", "create", "--driver", config.driver.as_str()]);
        for (key, value) in &config.driver_opts {
            cmd.extend(["--opt".to_string(), format!("{}={}", key, value)]);
        }
        push_labels(&mut cmd, &config.labels);
        cmd.push(config.name.clone());

        let name = self.run(cmd).await?;
        Ok(VolumeHandle { name, driver: config.driver.clone() })
    }

    #[instrument(skip(self))]
    async fn stream_logs(&self, id: &ContainerId) -> Result<LogStream> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", "--tail", "all", id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConvoyError::RuntimeUnavailable { binary: self.binary.clone(), source: e })?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogSource::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogSource::Stderr, tx.clone()));
        }

        // Keep the client alive while someone is reading
        tokio::spawn(async move {
            let abandoned = tokio::select! {
                status = child.wait() => {
                    if let Err(e) = status {
                        warn!(error = %e, "Log client failed");
                    }
                    false
                }
                _ = tx.closed() => true,
            };
            if abandoned {
                let _ = child.kill().await;
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    #[instrument(skip(self))]
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkHandle>> {
        let raw: Option<RawNetwork> = self.inspect(args(["network", "inspect", name])).await?;
        Ok(raw.map(|n| NetworkHandle { id: n.id, name: n.name, driver: n.driver }))
    }

    #[instrument(skip(self))]
    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeHandle>> {
        let raw: Option<RawVolume> = self.inspect(args(["volume", "inspect", name])).await?;
        Ok(raw.map(|v| VolumeHandle { name: v.name, driver: v.driver }))
    }

    #[instrument(skip(self))]
    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo> {
        self.find_container(id.as_str())
            .await?
            .ok_or_else(|| ConvoyError::RuntimeCall(format!("no such container: {}", id)))
    }

    #[instrument(skip(self))]
    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let raw: Option<RawContainer> =
            self.inspect(args(["container", "inspect", name])).await?;
        Ok(raw.map(RawContainer::into_info))
    }

    #[instrument(skip(self))]
    async fn remove_network(&self, name: &str) -> Result<()> {
        self.remove_quietly(args(["network", "rm", name])).await
    }

    #[instrument(skip(self))]
    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.remove_quietly(args(["volume", "rm", name])).await
    }

    #[instrument(skip(self))]
    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let output = self.output(&args(["image", "inspect", reference])).await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_not_found(&output) {
            return Ok(false);
        }
        Err(command_error(&args(["image", "inspect", reference]), &output))
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.run(args(["pull", "--quiet", reference])).await.map(|_| ())
    }

    #[instrument(skip(self, request), fields(tag = %request.tag))]
    async fn build_image(&self, request: &BuildRequest) -> Result<()> {
        self.run(build_args(request)).await.map(|_| ())
    }
}

async fn forward_lines<R>(reader: R, source: LogSource, tx: mpsc::Sender<Result<LogLine>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let item = match lines.next_line().await {
            Ok(Some(line)) => Ok(LogLine { source, line }),
            Ok(None) => break,
            Err(e) => Err(ConvoyError::RuntimeCall(format!("log stream failed: {}", e))),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn push_labels(cmd: &mut Vec<String>, labels: &BTreeMap<String, String>) {
    for (key, value) in labels {
        cmd.extend(["--label".to_string(), format!("{}={}", key, value)]);
    }
}

fn command_error(args: &[String], output: &Output) -> ConvoyError {
    let verb = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
    let stderr = String::from_utf8_lossy(&output.stderr);
    ConvoyError::RuntimeCall(format!("`{}` failed: {}", verb, stderr.trim()))
}

fn is_not_found(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    stderr.contains("no such") || stderr.contains("not found")
}

/// Arguments for `create`.
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut cmd = args(["create", "--name", spec.name.as_str()]);

    push_labels(&mut cmd, &spec.labels);
    for (key, value) in &spec.env {
        cmd.extend(["--env".to_string(), format!("{}={}", key, value)]);
    }

    for mount in &spec.mounts {
        let mut value = match &mount.source {
            MountSource::Volume(name) => format!("{}:{}", name, mount.target),
            MountSource::Bind(path) => format!("{}:{}", path.display(), mount.target),
            MountSource::Anonymous => mount.target.clone(),
        };
        if mount.read_only && mount.source != MountSource::Anonymous {
            value.push_str(":ro");
        }
        cmd.extend(["--volume".to_string(), value]);
    }

    if let Some(endpoint) = spec.networks.first() {
        cmd.extend(["--network".to_string(), endpoint.network.clone()]);
        for alias in &endpoint.aliases {
            cmd.extend(["--network-alias".to_string(), alias.clone()]);
        }
    }

    for port in &spec.ports {
        let host = match &port.host_ip {
            Some(ip) if ip.contains(':') => format!("[{}]:{}", ip, port.host_port),
            Some(ip) => format!("{}:{}", ip, port.host_port),
            None => port.host_port.to_string(),
        };
        cmd.extend([
            "--publish".to_string(),
            format!("{}:{}/{}", host, port.container_port, port.protocol),
        ]);
    }

    if spec.tty {
        cmd.push("--tty".to_string());
    }
    if spec.stdin_open {
        cmd.push("--interactive".to_string());
    }
    if let Some(dir) = &spec.working_dir {
        cmd.extend(["--workdir".to_string(), dir.clone()]);
    }
    if let Some(user) = &spec.user {
        cmd.extend(["--user".to_string(), user.clone()]);
    }
    if let Some(restart) = &spec.restart {
        cmd.extend(["--restart".to_string(), restart.clone()]);
    }

    if let Some(hc) = &spec.healthcheck {
        push_healthcheck(&mut cmd, hc);
    }

    // Entrypoint takes a single executable; the rest goes in front of the command
    let mut trailing: Vec<String> = Vec::new();
    if let Some(entrypoint) = &spec.entrypoint {
        if let Some((exe, rest)) = entrypoint.split_first() {
            cmd.extend(["--entrypoint".to_string(), exe.clone()]);
            trailing.extend(rest.iter().cloned());
        }
    }

    cmd.push(spec.image.clone());
    cmd.extend(trailing);
    if let Some(command) = &spec.command {
        cmd.extend(command.iter().cloned());
    }
    cmd
}

fn push_healthcheck(cmd: &mut Vec<String>, hc: &Healthcheck) {
    let test = match hc.test.split_first() {
        Some((kind, rest)) if kind == "CMD-SHELL" || kind == "CMD" => rest.join(" "),
        _ => hc.test.join(" "),
    };
    if test.is_empty() {
        return;
    }
    cmd.extend(["--health-cmd".to_string(), test]);
    if let Some(interval) = &hc.interval {
        cmd.extend(["--health-interval".to_string(), interval.clone()]);
    }
    if let Some(timeout) = &hc.timeout {
        cmd.extend(["--health-timeout".to_string(), timeout.clone()]);
    }
    if let Some(retries) = hc.retries {
        cmd.extend(["--health-retries".to_string(), retries.to_string()]);
    }
    if let Some(start_period) = &hc.start_period {
        cmd.extend(["--health-start-period".to_string(), start_period.clone()]);
    }
}

/// Arguments for `build`.
fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut cmd = args(["build", "--tag", request.tag.as_str()]);
    if let Some(dockerfile) = &request.dockerfile {
        cmd.extend(["--file".to_string(), request.context.join(dockerfile).display().to_string()]);
    }
    for (key, value) in &request.args {
        cmd.extend(["--build-arg".to_string(), format!("{}={}", key, value)]);
    }
    if let Some(target) = &request.target {
        cmd.extend(["--target".to_string(), target.clone()]);
    }
    cmd.push(request.context.display().to_string());
    cmd
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNetwork {
    id: String,
    name: String,
    driver: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawVolume {
    name: String,
    driver: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    id: String,
    name: String,
    state: RawContainerState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainerState {
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    health: Option<RawHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHealth {
    status: String,
}

impl RawContainer {
    fn into_info(self) -> ContainerInfo {
        let status = ContainerStatus::parse(&self.state.status);
        ContainerInfo {
            id: ContainerId(self.id),
            name: self.name.trim_start_matches('/').to_string(),
            status,
            health: self.state.health.and_then(|h| HealthStatus::parse(&h.status)),
            exit_code: if status == ContainerStatus::Exited { self.state.exit_code } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Protocol;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "demo-backend-1".into(),
            image: "demo-backend:latest".into(),
            command: Some(vec!["npm".into(), "start".into()]),
            entrypoint: None,
            env: BTreeMap::from([("PORT".to_string(), "5000".to_string())]),
            mounts: vec![
                Mount {
                    source: MountSource::Bind("/srv/app".into()),
                    target: "/app".into(),
                    read_only: true,
                },
                Mount { source: MountSource::Anonymous, target: "/app/node_modules".into(), read_only: false },
            ],
            networks: vec![NetworkEndpoint {
                network: "demo_default".into(),
                aliases: vec!["backend".into()],
            }],
            ports: vec![PortMapping {
                host_ip: None,
                host_port: 5000,
                container_port: 5000,
                protocol: Protocol::Tcp,
            }],
            tty: false,
            stdin_open: true,
            working_dir: None,
            user: None,
            restart: None,
            labels: BTreeMap::new(),
            healthcheck: None,
        }
    }

    #[test]
    fn test_create_args() {
        let cmd = create_args(&spec()).join(" ");
        assert!(cmd.starts_with("create --name demo-backend-1"));
        assert!(cmd.contains("--env PORT=5000"));
        assert!(cmd.contains("--volume /srv/app:/app:ro"));
        assert!(cmd.contains("--volume /app/node_modules"));
        assert!(cmd.contains("--network demo_default --network-alias backend"));
        assert!(cmd.contains("--publish 5000:5000/tcp"));
        assert!(cmd.contains("--interactive"));
        assert!(cmd.ends_with("demo-backend:latest npm start"));
    }

    #[test]
    fn test_create_args_entrypoint() {
        let mut spec = spec();
        spec.entrypoint = Some(vec!["sh".into(), "-c".into()]);
        spec.command = Some(vec!["echo hi".into()]);
        let cmd = create_args(&spec);
        let image_pos = cmd.iter().position(|a| a == "demo-backend:latest").unwrap();
        assert_eq!(&cmd[image_pos + 1..], ["-c", "echo hi"]);
        assert!(cmd.windows(2).any(|w| w[0] == "--entrypoint" && w[1] == "sh"));
    }

    #[test]
    fn test_build_args() {
        let request = BuildRequest {
            context: "/srv/backend".into(),
            dockerfile: Some("Dockerfile.dev".into()),
            args: BTreeMap::from([("NODE_ENV".to_string(), "development".to_string())]),
            target: None,
            tag: "demo-backend:latest".into(),
        };
        assert_eq!(
            build_args(&request),
            vec![
                "build",
                "--tag",
                "demo-backend:latest",
                "--file",
                "/srv/backend/Dockerfile.dev",
                "--build-arg",
                "NODE_ENV=development",
                "/srv/backend"
            ]
        );
    }

    #[test]
    fn test_parse_container_inspect() {
        let json = r#"[{"Id":"abc123","Name":"/demo-mongodb-1","State":{"Status":"running","ExitCode":0,"Health":{"Status":"healthy"}}}]"#;
        let mut raw: Vec<RawContainer> = serde_json::from_str(json).unwrap();
        let info = raw.remove(0).into_info();
        assert_eq!(info.id, ContainerId::new("abc123"));
        assert_eq!(info.name, "demo-mongodb-1");
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.health, Some(HealthStatus::Healthy));
        assert_eq!(info.exit_code, None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let docker = DockerCli::new("convoy-test-no-such-binary");
        let err = docker.image_exists("nginx").await.unwrap_err();
        assert!(matches!(err, ConvoyError::RuntimeUnavailable { .. }));
    }
}
