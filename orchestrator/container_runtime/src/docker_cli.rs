//! CLI-based Docker container runtime.
//!
//! Drives the `docker` binary through `tokio::process`. Every invocation is
//! bounded by `command_timeout`; nothing here waits indefinitely.
//!
//! # Requirements
//!
//! - `docker` binary must be installed and in PATH
//! - The calling user can reach the Docker daemon socket
//!
//! Secrets passed to `exec` are handed to the docker client through its own
//! environment (`-e NAME` without a value), so they never appear on a command line.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use container_runtime_interface::{
    ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, ExecOutput, HealthProbe,
    LogOptions, RuntimeError,
};
use orchestrator_shared_types::{ContainerId, OrchestrationError, Result};

/// Errors specific to Docker CLI operations.
#[derive(Debug, thiserror::Error)]
pub enum DockerCliError {
    #[error("Docker binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Docker command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<DockerCliError> for OrchestrationError {
    fn from(err: DockerCliError) -> Self {
        match err {
            DockerCliError::ContainerNotFound(id) => RuntimeError::ContainerNotFound(id).into(),
            DockerCliError::Timeout(cmd) => RuntimeError::Timeout(cmd).into(),
            other => OrchestrationError::RuntimeError(other.to_string()),
        }
    }
}

/// Configuration for DockerCliRuntime.
#[derive(Debug, Clone)]
pub struct DockerCliConfig {
    /// Path to docker binary (default: "docker")
    pub docker_binary: String,
    /// Timeout for commands (default: 30s)
    pub command_timeout: Duration,
    /// Grace period before SIGKILL on stop (default: 10s)
    pub stop_timeout: Duration,
}

impl Default for DockerCliConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            command_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Subset of `docker inspect` `.State`.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerState {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: Option<i32>,
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
    #[serde(rename = "Health", default)]
    pub health: Option<DockerHealth>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerHealth {
    #[serde(rename = "Status")]
    pub status: String,
}

/// One line of `docker stats --format '{{json .}}'`.
#[derive(Debug, Clone, Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
    #[serde(rename = "NetIO")]
    net_io: String,
    #[serde(rename = "BlockIO")]
    block_io: String,
}

pub struct DockerCliRuntime {
    config: DockerCliConfig,
}

impl DockerCliRuntime {
    /// Create with custom configuration, verifying the binary responds.
    pub async fn with_config(config: DockerCliConfig) -> std::result::Result<Self, DockerCliError> {
        let runtime = Self { config };
        runtime.verify_binary().await?;
        Ok(runtime)
    }

    async fn verify_binary(&self) -> std::result::Result<(), DockerCliError> {
        let output = Command::new(&self.config.docker_binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DockerCliError::BinaryNotFound(format!("{}: {}", self.config.docker_binary, e)))?;

        if !output.status.success() {
            return Err(DockerCliError::BinaryNotFound(format!(
                "{} returned non-zero exit code",
                self.config.docker_binary
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Docker version: {}", version.trim());
        Ok(())
    }

    /// Execute docker command with timeout.
    async fn exec_docker(
        &self,
        args: &[String],
        env: &[(String, String)],
    ) -> std::result::Result<std::process::Output, DockerCliError> {
        let cmd_str = format!("docker {}", args.join(" "));
        debug!("Executing: {}", cmd_str);

        let mut command = Command::new(&self.config.docker_binary);
        command
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.command_timeout, command.output())
            .await
            .map_err(|_| DockerCliError::Timeout(cmd_str.clone()))?
            .map_err(DockerCliError::Io)?;
        Ok(output)
    }

    /// Run a docker command and require exit status 0; returns trimmed stdout.
    async fn docker_ok(&self, args: Vec<String>) -> std::result::Result<String, DockerCliError> {
        let output = self.exec_docker(&args, &[]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such container") || stderr.contains("No such object") {
                let target = args.last().cloned().unwrap_or_default();
                return Err(DockerCliError::ContainerNotFound(target));
            }
            return Err(DockerCliError::CommandFailed {
                command: args.first().cloned().unwrap_or_default(),
                message: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn inspect_state(&self, container_id: &str) -> std::result::Result<DockerState, DockerCliError> {
        let raw = self
            .docker_ok(vec![
                "inspect".into(),
                "--format".into(),
                "{{json .State}}".into(),
                container_id.to_string(),
            ])
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Arguments for `docker create`.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        spec.name.clone(),
        "--hostname".into(),
        spec.hostname.clone(),
    ];
    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
        args.push("--network-alias".into());
        args.push(spec.hostname.clone());
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }
    for port in &spec.ports {
        args.push("-p".into());
        match port.host_port {
            Some(host) => args.push(format!("{}:{}/{}", host, port.container_port, port.protocol)),
            None => args.push(format!("{}/{}", port.container_port, port.protocol)),
        }
    }
    if spec.resources.cpu_cores > 0.0 {
        args.push("--cpus".into());
        args.push(format!("{}", spec.resources.cpu_cores));
    }
    if spec.resources.memory_mb > 0 {
        args.push("--memory".into());
        args.push(format!("{}m", spec.resources.memory_mb));
    }
    if let Some(check) = &spec.health_check {
        args.push("--health-cmd".into());
        args.push(check.command.join(" "));
        args.push("--health-interval".into());
        args.push(format!("{}s", check.interval.as_secs().max(1)));
        args.push("--health-retries".into());
        args.push(check.retries.to_string());
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

fn health_from_state(state: &DockerState) -> HealthProbe {
    if state.status != "running" {
        return HealthProbe::Unhealthy(format!("container is {}", state.status));
    }
    match state.health.as_ref().map(|h| h.status.as_str()) {
        None | Some("healthy") => HealthProbe::Healthy,
        Some("starting") => HealthProbe::Starting,
        Some(other) => HealthProbe::Unhealthy(other.to_string()),
    }
}

/// Parses docker's human-readable sizes ("12.5MiB", "1.2kB", "0B").
fn parse_size(raw: &str) -> u64 {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().unwrap_or(0.0);
    let multiplier: f64 = match unit.trim() {
        "B" | "" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

/// Splits "a / b" pairs used by docker stats.
fn parse_pair(raw: &str) -> (u64, u64) {
    let mut parts = raw.split('/');
    let first = parts.next().map(parse_size).unwrap_or(0);
    let second = parts.next().map(parse_size).unwrap_or(0);
    (first, second)
}

fn parse_stats(container_id: &str, raw: &str) -> std::result::Result<ContainerStats, DockerCliError> {
    let line: DockerStatsLine = serde_json::from_str(raw.lines().next().unwrap_or("{}"))?;
    let (memory_usage_bytes, memory_limit_bytes) = parse_pair(&line.mem_usage);
    let (net_rx_bytes, net_tx_bytes) = parse_pair(&line.net_io);
    let (block_read_bytes, block_write_bytes) = parse_pair(&line.block_io);
    Ok(ContainerStats {
        container_id: container_id.to_string(),
        cpu_percent: line.cpu_perc.trim_end_matches('%').parse().unwrap_or(0.0),
        memory_usage_bytes,
        memory_limit_bytes,
        net_rx_bytes,
        net_tx_bytes,
        block_read_bytes,
        block_write_bytes,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn create_network(&self, name: &str) -> Result<String> {
        info!("DockerCliRuntime: Creating network {}", name);
        let id = self
            .docker_ok(vec![
                "network".into(),
                "create".into(),
                "--driver".into(),
                "bridge".into(),
                name.to_string(),
            ])
            .await?;
        Ok(id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        info!("DockerCliRuntime: Removing network {}", network_id);
        self.docker_ok(vec!["network".into(), "rm".into(), network_id.to_string()])
            .await
            .map_err(|e| match e {
                DockerCliError::ContainerNotFound(id) => RuntimeError::NetworkNotFound(id).into(),
                other => OrchestrationError::from(other),
            })?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        info!("DockerCliRuntime: Creating container {} from {}", spec.name, spec.image);
        let id = self.docker_ok(create_args(spec)).await?;
        Ok(id)
    }

    async fn start_container(&self, container_id: &ContainerId) -> Result<()> {
        info!("DockerCliRuntime: Starting container {}", container_id);
        self.docker_ok(vec!["start".into(), container_id.clone()]).await?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &ContainerId) -> Result<()> {
        info!("DockerCliRuntime: Stopping container {}", container_id);
        self.docker_ok(vec![
            "stop".into(),
            "-t".into(),
            self.config.stop_timeout.as_secs().to_string(),
            container_id.clone(),
        ])
        .await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &ContainerId) -> Result<()> {
        info!("DockerCliRuntime: Removing container {}", container_id);
        self.docker_ok(vec!["rm".into(), "-f".into(), container_id.clone()])
            .await?;
        Ok(())
    }

    async fn get_container_status(&self, container_id: &ContainerId) -> Result<ContainerStatus> {
        let state = self.inspect_state(container_id).await?;
        Ok(ContainerStatus {
            id: container_id.clone(),
            state: state.status.clone(),
            exit_code: state.exit_code,
            error_message: state.error.filter(|e| !e.is_empty()),
        })
    }

    async fn exec(
        &self,
        container_id: &ContainerId,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput> {
        let mut args: Vec<String> = vec!["exec".into()];
        for (key, _) in env {
            args.push("-e".into());
            args.push(key.clone());
        }
        args.push(container_id.clone());
        args.extend(command.iter().cloned());

        let output = self.exec_docker(&args, env).await?;
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!(container_id = %container_id, exit_code, "exec returned non-zero status");
        }
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn stats(&self, container_id: &ContainerId) -> Result<ContainerStats> {
        let raw = self
            .docker_ok(vec![
                "stats".into(),
                "--no-stream".into(),
                "--format".into(),
                "{{json .}}".into(),
                container_id.clone(),
            ])
            .await?;
        Ok(parse_stats(container_id, &raw)?)
    }

    async fn logs(&self, container_id: &ContainerId, options: &LogOptions) -> Result<String> {
        let mut args: Vec<String> = vec!["logs".into()];
        if let Some(tail) = options.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        if options.timestamps {
            args.push("--timestamps".into());
        }
        args.push(container_id.clone());

        let output = self.exec_docker(&args, &[]).await?;
        if !output.status.success() {
            return Err(DockerCliError::CommandFailed {
                command: "logs".into(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        // docker logs replays the container's stderr on our stderr
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn probe_health(&self, container_id: &ContainerId) -> Result<HealthProbe> {
        let state = self.inspect_state(container_id).await?;
        Ok(health_from_state(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_runtime_interface::{HealthCheck, PortMapping};
    use orchestrator_shared_types::NodeResources;

    #[test]
    fn test_create_args() {
        let mut spec = ContainerSpec::new("dbc-1a2b-primary", "mysql:8.0");
        spec.network = Some("dbc-1a2b-net".into());
        spec.env.insert("MYSQL_ROOT_PASSWORD".into(), "x".into());
        spec.args = vec!["--server-id=1".into()];
        spec.resources = NodeResources { cpu_cores: 1.5, memory_mb: 512 };
        spec.ports.push(PortMapping { container_port: 3306, host_port: None, protocol: "tcp".into() });
        spec.health_check = Some(HealthCheck {
            command: vec!["mysqladmin".into(), "ping".into()],
            interval: Duration::from_secs(2),
            retries: 30,
        });

        let args = create_args(&spec);
        assert_eq!(&args[..3], &["create", "--name", "dbc-1a2b-primary"]);
        assert!(args.windows(2).any(|w| w == ["--network", "dbc-1a2b-net"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "1.5"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "512m"]));
        assert!(args.windows(2).any(|w| w == ["--health-cmd", "mysqladmin ping"]));
        assert!(args.windows(2).any(|w| w == ["-p", "3306/tcp"]));
        // image comes before the server arguments
        assert_eq!(&args[args.len() - 2..], &["mysql:8.0", "--server-id=1"]);
    }

    #[test]
    fn test_health_from_state() {
        let state: DockerState =
            serde_json::from_str(r#"{"Status":"running","ExitCode":0,"Health":{"Status":"starting"}}"#).unwrap();
        assert_eq!(health_from_state(&state), HealthProbe::Starting);

        let state: DockerState = serde_json::from_str(r#"{"Status":"running"}"#).unwrap();
        assert_eq!(health_from_state(&state), HealthProbe::Healthy);

        let state: DockerState = serde_json::from_str(r#"{"Status":"exited","ExitCode":1}"#).unwrap();
        assert!(matches!(health_from_state(&state), HealthProbe::Unhealthy(_)));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0B"), 0);
        assert_eq!(parse_size("2kB"), 2000);
        assert_eq!(parse_size("1MiB"), 1024 * 1024);
        assert_eq!(parse_size(" 1.5GiB "), (1.5 * 1024.0 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn test_parse_stats() {
        let raw = r#"{"CPUPerc":"12.50%","MemUsage":"100MiB / 1GiB","NetIO":"1kB / 2kB","BlockIO":"0B / 4MB"}"#;
        let stats = parse_stats("abc", raw).unwrap();
        assert_eq!(stats.cpu_percent, 12.5);
        assert_eq!(stats.memory_usage_bytes, 100 * 1024 * 1024);
        assert_eq!(stats.memory_limit_bytes, 1024 * 1024 * 1024);
        assert_eq!(stats.net_rx_bytes, 1000);
        assert_eq!(stats.net_tx_bytes, 2000);
        assert_eq!(stats.block_write_bytes, 4_000_000);
    }
}
