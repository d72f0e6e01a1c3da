use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_shared_types::{ContainerId, NodeResources, OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String, // e.g., "tcp"
}

/// Command the engine runs inside the container to decide readiness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub command: Vec<String>,
    pub interval: Duration,
    pub retries: u32,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Hostname on the cluster network. Other members address the container by it.
    pub hostname: String,
    pub network: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Arguments passed after the image (e.g. mysqld flags).
    pub args: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub resources: NodeResources,
    pub health_check: Option<HealthCheck>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            hostname: name.clone(),
            name,
            image: image.into(),
            network: None,
            env: BTreeMap::new(),
            args: Vec::new(),
            labels: BTreeMap::new(),
            ports: Vec::new(),
            resources: NodeResources::default(),
            health_check: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub state: String, // e.g., "created", "running", "exited"
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Result of a command executed inside a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerStats {
    pub container_id: ContainerId,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

/// Options for retrieving container logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Return only the last N lines.
    pub tail: Option<usize>,
    /// Include timestamps in output.
    pub timestamps: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthProbe {
    Healthy,
    Starting,
    Unhealthy(String),
}

/// Outcome of a bounded readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyPoll {
    Ready,
    NotReadyYet,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Calls `probe` until it reports `Ready`, the probe gives up with
/// `TimedOut`, or the deadline passes. Never returns `NotReadyYet`.
pub async fn poll_until_ready<F, Fut>(policy: ReadinessPolicy, mut probe: F) -> ReadyPoll
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReadyPoll>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        match probe().await {
            ReadyPoll::Ready => return ReadyPoll::Ready,
            ReadyPoll::TimedOut => return ReadyPoll::TimedOut,
            ReadyPoll::NotReadyYet => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return ReadyPoll::TimedOut;
        }
        tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
    }
}

/// Thin facade over a container engine. Never decides what to run.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates an isolated network and returns its identifier.
    async fn create_network(&self, name: &str) -> Result<String>;

    async fn remove_network(&self, network_id: &str) -> Result<()>;

    /// Creates a container without starting it.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    async fn start_container(&self, container_id: &ContainerId) -> Result<()>;

    /// Stops a container.
    async fn stop_container(&self, container_id: &ContainerId) -> Result<()>;

    /// Removes a stopped container.
    async fn remove_container(&self, container_id: &ContainerId) -> Result<()>;

    /// Gets the status of a container.
    async fn get_container_status(&self, container_id: &ContainerId) -> Result<ContainerStatus>;

    /// Runs `command` inside the container. A non-zero exit is returned, not raised.
    async fn exec(
        &self,
        container_id: &ContainerId,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput>;

    async fn stats(&self, container_id: &ContainerId) -> Result<ContainerStats>;

    /// Gets container logs.
    /// Returns the log content as a string.
    async fn logs(&self, container_id: &ContainerId, options: &LogOptions) -> Result<String>;

    /// One health observation, no waiting.
    async fn probe_health(&self, container_id: &ContainerId) -> Result<HealthProbe>;

    /// Convenience: create and start in one call.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let id = self.create_container(spec).await?;
        self.start_container(&id).await?;
        Ok(id)
    }

    /// Waits until the container reports healthy. `Ok(false)` when the deadline passes.
    async fn wait_ready(&self, container_id: &ContainerId, policy: ReadinessPolicy) -> Result<bool> {
        let runtime = self;
        let outcome = poll_until_ready(policy, move || async move {
            match runtime.probe_health(container_id).await {
                Ok(HealthProbe::Healthy) => ReadyPoll::Ready,
                Ok(HealthProbe::Starting) | Ok(HealthProbe::Unhealthy(_)) => ReadyPoll::NotReadyYet,
                // Container gone or engine unreachable: keep polling until the deadline.
                Err(_) => ReadyPoll::NotReadyYet,
            }
        })
        .await;
        Ok(outcome == ReadyPoll::Ready)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerId),
    #[error("Network not found: {0}")]
    NetworkNotFound(String),
    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Unparseable runtime output: {0}")]
    InvalidOutput(String),
    #[error("Underlying I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// Helper to convert specific errors to the general OrchestrationError
impl From<RuntimeError> for OrchestrationError {
    fn from(err: RuntimeError) -> Self {
        OrchestrationError::RuntimeError(err.to_string())
    }
}
