//! Mock container runtime for testing and development.
//!
//! This provides an in-memory implementation that simulates container operations
//! without actually creating containers. Exec output can be scripted per command
//! pattern and individual containers can be made to fail creation or never
//! become healthy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use container_runtime_interface::{
    ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, ExecOutput, HealthProbe,
    LogOptions, RuntimeError,
};
use orchestrator_shared_types::{ContainerId, OrchestrationError, Result};

/// Mock container state
#[derive(Debug, Clone)]
struct MockContainer {
    id: ContainerId,
    spec: ContainerSpec,
    state: String,
    exit_code: Option<i32>,
}

/// One recorded `exec` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub container_id: ContainerId,
    pub command: Vec<String>,
    pub env_keys: Vec<String>,
}

/// Mock runtime that simulates container operations in-memory.
#[derive(Debug, Default)]
pub struct MockRuntime {
    /// All containers by ID
    containers: Arc<RwLock<HashMap<ContainerId, MockContainer>>>,
    networks: Arc<RwLock<HashMap<String, String>>>,
    /// (substring of the joined command, canned output); first match wins
    exec_responses: Arc<RwLock<Vec<(String, ExecOutput)>>>,
    exec_log: Arc<RwLock<Vec<ExecRecord>>>,
    /// Container names containing one of these fragments fail to create
    fail_create: Arc<RwLock<HashSet<String>>>,
    /// Container names containing one of these fragments never turn healthy
    never_ready: Arc<RwLock<HashSet<String>>>,
    pub should_fail_remove: AtomicBool,
    create_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl MockRuntime {
    /// Create a new mock runtime instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the count of containers (for testing).
    pub async fn container_count(&self) -> usize {
        self.containers.read().await.len()
    }

    pub async fn network_count(&self) -> usize {
        self.networks.read().await.len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Any `exec` whose joined command contains `pattern` returns `output`.
    /// Registering the same pattern again replaces the earlier response.
    pub async fn respond_to_exec(&self, pattern: impl Into<String>, output: ExecOutput) {
        let pattern = pattern.into();
        let mut responses = self.exec_responses.write().await;
        responses.retain(|(existing, _)| *existing != pattern);
        responses.push((pattern, output));
    }

    pub async fn fail_create_matching(&self, name_fragment: impl Into<String>) {
        self.fail_create.write().await.insert(name_fragment.into());
    }

    pub async fn never_ready_matching(&self, name_fragment: impl Into<String>) {
        self.never_ready.write().await.insert(name_fragment.into());
    }

    /// Simulates a crash: the container is left in the `exited` state.
    pub async fn crash_container(&self, container_id: &ContainerId) {
        if let Some(container) = self.containers.write().await.get_mut(container_id) {
            container.state = "exited".to_string();
            container.exit_code = Some(137);
        }
    }

    pub async fn exec_log(&self) -> Vec<ExecRecord> {
        self.exec_log.read().await.clone()
    }

    pub async fn spec_of(&self, container_id: &ContainerId) -> Option<ContainerSpec> {
        self.containers
            .read()
            .await
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    pub async fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .read()
            .await
            .values()
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    async fn matches_any(set: &RwLock<HashSet<String>>, name: &str) -> bool {
        set.read().await.iter().any(|fragment| name.contains(fragment.as_str()))
    }

    fn not_found(container_id: &ContainerId) -> OrchestrationError {
        RuntimeError::ContainerNotFound(container_id.clone()).into()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_network(&self, name: &str) -> Result<String> {
        let id = format!("mock-net-{}", Uuid::new_v4());
        info!("MockRuntime: Creating network {} ({})", name, id);
        self.networks.write().await.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        info!("MockRuntime: Removing network {}", network_id);
        match self.networks.write().await.remove(network_id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NetworkNotFound(network_id.to_string()).into()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if Self::matches_any(&self.fail_create, &spec.name).await {
            return Err(RuntimeError::CommandFailed {
                command: format!("create {}", spec.name),
                message: "injected failure".to_string(),
            }
            .into());
        }

        let container_id = format!("mock-container-{}", Uuid::new_v4());
        info!(
            "MockRuntime: Creating container {} ({}) from {}",
            container_id, spec.name, spec.image
        );
        debug!("Container spec: {:?}", spec);

        let container = MockContainer {
            id: container_id.clone(),
            spec: spec.clone(),
            state: "created".to_string(),
            exit_code: None,
        };
        self.containers.write().await.insert(container_id.clone(), container);
        Ok(container_id)
    }

    async fn start_container(&self, container_id: &ContainerId) -> Result<()> {
        info!("MockRuntime: Starting container {}", container_id);
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        container.state = "running".to_string();
        container.exit_code = None;
        Ok(())
    }

    async fn stop_container(&self, container_id: &ContainerId) -> Result<()> {
        info!("MockRuntime: Stopping container {}", container_id);

        let mut containers = self.containers.write().await;
        if let Some(container) = containers.get_mut(container_id) {
            container.state = "exited".to_string();
            container.exit_code = Some(0);
            Ok(())
        } else {
            Err(Self::not_found(container_id))
        }
    }

    async fn remove_container(&self, container_id: &ContainerId) -> Result<()> {
        info!("MockRuntime: Removing container {}", container_id);
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail_remove.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: format!("rm {}", container_id),
                message: "injected failure".to_string(),
            }
            .into());
        }

        match self.containers.write().await.remove(container_id) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(container_id)),
        }
    }

    async fn get_container_status(&self, container_id: &ContainerId) -> Result<ContainerStatus> {
        debug!("MockRuntime: Getting status for container {}", container_id);

        let containers = self.containers.read().await;
        let container = containers
            .get(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        Ok(ContainerStatus {
            id: container.id.clone(),
            state: container.state.clone(),
            exit_code: container.exit_code,
            error_message: None,
        })
    }

    async fn exec(
        &self,
        container_id: &ContainerId,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput> {
        {
            let containers = self.containers.read().await;
            let container = containers
                .get(container_id)
                .ok_or_else(|| Self::not_found(container_id))?;
            if container.state != "running" {
                return Err(RuntimeError::CommandFailed {
                    command: command.join(" "),
                    message: format!("container {} is not running", container_id),
                }
                .into());
            }
        }

        self.exec_log.write().await.push(ExecRecord {
            container_id: container_id.clone(),
            command: command.to_vec(),
            env_keys: env.iter().map(|(k, _)| k.clone()).collect(),
        });

        let joined = command.join(" ");
        let responses = self.exec_responses.read().await;
        let output = responses
            .iter()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        Ok(output)
    }

    async fn stats(&self, container_id: &ContainerId) -> Result<ContainerStats> {
        let containers = self.containers.read().await;
        let container = containers
            .get(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        let memory_limit_bytes = container.spec.resources.memory_mb * 1024 * 1024;
        Ok(ContainerStats {
            container_id: container_id.clone(),
            cpu_percent: 1.5,
            memory_usage_bytes: memory_limit_bytes / 4,
            memory_limit_bytes,
            ..Default::default()
        })
    }

    async fn logs(&self, container_id: &ContainerId, options: &LogOptions) -> Result<String> {
        let containers = self.containers.read().await;
        let container = containers
            .get(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        let lines = [
            format!("starting {}", container.spec.name),
            format!("image {}", container.spec.image),
            format!("state {}", container.state),
        ];
        let skip = options
            .tail
            .map(|tail| lines.len().saturating_sub(tail))
            .unwrap_or(0);
        let rendered: Vec<String> = lines
            .iter()
            .skip(skip)
            .map(|line| {
                if options.timestamps {
                    format!("2024-01-01T00:00:00Z {}", line)
                } else {
                    line.clone()
                }
            })
            .collect();
        Ok(rendered.join("\n"))
    }

    async fn probe_health(&self, container_id: &ContainerId) -> Result<HealthProbe> {
        let (state, name) = {
            let containers = self.containers.read().await;
            let container = containers
                .get(container_id)
                .ok_or_else(|| Self::not_found(container_id))?;
            (container.state.clone(), container.spec.name.clone())
        };
        if state != "running" {
            return Ok(HealthProbe::Unhealthy(format!("container is {}", state)));
        }
        if Self::matches_any(&self.never_ready, &name).await {
            return Ok(HealthProbe::Starting);
        }
        Ok(HealthProbe::Healthy)
    }
}
