//! Structural workflows and the requests that start them.
//!
//! Each workflow claims the cluster through
//! [`EngineContext::begin_structural`](crate::context::EngineContext::begin_structural),
//! runs to a terminal outcome and finalizes its task. There is no
//! cancellation once a workflow has started.

pub mod failover;
pub mod health;
pub mod lifecycle;
pub mod provisioning;
pub mod replicas;
pub mod scaling;

use std::fmt;

use serde::{Deserialize, Serialize};

use orchestrator_shared_types::{
    Cluster, ClusterFeatures, ClusterStatus, ContainerId, NodeResources, OrchestrationError, Result,
};

/// Upper bound on requested replicas for one cluster.
pub const MAX_REPLICAS: u32 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub replica_count: u32,
    #[serde(default)]
    pub resources: Option<NodeResources>,
    #[serde(default)]
    pub features: Option<ClusterFeatures>,
}

fn default_owner() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub replica_count: u32,
    /// Sizing for new replicas; the cluster's sizing when absent.
    #[serde(default)]
    pub resources: Option<NodeResources>,
}

/// Inbound failure-detection event from the topology monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailoverEvent {
    pub cluster_alias: String,
    pub failed_host: String,
    pub successor_host: String,
    #[serde(default)]
    pub failure_type: String,
}

pub(crate) fn validate_replica_count(count: u32) -> Result<()> {
    if count > MAX_REPLICAS {
        return Err(OrchestrationError::Validation(format!(
            "replica_count {} exceeds the maximum of {}",
            count, MAX_REPLICAS
        )));
    }
    Ok(())
}

pub(crate) fn validate_resources(resources: &NodeResources) -> Result<()> {
    if resources.cpu_cores <= 0.0 || resources.memory_mb == 0 {
        return Err(OrchestrationError::Validation(
            "resources need positive cpu_cores and memory_mb".to_string(),
        ));
    }
    Ok(())
}

/// Rejects the operation unless the cluster is in one of `allowed`.
pub(crate) fn require_status(
    cluster: &Cluster,
    operation: &str,
    allowed: &[ClusterStatus],
) -> Result<()> {
    if allowed.contains(&cluster.status) {
        Ok(())
    } else {
        Err(OrchestrationError::InvalidState {
            cluster_id: cluster.id,
            status: cluster.status,
            operation: operation.to_string(),
        })
    }
}

/// A workflow step that failed, with enough context to clean up after it.
#[derive(Debug)]
pub(crate) struct StepError {
    pub step: &'static str,
    pub container: Option<ContainerId>,
    pub source: OrchestrationError,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(container) => write!(f, "step {} failed (container {}): {}", self.step, container, self.source),
            None => write!(f, "step {} failed: {}", self.step, self.source),
        }
    }
}

pub(crate) trait StepResult<T> {
    fn step(self, step: &'static str) -> std::result::Result<T, StepError>;
    fn step_on(self, step: &'static str, container: &str) -> std::result::Result<T, StepError>;
}

impl<T> StepResult<T> for Result<T> {
    fn step(self, step: &'static str) -> std::result::Result<T, StepError> {
        self.map_err(|source| StepError {
            step,
            container: None,
            source,
        })
    }

    fn step_on(self, step: &'static str, container: &str) -> std::result::Result<T, StepError> {
        self.map_err(|source| StepError {
            step,
            container: Some(container.to_string()),
            source,
        })
    }
}
