use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type ClusterId = Uuid;
pub type NodeId = Uuid;
pub type TaskId = Uuid;
pub type ContainerId = String; // Typically a hash provided by the runtime
pub type OwnerId = String;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("Operation '{operation}' not allowed while cluster {cluster_id} is {status}")]
    InvalidState {
        cluster_id: ClusterId,
        status: ClusterStatus,
        operation: String,
    },
    #[error("Cluster {cluster_id} already has a {task_type} task in flight ({task_id})")]
    OperationInProgress {
        cluster_id: ClusterId,
        task_id: TaskId,
        task_type: TaskType,
    },
    #[error("Container {container} not ready after {waited:?}")]
    ContainerNotReady { container: String, waited: Duration },
    #[error("Router operation '{operation}' failed for cluster {cluster_id}: {message}")]
    RouterOperationFailed {
        operation: String,
        cluster_id: ClusterId,
        message: String,
    },
    #[error("Cluster {cluster_id} was modified concurrently (expected version {expected}, found {found})")]
    ConcurrentModification {
        cluster_id: ClusterId,
        expected: u64,
        found: u64,
    },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Container runtime error: {0}")]
    RuntimeError(String),
    #[error("State persistence error: {0}")]
    StateError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Credential error: {0}")]
    CredentialError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl OrchestrationError {
    /// Whether the caller may retry the same request after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ContainerNotReady { .. }
                | OrchestrationError::ConcurrentModification { .. }
                | OrchestrationError::OperationInProgress { .. }
                | OrchestrationError::RouterOperationFailed { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ClusterNotFound(_)
                | OrchestrationError::NodeNotFound(_)
                | OrchestrationError::TaskNotFound(_)
        )
    }
}

// Lifecycle of a database cluster. PROVISIONING and DELETING are transient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Provisioning,
    Healthy,
    Degraded,
    Failed,
    Stopped,
    Deleting,
}

impl ClusterStatus {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterStatus::Provisioning | ClusterStatus::Deleting)
    }

    /// Transition table for the cluster lifecycle.
    ///
    /// `DELETING` may only resolve to `FAILED` (leftover resources); a
    /// successful delete removes the record instead of transitioning.
    pub fn can_transition_to(&self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        if next == Deleting {
            return *self != Deleting;
        }
        match (self, next) {
            (Provisioning, Healthy | Degraded | Failed) => true,
            (Healthy, Degraded | Failed | Stopped) => true,
            (Degraded, Healthy | Failed | Stopped) => true,
            (Healthy, Healthy) | (Degraded, Degraded) => true,
            (Failed, Healthy | Degraded | Stopped) => true,
            (Stopped, Healthy | Degraded | Failed) => true,
            (Deleting, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Provisioning => "PROVISIONING",
            ClusterStatus::Healthy => "HEALTHY",
            ClusterStatus::Degraded => "DEGRADED",
            ClusterStatus::Failed => "FAILED",
            ClusterStatus::Stopped => "STOPPED",
            ClusterStatus::Deleting => "DELETING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Primary,
    Replica,
    Router,
    Monitor,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Primary => "primary",
            NodeRole::Replica => "replica",
            NodeRole::Router => "router",
            NodeRole::Monitor => "monitor",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Starting,
    Running,
    Stopped,
    Failed,
    Syncing,
}

// Requested resources for a single database or router container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeResources {
    pub cpu_cores: f32,  // e.g., 2.0 for 2 cores, 0.5 for half a core
    pub memory_mb: u64,  // Memory in Megabytes
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterFeatures {
    pub auto_failover: bool,
    pub backup_enabled: bool,
}

impl Default for ClusterFeatures {
    fn default() -> Self {
        Self {
            auto_failover: true,
            backup_enabled: false,
        }
    }
}

/// Age-armored ciphertext. The plaintext never reaches the state store.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    pub fn from_armored(armored: impl Into<String>) -> Self {
        Self(armored.into())
    }

    pub fn armored(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedSecret(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterCredentials {
    pub root_password: SealedSecret,
    pub replication_user: String,
    pub replication_password: SealedSecret,
    pub app_user: String,
    pub app_password: SealedSecret,
    pub monitor_user: String,
    pub monitor_password: SealedSecret,
    pub router_admin_user: String,
    pub router_admin_password: SealedSecret,
    /// Set once the router's first-boot admin password has been replaced.
    pub router_admin_rotated: bool,
}

// A logical database service: one primary, N replicas, one router
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub owner: OwnerId,
    pub name: String,
    pub engine_version: String,
    pub replica_count: u32,
    pub status: ClusterStatus,
    pub network_id: Option<String>,
    pub primary_container_id: Option<ContainerId>,
    pub router_container_id: Option<ContainerId>,
    pub replica_container_ids: Vec<ContainerId>,
    pub credentials: ClusterCredentials,
    pub features: ClusterFeatures,
    pub resources: NodeResources,
    /// Incremented by the state store on every successful write.
    pub version: u64,
    pub error_message: Option<String>,
    /// The router may still point at a stale primary.
    #[serde(default)]
    pub router_sync_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// A fresh record in `PROVISIONING` with an empty node set.
    pub fn provisioning(
        owner: impl Into<OwnerId>,
        name: impl Into<String>,
        engine_version: impl Into<String>,
        replica_count: u32,
        credentials: ClusterCredentials,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            name: name.into(),
            engine_version: engine_version.into(),
            replica_count,
            status: ClusterStatus::Provisioning,
            network_id: None,
            primary_container_id: None,
            router_container_id: None,
            replica_container_ids: Vec::new(),
            credentials,
            features: ClusterFeatures::default(),
            resources: NodeResources::default(),
            version: 0,
            error_message: None,
            router_sync_pending: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_replica_container(&self, container_id: &str) -> bool {
        self.replica_container_ids.iter().any(|id| id == container_id)
    }

    /// The primary reference never appears among the replicas.
    pub fn topology_is_consistent(&self) -> bool {
        match &self.primary_container_id {
            Some(primary) => !self.is_replica_container(primary),
            None => true,
        }
    }
}

// One container participating in a cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterNode {
    pub id: NodeId,
    pub cluster_id: ClusterId,
    pub container_id: ContainerId,
    pub container_name: String,
    pub role: NodeRole,
    /// Hostname on the cluster network, e.g. "dbc-1a2b3c4d-replica-2".
    pub hostname: String,
    pub address: Option<String>,
    pub port: u16,
    pub status: NodeStatus,
    pub resources: NodeResources,
    pub read_only: bool,
    /// Position among nodes of the same role; scale-down removes the highest first.
    pub ordinal: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Provision,
    Scale,
    Backup,
    Restore,
    Failover,
    Delete,
    Stop,
    Start,
}

impl TaskType {
    /// Structural tasks mutate topology; at most one may be in flight per cluster.
    pub fn is_structural(&self) -> bool {
        !matches!(self, TaskType::Backup | TaskType::Restore)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::Provision => "PROVISION",
            TaskType::Scale => "SCALE",
            TaskType::Backup => "BACKUP",
            TaskType::Restore => "RESTORE",
            TaskType::Failover => "FAILOVER",
            TaskType::Delete => "DELETE",
            TaskType::Stop => "STOP",
            TaskType::Start => "START",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

// Record of one asynchronous cluster operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub cluster_id: ClusterId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub log: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(cluster_id: ClusterId, task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            task_type,
            status: TaskStatus::Pending,
            log: String::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_active_structural(&self) -> bool {
        self.task_type.is_structural() && !self.status.is_terminal()
    }
}

// Generic result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;
