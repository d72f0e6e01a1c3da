use async_trait::async_trait;
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, NodeId, OrchestrationError, Result, Task, TaskId,
};
use std::sync::Arc;
use thiserror::Error;

/// Errors specific to state store operations
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<StateStoreError> for OrchestrationError {
    fn from(err: StateStoreError) -> Self {
        OrchestrationError::StateError(err.to_string())
    }
}

/// Durable record of clusters, their nodes and their tasks.
///
/// Cluster writes are version-conditioned: `insert_cluster` stores version 1
/// and every successful `update_cluster` stores `expected_version + 1`. A write
/// against a stale version fails with `ConcurrentModification` and leaves the
/// stored record untouched. Any backend must keep these semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ===== Initialization =====

    /// Initialize the state store connection
    async fn initialize(&self) -> Result<()>;

    /// Check if the state store is healthy
    async fn health_check(&self) -> Result<bool>;

    // ===== Cluster Operations =====

    /// Store a new cluster. Fails if the id is already taken.
    async fn insert_cluster(&self, cluster: Cluster) -> Result<Cluster>;

    async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>>;

    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    /// Compare-and-swap write. Returns the record as stored (new version, new `updated_at`).
    async fn update_cluster(&self, cluster: Cluster, expected_version: u64) -> Result<Cluster>;

    /// Delete a cluster together with all of its nodes and tasks.
    async fn delete_cluster(&self, cluster_id: &ClusterId) -> Result<()>;

    // ===== Node Operations =====

    /// Store or update a node
    async fn put_node(&self, node: ClusterNode) -> Result<()>;

    async fn get_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<Option<ClusterNode>>;

    async fn list_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<ClusterNode>>;

    async fn delete_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<()>;

    // ===== Task Operations =====

    async fn put_task(&self, task: Task) -> Result<()>;

    async fn get_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<Option<Task>>;

    async fn list_tasks_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Task>>;

    /// Removing a task that does not exist is not an error.
    async fn delete_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<()>;

    /// Convenience: the cluster or `ClusterNotFound`.
    async fn require_cluster(&self, cluster_id: &ClusterId) -> Result<Cluster> {
        self.get_cluster(cluster_id)
            .await?
            .ok_or_else(|| OrchestrationError::ClusterNotFound(cluster_id.to_string()))
    }
}

#[cfg(feature = "in-memory")]
pub mod in_memory;

#[cfg(feature = "etcd")]
pub mod etcd_store;

/// Async helper function to create appropriate store based on config
pub async fn create_state_store(config: StateStoreConfig) -> Result<Arc<dyn StateStore>> {
    match config {
        #[cfg(feature = "in-memory")]
        StateStoreConfig::InMemory => Ok(Arc::new(in_memory::InMemoryStateStore::new())),

        #[cfg(feature = "etcd")]
        StateStoreConfig::Etcd { endpoints, prefix } => {
            let store = etcd_store::EtcdStateStore::with_prefix(endpoints, prefix).await?;
            Ok(Arc::new(store) as Arc<dyn StateStore>)
        }

        #[allow(unreachable_patterns)]
        _ => Err(OrchestrationError::ConfigError(
            "State store configuration not supported with current features".to_string(),
        )),
    }
}

/// Configuration for state store backends
#[derive(Debug, Clone)]
pub enum StateStoreConfig {
    #[cfg(feature = "in-memory")]
    InMemory,

    #[cfg(feature = "etcd")]
    Etcd { endpoints: Vec<String>, prefix: String },
}
