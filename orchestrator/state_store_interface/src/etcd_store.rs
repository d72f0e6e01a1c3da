use async_trait::async_trait;
use chrono::Utc;
use etcd_client::{Client, Compare, CompareOp, DeleteOptions, GetOptions, Txn, TxnOp, TxnOpResponse};
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, NodeId, OrchestrationError, Result, Task, TaskId,
};
use std::sync::Arc;

use crate::{StateStore, StateStoreError};

/// Etcd-backed implementation of StateStore
///
/// Cluster records are written in transactions that compare the etcd key
/// version, which etcd bumps on every put. `insert_cluster` requires key
/// version 0 and stores cluster version 1; `update_cluster` requires key
/// version `expected` and stores `expected + 1`, so the two counters move in
/// lockstep as long as all writes go through this store.
pub struct EtcdStateStore {
    client: Arc<tokio::sync::Mutex<Client>>,
    prefix: String, // Key prefix for namespacing (e.g., "/dbcluster")
}

impl EtcdStateStore {
    /// Create a new etcd-backed state store
    ///
    /// # Arguments
    /// * `endpoints` - List of etcd endpoints (e.g., ["127.0.0.1:2379"])
    pub async fn new(endpoints: Vec<String>) -> Result<Self> {
        Self::with_prefix(endpoints, "/dbcluster".to_string()).await
    }

    /// Create with custom prefix
    pub async fn with_prefix(endpoints: Vec<String>, prefix: String) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| StateStoreError::ConnectionError(format!("Failed to connect to etcd: {}", e)))?;

        Ok(Self {
            client: Arc::new(tokio::sync::Mutex::new(client)),
            prefix,
        })
    }

    // Helper methods for key construction
    fn cluster_key(&self, cluster_id: &ClusterId) -> String {
        format!("{}/clusters/{}", self.prefix, cluster_id)
    }

    fn clusters_prefix(&self) -> String {
        format!("{}/clusters/", self.prefix)
    }

    fn node_key(&self, cluster_id: &ClusterId, node_id: &NodeId) -> String {
        format!("{}/nodes/{}/{}", self.prefix, cluster_id, node_id)
    }

    fn nodes_prefix(&self, cluster_id: &ClusterId) -> String {
        format!("{}/nodes/{}/", self.prefix, cluster_id)
    }

    fn task_key(&self, cluster_id: &ClusterId, task_id: &TaskId) -> String {
        format!("{}/tasks/{}/{}", self.prefix, cluster_id, task_id)
    }

    fn tasks_prefix(&self, cluster_id: &ClusterId) -> String {
        format!("{}/tasks/{}/", self.prefix, cluster_id)
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
        serde_json::to_string(value)
            .map_err(|e| StateStoreError::SerializationError(e.to_string()).into())
    }

    fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|e| StateStoreError::SerializationError(e.to_string()).into())
    }

    // Helper to serialize and put a value
    async fn put_value<T: serde::Serialize>(&self, key: String, value: &T) -> Result<()> {
        let json = Self::encode(value)?;

        let mut client = self.client.lock().await;
        client
            .put(key, json, None)
            .await
            .map_err(|e| StateStoreError::InternalError(format!("etcd put failed: {}", e)))?;

        Ok(())
    }

    // Helper to get and deserialize a value
    async fn get_value<T: serde::de::DeserializeOwned>(&self, key: String) -> Result<Option<T>> {
        let mut client = self.client.lock().await;
        let response = client
            .get(key, None)
            .await
            .map_err(|e| StateStoreError::InternalError(format!("etcd get failed: {}", e)))?;

        match response.kvs().first() {
            Some(kv) => {
                let json = kv
                    .value_str()
                    .map_err(|e| StateStoreError::SerializationError(format!("Invalid UTF-8: {}", e)))?;
                Ok(Some(Self::decode(json)?))
            }
            None => Ok(None),
        }
    }

    // Helper to list all values with a prefix
    async fn list_with_prefix<T: serde::de::DeserializeOwned>(&self, prefix: String) -> Result<Vec<T>> {
        let mut client = self.client.lock().await;
        let get_options = GetOptions::new().with_prefix();

        let response = client
            .get(prefix, Some(get_options))
            .await
            .map_err(|e| StateStoreError::InternalError(format!("etcd list failed: {}", e)))?;

        let mut results = Vec::new();
        for kv in response.kvs() {
            let json = kv
                .value_str()
                .map_err(|e| StateStoreError::SerializationError(format!("Invalid UTF-8: {}", e)))?;
            results.push(Self::decode(json)?);
        }

        Ok(results)
    }

    // Helper to delete a key
    async fn delete_key(&self, key: String) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .delete(key, None)
            .await
            .map_err(|e| StateStoreError::InternalError(format!("etcd delete failed: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for EtcdStateStore {
    async fn initialize(&self) -> Result<()> {
        // Test connection by attempting a health check
        if !self.health_check().await? {
            return Err(StateStoreError::ConnectionError("etcd is not reachable".to_string()).into());
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut client = self.client.lock().await;
        // Try a simple get operation to test connectivity
        match client.get(format!("{}/health", self.prefix), None).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    // ===== Cluster Operations =====

    async fn insert_cluster(&self, mut cluster: Cluster) -> Result<Cluster> {
        cluster.version = 1;
        cluster.updated_at = Utc::now();
        let key = self.cluster_key(&cluster.id);
        let json = Self::encode(&cluster)?;

        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, json, None)]);

        let mut client = self.client.lock().await;
        let response = client
            .txn(txn)
            .await
            .map_err(|e| StateStoreError::TransactionError(format!("etcd txn failed: {}", e)))?;
        if !response.succeeded() {
            return Err(StateStoreError::AlreadyExists(cluster.id.to_string()).into());
        }
        Ok(cluster)
    }

    async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
        let key = self.cluster_key(cluster_id);
        self.get_value(key).await
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let prefix = self.clusters_prefix();
        let mut clusters: Vec<Cluster> = self.list_with_prefix(prefix).await?;
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn update_cluster(&self, mut cluster: Cluster, expected_version: u64) -> Result<Cluster> {
        let cluster_id = cluster.id;
        cluster.version = expected_version + 1;
        cluster.updated_at = Utc::now();
        let key = self.cluster_key(&cluster_id);
        let json = Self::encode(&cluster)?;

        let txn = Txn::new()
            .when(vec![Compare::version(
                key.clone(),
                CompareOp::Equal,
                expected_version as i64,
            )])
            .and_then(vec![TxnOp::put(key.clone(), json, None)])
            .or_else(vec![TxnOp::get(key, None)]);

        let mut client = self.client.lock().await;
        let response = client
            .txn(txn)
            .await
            .map_err(|e| StateStoreError::TransactionError(format!("etcd txn failed: {}", e)))?;
        if response.succeeded() {
            return Ok(cluster);
        }

        // Compare failed: report what is actually stored
        let found = response.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get.kvs().first().map(|kv| kv.version()),
            _ => None,
        });
        match found {
            Some(found) => Err(OrchestrationError::ConcurrentModification {
                cluster_id,
                expected: expected_version,
                found: found as u64,
            }),
            None => Err(OrchestrationError::ClusterNotFound(cluster_id.to_string())),
        }
    }

    async fn delete_cluster(&self, cluster_id: &ClusterId) -> Result<()> {
        let txn = Txn::new().and_then(vec![
            TxnOp::delete(self.cluster_key(cluster_id), None),
            TxnOp::delete(self.nodes_prefix(cluster_id), Some(DeleteOptions::new().with_prefix())),
            TxnOp::delete(self.tasks_prefix(cluster_id), Some(DeleteOptions::new().with_prefix())),
        ]);

        let mut client = self.client.lock().await;
        client
            .txn(txn)
            .await
            .map_err(|e| StateStoreError::TransactionError(format!("etcd txn failed: {}", e)))?;
        Ok(())
    }

    // ===== Node Operations =====

    async fn put_node(&self, node: ClusterNode) -> Result<()> {
        let key = self.node_key(&node.cluster_id, &node.id);
        self.put_value(key, &node).await
    }

    async fn get_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<Option<ClusterNode>> {
        let key = self.node_key(cluster_id, node_id);
        self.get_value(key).await
    }

    async fn list_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<ClusterNode>> {
        let prefix = self.nodes_prefix(cluster_id);
        let mut nodes: Vec<ClusterNode> = self.list_with_prefix(prefix).await?;
        nodes.sort_by(|a, b| (a.role as u8, a.ordinal).cmp(&(b.role as u8, b.ordinal)));
        Ok(nodes)
    }

    async fn delete_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<()> {
        let key = self.node_key(cluster_id, node_id);
        self.delete_key(key).await
    }

    // ===== Task Operations =====

    async fn put_task(&self, task: Task) -> Result<()> {
        let key = self.task_key(&task.cluster_id, &task.id);
        self.put_value(key, &task).await
    }

    async fn get_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<Option<Task>> {
        let key = self.task_key(cluster_id, task_id);
        self.get_value(key).await
    }

    async fn list_tasks_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Task>> {
        let prefix = self.tasks_prefix(cluster_id);
        let mut tasks: Vec<Task> = self.list_with_prefix(prefix).await?;
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn delete_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<()> {
        let key = self.task_key(cluster_id, task_id);
        self.delete_key(key).await
    }
}
