use async_trait::async_trait;
use chrono::Utc;
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, NodeId, OrchestrationError, Result, Task, TaskId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{StateStore, StateStoreError};

/// In-memory implementation of StateStore
///
/// This implementation uses RwLock-protected HashMaps for thread-safe
/// in-memory storage. Suitable for testing, development, and single-node
/// deployments where persistence across restarts is not required.
pub struct InMemoryStateStore {
    clusters: Arc<RwLock<HashMap<ClusterId, Cluster>>>,
    nodes: Arc<RwLock<HashMap<ClusterId, HashMap<NodeId, ClusterNode>>>>,
    tasks: Arc<RwLock<HashMap<ClusterId, HashMap<TaskId, Task>>>>,
}

impl InMemoryStateStore {
    /// Create a new in-memory state store
    pub fn new() -> Self {
        Self {
            clusters: Arc::new(RwLock::new(HashMap::new())),
            nodes: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn initialize(&self) -> Result<()> {
        // No initialization needed for in-memory store
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        // In-memory store is always healthy
        Ok(true)
    }

    // ===== Cluster Operations =====

    async fn insert_cluster(&self, mut cluster: Cluster) -> Result<Cluster> {
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(&cluster.id) {
            return Err(StateStoreError::AlreadyExists(cluster.id.to_string()).into());
        }
        cluster.version = 1;
        cluster.updated_at = Utc::now();
        clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
        let clusters = self.clusters.read().await;
        Ok(clusters.get(cluster_id).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let clusters = self.clusters.read().await;
        let mut all: Vec<Cluster> = clusters.values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn update_cluster(&self, mut cluster: Cluster, expected_version: u64) -> Result<Cluster> {
        // Compare and write under one write lock
        let mut clusters = self.clusters.write().await;
        let stored = clusters
            .get(&cluster.id)
            .ok_or_else(|| OrchestrationError::ClusterNotFound(cluster.id.to_string()))?;
        if stored.version != expected_version {
            return Err(OrchestrationError::ConcurrentModification {
                cluster_id: cluster.id,
                expected: expected_version,
                found: stored.version,
            });
        }
        cluster.version = expected_version + 1;
        cluster.updated_at = Utc::now();
        clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn delete_cluster(&self, cluster_id: &ClusterId) -> Result<()> {
        self.clusters.write().await.remove(cluster_id);
        self.nodes.write().await.remove(cluster_id);
        self.tasks.write().await.remove(cluster_id);
        Ok(())
    }

    // ===== Node Operations =====

    async fn put_node(&self, node: ClusterNode) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        nodes.entry(node.cluster_id).or_default().insert(node.id, node);
        Ok(())
    }

    async fn get_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<Option<ClusterNode>> {
        let nodes = self.nodes.read().await;
        Ok(nodes.get(cluster_id).and_then(|m| m.get(node_id)).cloned())
    }

    async fn list_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<ClusterNode>> {
        let nodes = self.nodes.read().await;
        let mut list: Vec<ClusterNode> = nodes
            .get(cluster_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| (a.role as u8, a.ordinal).cmp(&(b.role as u8, b.ordinal)));
        Ok(list)
    }

    async fn delete_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if let Some(m) = nodes.get_mut(cluster_id) {
            m.remove(node_id);
        }
        Ok(())
    }

    // ===== Task Operations =====

    async fn put_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.entry(task.cluster_id).or_default().insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(cluster_id).and_then(|m| m.get(task_id)).cloned())
    }

    async fn list_tasks_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<Task> = tasks
            .get(cluster_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by_key(|t| t.created_at);
        Ok(list)
    }

    async fn delete_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(m) = tasks.get_mut(cluster_id) {
            m.remove(task_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_shared_types::{
        ClusterCredentials, ClusterStatus, NodeResources, NodeRole, NodeStatus, SealedSecret,
        TaskType,
    };
    use uuid::Uuid;

    fn sealed() -> SealedSecret {
        SealedSecret::from_armored("sealed")
    }

    fn test_cluster() -> Cluster {
        let credentials = ClusterCredentials {
            root_password: sealed(),
            replication_user: "repl".into(),
            replication_password: sealed(),
            app_user: "app".into(),
            app_password: sealed(),
            monitor_user: "monitor".into(),
            monitor_password: sealed(),
            router_admin_user: "radmin".into(),
            router_admin_password: sealed(),
            router_admin_rotated: false,
        };
        Cluster::provisioning("alice", "orders", "8.0", 2, credentials)
    }

    fn test_node(cluster_id: ClusterId, role: NodeRole, ordinal: u32) -> ClusterNode {
        ClusterNode {
            id: Uuid::new_v4(),
            cluster_id,
            container_id: format!("c-{}", ordinal),
            container_name: format!("n-{}", ordinal),
            role,
            hostname: format!("h-{}", ordinal),
            address: None,
            port: 3306,
            status: NodeStatus::Running,
            resources: NodeResources::default(),
            read_only: role != NodeRole::Primary,
            ordinal,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_sets_version_one() {
        let store = InMemoryStateStore::new();
        let stored = store.insert_cluster(test_cluster()).await.unwrap();
        assert_eq!(stored.version, 1);
        assert!(store.insert_cluster(stored.clone()).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected_without_mutation() {
        let store = InMemoryStateStore::new();
        let stored = store.insert_cluster(test_cluster()).await.unwrap();

        let mut first = stored.clone();
        first.status = ClusterStatus::Healthy;
        let first = store.update_cluster(first, stored.version).await.unwrap();
        assert_eq!(first.version, 2);

        // Second writer still holds version 1
        let mut stale = stored.clone();
        stale.status = ClusterStatus::Failed;
        let err = store.update_cluster(stale, stored.version).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::ConcurrentModification { expected: 1, found: 2, .. }
        ));

        let current = store.get_cluster(&stored.id).await.unwrap().unwrap();
        assert_eq!(current.status, ClusterStatus::Healthy);
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn test_update_missing_cluster() {
        let store = InMemoryStateStore::new();
        let err = store.update_cluster(test_cluster(), 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = InMemoryStateStore::new();
        let cluster = store.insert_cluster(test_cluster()).await.unwrap();
        store.put_node(test_node(cluster.id, NodeRole::Primary, 0)).await.unwrap();
        store.put_node(test_node(cluster.id, NodeRole::Replica, 1)).await.unwrap();
        store.put_task(Task::new(cluster.id, TaskType::Provision)).await.unwrap();

        store.delete_cluster(&cluster.id).await.unwrap();
        assert!(store.get_cluster(&cluster.id).await.unwrap().is_none());
        assert!(store.list_nodes_for_cluster(&cluster.id).await.unwrap().is_empty());
        assert!(store.list_tasks_for_cluster(&cluster.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nodes_sorted_by_role_then_ordinal() {
        let store = InMemoryStateStore::new();
        let cid = Uuid::new_v4();
        store.put_node(test_node(cid, NodeRole::Replica, 2)).await.unwrap();
        store.put_node(test_node(cid, NodeRole::Primary, 0)).await.unwrap();
        store.put_node(test_node(cid, NodeRole::Replica, 1)).await.unwrap();

        let nodes = store.list_nodes_for_cluster(&cid).await.unwrap();
        let order: Vec<(NodeRole, u32)> = nodes.iter().map(|n| (n.role, n.ordinal)).collect();
        assert_eq!(
            order,
            vec![(NodeRole::Primary, 0), (NodeRole::Replica, 1), (NodeRole::Replica, 2)]
        );
    }

    #[tokio::test]
    async fn test_task_operations() {
        let store = InMemoryStateStore::new();
        let cid = Uuid::new_v4();
        let task = Task::new(cid, TaskType::Scale);
        store.put_task(task.clone()).await.unwrap();
        assert_eq!(store.get_task(&cid, &task.id).await.unwrap(), Some(task.clone()));
        assert!(store.get_task(&Uuid::new_v4(), &task.id).await.unwrap().is_none());

        store.delete_task(&cid, &task.id).await.unwrap();
        assert!(store.get_task(&cid, &task.id).await.unwrap().is_none());
        store.delete_task(&cid, &task.id).await.unwrap();
    }
}
