//! In-memory store with injectable faults and forced interleaving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, NodeId, OrchestrationError, Result, Task, TaskId,
};
use state_store_interface::in_memory::InMemoryStateStore;
use state_store_interface::StateStore;

pub struct ScriptedStore {
    inner: InMemoryStateStore,
    yield_after_task_reads: AtomicBool,
    node_listing_fault: Mutex<Option<u32>>,
    cluster_update_fault: Mutex<Option<u32>>,
}

/// `Some(n)`: let `n` calls through, fail the next one, then recover.
fn take_fault(slot: &Mutex<Option<u32>>) -> bool {
    let mut slot = slot.lock().unwrap();
    match *slot {
        Some(0) => {
            *slot = None;
            true
        }
        Some(n) => {
            *slot = Some(n - 1);
            false
        }
        None => false,
    }
}

fn injected(what: &str) -> OrchestrationError {
    OrchestrationError::StateError(format!("injected {} failure", what))
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            yield_after_task_reads: AtomicBool::new(false),
            node_listing_fault: Mutex::new(None),
            cluster_update_fault: Mutex::new(None),
        }
    }

    /// Every task listing yields to the scheduler before returning, so two
    /// concurrent callers both read the task list before either writes.
    pub fn interleave_task_reads(&self, enabled: bool) {
        self.yield_after_task_reads.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_node_listing_after(&self, successes: u32) {
        *self.node_listing_fault.lock().unwrap() = Some(successes);
    }

    pub fn fail_cluster_update_after(&self, successes: u32) {
        *self.cluster_update_fault.lock().unwrap() = Some(successes);
    }
}

#[async_trait]
impl StateStore for ScriptedStore {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }
    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }
    async fn insert_cluster(&self, cluster: Cluster) -> Result<Cluster> {
        self.inner.insert_cluster(cluster).await
    }
    async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
        self.inner.get_cluster(cluster_id).await
    }
    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        self.inner.list_clusters().await
    }
    async fn update_cluster(&self, cluster: Cluster, expected_version: u64) -> Result<Cluster> {
        if take_fault(&self.cluster_update_fault) {
            return Err(injected("cluster update"));
        }
        self.inner.update_cluster(cluster, expected_version).await
    }
    async fn delete_cluster(&self, cluster_id: &ClusterId) -> Result<()> {
        self.inner.delete_cluster(cluster_id).await
    }
    async fn put_node(&self, node: ClusterNode) -> Result<()> {
        self.inner.put_node(node).await
    }
    async fn get_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<Option<ClusterNode>> {
        self.inner.get_node(cluster_id, node_id).await
    }
    async fn list_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<ClusterNode>> {
        if take_fault(&self.node_listing_fault) {
            return Err(injected("node listing"));
        }
        self.inner.list_nodes_for_cluster(cluster_id).await
    }
    async fn delete_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<()> {
        self.inner.delete_node(cluster_id, node_id).await
    }
    async fn put_task(&self, task: Task) -> Result<()> {
        self.inner.put_task(task).await
    }
    async fn get_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<Option<Task>> {
        self.inner.get_task(cluster_id, task_id).await
    }
    async fn list_tasks_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Task>> {
        let tasks = self.inner.list_tasks_for_cluster(cluster_id).await?;
        if self.yield_after_task_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(tasks)
    }
    async fn delete_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<()> {
        self.inner.delete_task(cluster_id, task_id).await
    }
}
