//! Compare-and-swap writes of cluster records.
//!
//! Every mutation reads the current record, applies a closure and writes it
//! back conditioned on the version it read. On a version mismatch the record
//! is reloaded and the closure applied again, a bounded number of times with
//! exponential backoff. The closure re-checks its own preconditions on each
//! attempt; returning an error aborts without writing.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use observability::OrchestratorMetrics;
use orchestrator_shared_types::{Cluster, ClusterId, OrchestrationError, Result};
use state_store_interface::StateStore;

#[derive(Debug, Clone, Copy)]
pub struct CasPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for CasPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Clone)]
pub struct ClusterCas {
    store: Arc<dyn StateStore>,
    policy: CasPolicy,
    metrics: OrchestratorMetrics,
}

impl ClusterCas {
    pub fn new(store: Arc<dyn StateStore>, policy: CasPolicy, metrics: OrchestratorMetrics) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    /// Applies `mutate` to the latest stored cluster and writes it back.
    pub async fn update<F>(&self, cluster_id: &ClusterId, mut mutate: F) -> Result<Cluster>
    where
        F: FnMut(&mut Cluster) -> Result<()> + Send,
    {
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;
        loop {
            let current = self.store.require_cluster(cluster_id).await?;
            let expected = current.version;
            let mut next = current;
            mutate(&mut next)?;

            match self.store.update_cluster(next, expected).await {
                Ok(written) => return Ok(written),
                Err(OrchestrationError::ConcurrentModification { found, .. })
                    if attempt < self.policy.max_attempts =>
                {
                    self.metrics.cas_conflict();
                    debug!(
                        cluster_id = %cluster_id,
                        expected,
                        found,
                        attempt,
                        "cluster changed underneath, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => {
                    if matches!(err, OrchestrationError::ConcurrentModification { .. }) {
                        self.metrics.cas_conflict();
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One conditional write against the version the caller already holds.
    /// No retry: a conflict means the caller's view is stale.
    pub async fn write_at(&self, cluster: Cluster) -> Result<Cluster> {
        let expected = cluster.version;
        let result = self.store.update_cluster(cluster, expected).await;
        if matches!(result, Err(OrchestrationError::ConcurrentModification { .. })) {
            self.metrics.cas_conflict();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orchestrator_shared_types::{ClusterCredentials, ClusterNode, NodeId, SealedSecret, Task, TaskId};
    use state_store_interface::in_memory::InMemoryStateStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn credentials() -> ClusterCredentials {
        let s = || SealedSecret::from_armored("x");
        ClusterCredentials {
            root_password: s(),
            replication_user: "repl".into(),
            replication_password: s(),
            app_user: "app".into(),
            app_password: s(),
            monitor_user: "monitor".into(),
            monitor_password: s(),
            router_admin_user: "radmin".into(),
            router_admin_password: s(),
            router_admin_rotated: false,
        }
    }

    fn fast() -> CasPolicy {
        CasPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    /// Interferes with the first `conflicts` writes by bumping the record first.
    struct Contended {
        inner: InMemoryStateStore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl StateStore for Contended {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> Result<bool> {
            Ok(true)
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
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                let current = self.inner.require_cluster(&cluster.id).await?;
                let version = current.version;
                self.inner.update_cluster(current, version).await?;
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
            self.inner.list_tasks_for_cluster(cluster_id).await
        }
        async fn delete_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<()> {
            self.inner.delete_task(cluster_id, task_id).await
        }
    }

    async fn contended(conflicts: u32) -> (Arc<Contended>, Cluster) {
        let store = Arc::new(Contended {
            inner: InMemoryStateStore::new(),
            conflicts: AtomicU32::new(0),
        });
        let cluster = store
            .insert_cluster(Cluster::provisioning("alice", "orders", "8.0.36", 1, credentials()))
            .await
            .unwrap();
        store.conflicts.store(conflicts, Ordering::SeqCst);
        (store, cluster)
    }

    #[tokio::test]
    async fn test_update_retries_after_conflict() {
        let (store, cluster) = contended(2).await;
        let cas = ClusterCas::new(store.clone(), fast(), OrchestratorMetrics::new());

        let mut calls = 0;
        let written = cas
            .update(&cluster.id, |c| {
                calls += 1;
                c.replica_count = 5;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(written.replica_count, 5);
        // insert = 1, two interfering bumps, then our write
        assert_eq!(written.version, 4);
    }

    #[tokio::test]
    async fn test_update_gives_up_after_max_attempts() {
        let (store, cluster) = contended(10).await;
        let cas = ClusterCas::new(store.clone(), fast(), OrchestratorMetrics::new());

        let err = cas
            .update(&cluster.id, |c| {
                c.replica_count = 5;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ConcurrentModification { .. }));
        let stored = store.require_cluster(&cluster.id).await.unwrap();
        assert_eq!(stored.replica_count, 1);
    }

    #[tokio::test]
    async fn test_closure_error_aborts_without_write() {
        let (store, cluster) = contended(0).await;
        let cas = ClusterCas::new(store.clone(), fast(), OrchestratorMetrics::new());

        let err = cas
            .update(&cluster.id, |_| Err(OrchestrationError::Validation("nope".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
        assert_eq!(store.require_cluster(&cluster.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_write_at_stale_version_fails() {
        let (store, cluster) = contended(1).await;
        let cas = ClusterCas::new(store.clone(), fast(), OrchestratorMetrics::new());

        let mut stale = cluster.clone();
        stale.name = "renamed".into();
        assert!(cas.write_at(stale).await.is_err());
        assert_eq!(store.require_cluster(&cluster.id).await.unwrap().name, "orders");
    }
}
