//! Shared harness: the engine wired to in-memory collaborators.

#![allow(dead_code)]

mod store;

use std::sync::Arc;
use std::time::Duration;

use container_runtime::MockRuntime;
use container_runtime_interface::ExecOutput;
use observability::EventHub;
use orchestrator_core::{CreateClusterRequest, CredentialVault, Orchestrator, OrchestratorConfig};
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, NodeRole, OrchestrationError, Task, TaskId,
};
use query_router::MockRouter;
use state_store_interface::StateStore;

pub use store::ScriptedStore;

pub const REPLICATING: &str = "Replica_IO_Running: Yes\nReplica_SQL_Running: Yes\n";

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub runtime: Arc<MockRuntime>,
    pub router: Arc<MockRouter>,
    pub store: Arc<ScriptedStore>,
    pub events: Arc<EventHub>,
}

/// Short waits everywhere so timeouts resolve in about a second.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.readiness.timeout_secs = 1;
    config.readiness.poll_interval_ms = 10;
    config.readiness.replication_timeout_secs = 1;
    config.workflows.cas_initial_backoff_ms = 1;
    config.secrets.password_length = 16;
    config
}

pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

pub async fn harness_with(config: OrchestratorConfig) -> Harness {
    let runtime = Arc::new(MockRuntime::new());
    runtime
        .respond_to_exec(
            "SHOW REPLICA STATUS",
            ExecOutput {
                exit_code: 0,
                stdout: REPLICATING.to_string(),
                stderr: String::new(),
            },
        )
        .await;
    let router = Arc::new(MockRouter::new());
    let store = Arc::new(ScriptedStore::new());
    let events = Arc::new(EventHub::new(256));
    let orchestrator = Orchestrator::new(
        store.clone(),
        runtime.clone(),
        router.clone(),
        events.clone(),
        Arc::new(CredentialVault::generate()),
        config,
    );
    Harness {
        orchestrator,
        runtime,
        router,
        store,
        events,
    }
}

pub fn create_request(name: &str, replicas: u32) -> CreateClusterRequest {
    CreateClusterRequest {
        name: name.to_string(),
        owner: "team-a".to_string(),
        engine_version: None,
        replica_count: replicas,
        resources: None,
        features: None,
    }
}

/// Polls until the task reaches a terminal status.
pub async fn wait_for_task_on(orchestrator: &Orchestrator, cluster_id: &ClusterId, task_id: &TaskId) -> Task {
    for _ in 0..1000 {
        let task = orchestrator
            .get_task(cluster_id, task_id)
            .await
            .expect("task exists");
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} did not finish", task_id);
}

impl Harness {
    pub async fn wait_for_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Task {
        wait_for_task_on(&self.orchestrator, cluster_id, task_id).await
    }

    /// Polls until the cluster record is gone.
    pub async fn wait_for_removal(&self, cluster_id: &ClusterId) {
        for _ in 0..1000 {
            match self.orchestrator.get_cluster(cluster_id).await {
                Err(OrchestrationError::ClusterNotFound(_)) => return,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("cluster {} was not removed", cluster_id);
    }

    /// Creates a cluster and waits for provisioning to finish.
    pub async fn provisioned(&self, name: &str, replicas: u32) -> Cluster {
        let (cluster, task_id) = self
            .orchestrator
            .create_cluster(create_request(name, replicas))
            .await
            .expect("create accepted");
        let task = self.wait_for_task(&cluster.id, &task_id).await;
        assert!(task.error.is_none(), "provisioning failed: {:?}", task.error);
        self.orchestrator.get_cluster(&cluster.id).await.expect("cluster exists")
    }

    pub async fn nodes(&self, cluster_id: &ClusterId) -> Vec<ClusterNode> {
        self.store.list_nodes_for_cluster(cluster_id).await.expect("nodes")
    }

    pub async fn nodes_with_role(&self, cluster_id: &ClusterId, role: NodeRole) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self
            .nodes(cluster_id)
            .await
            .into_iter()
            .filter(|n| n.role == role)
            .collect();
        nodes.sort_by_key(|n| n.ordinal);
        nodes
    }

    pub async fn node_by_host(&self, cluster_id: &ClusterId, hostname: &str) -> ClusterNode {
        self.nodes(cluster_id)
            .await
            .into_iter()
            .find(|n| n.hostname == hostname)
            .expect("node exists")
    }
}
