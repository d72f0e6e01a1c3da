#[cfg(feature = "rest-api")]
pub mod api;

pub mod cas;
pub mod config;
pub mod context;
pub mod credentials;
pub mod naming;
pub mod participant;
pub mod replication;
pub mod tasks;
pub mod workflows;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use container_runtime_interface::{ContainerRuntime, ContainerStats, LogOptions};
use observability::NotificationSink;
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, NodeId, NodeRole, OrchestrationError, Result, Task, TaskId,
};
use query_router_interface::QueryRouter;
use state_store_interface::StateStore;

pub use config::OrchestratorConfig;
pub use context::EngineContext;
pub use credentials::CredentialVault;
pub use workflows::failover::FailoverOutcome;
pub use workflows::{CreateClusterRequest, FailoverEvent, ScaleRequest};

use workflows::{failover, health, lifecycle, provisioning, scaling};

/// Entry point for everything that changes or inspects a cluster.
///
/// Structural operations validate and claim the cluster synchronously, then
/// run in the background; the returned task id is how callers follow them.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: EngineContext,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<dyn QueryRouter>,
        notifier: Arc<dyn NotificationSink>,
        vault: Arc<CredentialVault>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ctx: EngineContext::new(store, runtime, router, notifier, vault, config),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub async fn create_cluster(&self, request: CreateClusterRequest) -> Result<(Cluster, TaskId)> {
        let (cluster, task) = provisioning::begin(&self.ctx, request).await?;
        let task_id = task.id;
        let ctx = self.ctx.clone();
        let cluster_id = cluster.id;
        tokio::spawn(async move {
            if let Err(e) = provisioning::run(&ctx, cluster_id, task).await {
                error!(cluster_id = %cluster_id, error = %e, "provisioning failed");
            }
        });
        Ok((cluster, task_id))
    }

    pub async fn scale_cluster(&self, cluster_id: &ClusterId, request: ScaleRequest) -> Result<TaskId> {
        let task = scaling::begin(&self.ctx, cluster_id, &request).await?;
        let task_id = task.id;
        let ctx = self.ctx.clone();
        let cluster_id = *cluster_id;
        tokio::spawn(async move {
            if let Err(e) = scaling::run(&ctx, cluster_id, request, task).await {
                error!(cluster_id = %cluster_id, error = %e, "scaling failed");
            }
        });
        Ok(task_id)
    }

    pub async fn delete_cluster(&self, cluster_id: &ClusterId) -> Result<TaskId> {
        let task = lifecycle::begin_delete(&self.ctx, cluster_id).await?;
        let task_id = task.id;
        let ctx = self.ctx.clone();
        let cluster_id = *cluster_id;
        tokio::spawn(async move {
            if let Err(e) = lifecycle::run_delete(&ctx, cluster_id, task).await {
                error!(cluster_id = %cluster_id, error = %e, "delete failed");
            }
        });
        Ok(task_id)
    }

    pub async fn stop_cluster(&self, cluster_id: &ClusterId) -> Result<TaskId> {
        let task = lifecycle::begin_stop(&self.ctx, cluster_id).await?;
        let task_id = task.id;
        let ctx = self.ctx.clone();
        let cluster_id = *cluster_id;
        tokio::spawn(async move {
            if let Err(e) = lifecycle::run_stop(&ctx, cluster_id, task).await {
                error!(cluster_id = %cluster_id, error = %e, "stop failed");
            }
        });
        Ok(task_id)
    }

    pub async fn start_cluster(&self, cluster_id: &ClusterId) -> Result<TaskId> {
        let task = lifecycle::begin_start(&self.ctx, cluster_id).await?;
        let task_id = task.id;
        let ctx = self.ctx.clone();
        let cluster_id = *cluster_id;
        tokio::spawn(async move {
            if let Err(e) = lifecycle::run_start(&ctx, cluster_id, task).await {
                error!(cluster_id = %cluster_id, error = %e, "start failed");
            }
        });
        Ok(task_id)
    }

    /// Reconciles a monitor event before returning.
    pub async fn handle_failover(&self, event: FailoverEvent) -> Result<FailoverOutcome> {
        failover::handle(&self.ctx, event).await
    }

    pub async fn refresh_health(&self, cluster_id: &ClusterId) -> Result<Cluster> {
        health::refresh_cluster(&self.ctx, cluster_id).await
    }

    pub async fn refresh_all(&self) -> Result<()> {
        let counts = health::refresh_all(&self.ctx).await?;
        debug!(?counts, "health refresh round finished");
        Ok(())
    }

    /// Refreshes every cluster on a fixed interval until the handle is aborted.
    pub fn spawn_health_loop(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "health refresh loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = this.refresh_all().await {
                    error!(error = %e, "health refresh round failed");
                }
            }
        })
    }

    pub async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Cluster> {
        self.ctx.store.require_cluster(cluster_id).await
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        self.ctx.store.list_clusters().await
    }

    pub async fn list_nodes(&self, cluster_id: &ClusterId) -> Result<Vec<ClusterNode>> {
        self.ctx.store.require_cluster(cluster_id).await?;
        let mut nodes = self.ctx.store.list_nodes_for_cluster(cluster_id).await?;
        // Primary, replicas, then router and monitor.
        nodes.sort_by_key(|n| (n.role != NodeRole::Primary, matches!(n.role, NodeRole::Router | NodeRole::Monitor), n.ordinal));
        Ok(nodes)
    }

    pub async fn list_tasks(&self, cluster_id: &ClusterId) -> Result<Vec<Task>> {
        self.ctx.store.require_cluster(cluster_id).await?;
        let mut tasks = self.ctx.store.list_tasks_for_cluster(cluster_id).await?;
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    pub async fn get_task(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<Task> {
        self.ctx.tracker.get(cluster_id, task_id).await
    }

    async fn require_node(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<ClusterNode> {
        self.ctx
            .store
            .get_node(cluster_id, node_id)
            .await?
            .ok_or_else(|| OrchestrationError::NodeNotFound(node_id.to_string()))
    }

    pub async fn node_stats(&self, cluster_id: &ClusterId, node_id: &NodeId) -> Result<ContainerStats> {
        let node = self.require_node(cluster_id, node_id).await?;
        self.ctx.runtime.stats(&node.container_id).await
    }

    pub async fn node_logs(&self, cluster_id: &ClusterId, node_id: &NodeId, options: &LogOptions) -> Result<String> {
        let node = self.require_node(cluster_id, node_id).await?;
        self.ctx.runtime.logs(&node.container_id, options).await
    }
}
