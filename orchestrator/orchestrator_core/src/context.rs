//! Everything a workflow needs, bundled once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use container_runtime_interface::ContainerRuntime;
use observability::{AlertSeverity, NotificationSink, OrchestratorMetrics, StreamEvent};
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, ClusterStatus, ContainerId, NodeRole, OrchestrationError,
    Result, Task, TaskType,
};
use query_router_interface::{QueryRouter, RouterEndpoint, RouterTarget};
use state_store_interface::StateStore;

use crate::cas::{CasPolicy, ClusterCas};
use crate::config::OrchestratorConfig;
use crate::credentials::{CredentialVault, OpenedCredentials};
use crate::naming::{cluster_alias, ClusterNaming};
use crate::participant::DatabaseAccess;
use crate::replication::EngineVersion;
use crate::tasks::TaskTracker;

#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub router: Arc<dyn QueryRouter>,
    pub notifier: Arc<dyn NotificationSink>,
    pub vault: Arc<CredentialVault>,
    pub config: Arc<OrchestratorConfig>,
    pub metrics: OrchestratorMetrics,
    pub tracker: TaskTracker,
    pub cas: ClusterCas,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<dyn QueryRouter>,
        notifier: Arc<dyn NotificationSink>,
        vault: Arc<CredentialVault>,
        config: OrchestratorConfig,
    ) -> Self {
        let metrics = OrchestratorMetrics::new();
        let policy = CasPolicy {
            max_attempts: config.workflows.cas_max_attempts,
            initial_backoff: Duration::from_millis(config.workflows.cas_initial_backoff_ms),
        };
        Self {
            tracker: TaskTracker::new(store.clone()),
            cas: ClusterCas::new(store.clone(), policy, metrics.clone()),
            store,
            runtime,
            router,
            notifier,
            vault,
            config: Arc::new(config),
            metrics,
        }
    }

    pub fn naming(&self, cluster_id: &ClusterId) -> ClusterNaming {
        ClusterNaming::new(&self.config.naming.container_prefix, cluster_id)
    }

    pub fn alias(&self, cluster_id: &ClusterId) -> String {
        cluster_alias(&self.config.naming.alias_prefix, cluster_id)
    }

    pub fn credentials(&self, cluster: &Cluster) -> Result<OpenedCredentials> {
        self.vault.open_all(&cluster.credentials)
    }

    pub fn database_access(&self, cluster: &Cluster) -> Result<DatabaseAccess> {
        Ok(DatabaseAccess {
            root_password: self.vault.open(&cluster.credentials.root_password)?,
            version: EngineVersion::parse(&cluster.engine_version)?,
        })
    }

    /// Admin endpoint of the cluster's router, logged in with the rotated credential.
    pub fn router_endpoint(&self, cluster: &Cluster) -> Result<RouterEndpoint> {
        Ok(RouterEndpoint {
            cluster_id: cluster.id,
            host: self.naming(&cluster.id).router(),
            admin_port: self.config.router.admin_port,
            admin_user: cluster.credentials.router_admin_user.clone(),
            admin_password: self.vault.open(&cluster.credentials.router_admin_password)?,
        })
    }

    pub fn router_target(&self, cluster_id: ClusterId, hostname: &str) -> Result<RouterTarget> {
        RouterTarget::new(hostname, self.config.workflows.mysql_port)
            .map_err(|e| e.into_operation_error("resolve_target", cluster_id))
    }

    /// Bounded readiness wait; the deadline passing is `ContainerNotReady`.
    pub async fn wait_ready(&self, container_id: &ContainerId, name: &str) -> Result<()> {
        let policy = self.config.readiness.container_policy();
        if self.runtime.wait_ready(container_id, policy).await? {
            Ok(())
        } else {
            Err(OrchestrationError::ContainerNotReady {
                container: name.to_string(),
                waited: policy.timeout,
            })
        }
    }

    pub async fn nodes_with_role(&self, cluster_id: &ClusterId, role: NodeRole) -> Result<Vec<ClusterNode>> {
        let mut nodes: Vec<ClusterNode> = self
            .store
            .list_nodes_for_cluster(cluster_id)
            .await?
            .into_iter()
            .filter(|n| n.role == role)
            .collect();
        nodes.sort_by_key(|n| n.ordinal);
        Ok(nodes)
    }

    /// Compare-and-swap update that also enforces the lifecycle table.
    ///
    /// A status change made by `mutate` must be a legal transition. Entering
    /// `HEALTHY` from another status clears the recorded error unless
    /// `mutate` set a new one. Transitions are announced after the write lands.
    pub async fn update_cluster<F>(&self, cluster_id: &ClusterId, mut mutate: F) -> Result<Cluster>
    where
        F: FnMut(&mut Cluster) -> Result<()> + Send,
    {
        let mut from = None;
        let written = self
            .cas
            .update(cluster_id, |cluster| {
                let before = cluster.status;
                let before_error = cluster.error_message.clone();
                mutate(cluster)?;
                if cluster.status != before {
                    if !before.can_transition_to(cluster.status) {
                        return Err(OrchestrationError::InvalidState {
                            cluster_id: cluster.id,
                            status: before,
                            operation: format!("transition to {}", cluster.status),
                        });
                    }
                    if cluster.status == ClusterStatus::Healthy && cluster.error_message == before_error {
                        cluster.error_message = None;
                    }
                }
                cluster.updated_at = Utc::now();
                from = Some(before);
                Ok(())
            })
            .await?;

        if let Some(from) = from.filter(|f| *f != written.status) {
            self.announce_transition(&written, from).await;
        }
        Ok(written)
    }

    async fn announce_transition(&self, cluster: &Cluster, from: ClusterStatus) {
        info!(cluster_id = %cluster.id, %from, to = %cluster.status, "cluster status changed");
        self.metrics
            .status_transition(&from.to_string(), &cluster.status.to_string());
        self.notifier
            .publish(StreamEvent::status_changed(&cluster.id, from, cluster.status))
            .await;
        let alert = match cluster.status {
            ClusterStatus::Failed => Some(AlertSeverity::Critical),
            ClusterStatus::Degraded => Some(AlertSeverity::Warning),
            _ => None,
        };
        if let Some(severity) = alert {
            let message = match &cluster.error_message {
                Some(reason) => format!("cluster {} is {}: {}", cluster.name, cluster.status, reason),
                None => format!("cluster {} is {}", cluster.name, cluster.status),
            };
            self.notifier
                .publish(StreamEvent::alert(&cluster.id, severity, message))
                .await;
        }
    }

    /// Claims the cluster for one structural workflow.
    ///
    /// Rejects when `precondition` fails or another structural task is in
    /// flight. The claim itself is a conditional write at the version the
    /// checks ran against, so two callers racing past the task check cannot
    /// both win. The loser's task is discarded and never shows up in task
    /// listings.
    pub async fn begin_structural<P>(
        &self,
        cluster_id: &ClusterId,
        task_type: TaskType,
        precondition: P,
    ) -> Result<(Cluster, Task)>
    where
        P: Fn(&Cluster) -> Result<()>,
    {
        let cluster = self.store.require_cluster(cluster_id).await?;
        precondition(&cluster)?;
        if let Some(active) = self.tracker.active_structural(cluster_id).await? {
            return Err(self.rejected(task_type, &active));
        }

        let task = self.tracker.create(*cluster_id, task_type).await?;
        match self.cas.write_at(cluster).await {
            Ok(claimed) => {
                let task = self.tracker.mark_running(&task).await?;
                Ok((claimed, task))
            }
            Err(err) => {
                if let Err(cleanup) = self.store.delete_task(cluster_id, &task.id).await {
                    warn!(task_id = %task.id, error = %cleanup, "could not discard unclaimed task");
                }
                if !matches!(err, OrchestrationError::ConcurrentModification { .. }) {
                    return Err(err);
                }
                let competitor = self
                    .store
                    .list_tasks_for_cluster(cluster_id)
                    .await?
                    .into_iter()
                    .find(|t| t.id != task.id && t.is_active_structural());
                match competitor {
                    Some(active) => Err(self.rejected(task_type, &active)),
                    None => Err(err),
                }
            }
        }
    }

    fn rejected(&self, wanted: TaskType, active: &Task) -> OrchestrationError {
        self.metrics.operation_rejected(&wanted.to_string());
        OrchestrationError::OperationInProgress {
            cluster_id: active.cluster_id,
            task_id: active.id,
            task_type: active.task_type,
        }
    }

    /// Terminal bookkeeping for a workflow: task status, metrics, notification.
    pub async fn finish<T>(&self, task: &Task, started: Instant, outcome: &Result<T>) {
        let finished = match outcome {
            Ok(_) => self.tracker.complete(task).await,
            Err(err) => self.tracker.fail(task, err.to_string()).await,
        };
        if let Err(err) = finished {
            warn!(task_id = %task.id, error = %err, "could not finalize task");
        }
        let succeeded = outcome.is_ok();
        self.metrics.workflow_finished(
            &task.task_type.to_string(),
            if succeeded { "succeeded" } else { "failed" },
            started.elapsed().as_secs_f64(),
        );
        self.notifier
            .publish(StreamEvent::task_finished(
                &task.cluster_id,
                &task.id,
                task.task_type,
                succeeded,
            ))
            .await;
    }

    /// Appends to the task log. A log write that fails never fails the workflow.
    pub async fn log(&self, task: &Task, line: impl AsRef<str>) {
        if let Err(err) = self.tracker.append_log(task, line).await {
            warn!(task_id = %task.id, error = %err, "could not append task log");
        }
    }
}
