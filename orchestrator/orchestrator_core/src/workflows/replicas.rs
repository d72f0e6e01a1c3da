//! Bringing database containers up and wiring replicas to the primary.
//!
//! Shared by provisioning and scale-up. Replicas come up concurrently,
//! bounded by `workflows.replica_parallelism`; each one is recorded as a
//! node as soon as its container exists so a failure later on still leaves
//! a truthful record.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use secrecy::ExposeSecret;
use tracing::{debug, warn};
use uuid::Uuid;

use container_runtime_interface::ContainerSpec;
use orchestrator_shared_types::{
    ClusterId, ClusterNode, ContainerId, NodeResources, NodeRole, NodeStatus, OrchestrationError,
    Result, Task,
};

use crate::context::EngineContext;
use crate::credentials::OpenedCredentials;
use crate::naming::ClusterNaming;
use crate::replication::{
    mysql_health_check, mysqld_args, replica_setup_statements, EngineVersion, MysqlShell,
    PRIMARY_SERVER_ID, REPLICA_SERVER_ID_BASE,
};

pub const LABEL_CLUSTER: &str = "dbcluster.cluster-id";
pub const LABEL_ROLE: &str = "dbcluster.role";

/// Container spec for a MySQL node. Replicas start read-only.
#[allow(clippy::too_many_arguments)]
pub fn mysql_spec(
    ctx: &EngineContext,
    cluster_id: &ClusterId,
    name: &str,
    network: Option<&str>,
    engine_version: &str,
    creds: &OpenedCredentials,
    role: NodeRole,
    ordinal: u32,
    resources: &NodeResources,
) -> ContainerSpec {
    let replica = role == NodeRole::Replica;
    let server_id = if replica {
        REPLICA_SERVER_ID_BASE + ordinal
    } else {
        PRIMARY_SERVER_ID
    };
    let mut spec = ContainerSpec::new(name, ctx.config.images.mysql_image(engine_version));
    spec.network = network.map(str::to_string);
    spec.env.insert(
        "MYSQL_ROOT_PASSWORD".to_string(),
        creds.root_password.expose_secret().clone(),
    );
    spec.args = mysqld_args(server_id, replica);
    spec.labels.insert(LABEL_CLUSTER.to_string(), cluster_id.to_string());
    spec.labels.insert(LABEL_ROLE.to_string(), role.to_string());
    spec.resources = resources.clone();
    spec.health_check = Some(mysql_health_check());
    spec
}

pub fn new_node(
    ctx: &EngineContext,
    cluster_id: ClusterId,
    container_id: ContainerId,
    name: &str,
    role: NodeRole,
    ordinal: u32,
    resources: &NodeResources,
) -> ClusterNode {
    let port = match role {
        NodeRole::Router => ctx.config.router.traffic_port,
        _ => ctx.config.workflows.mysql_port,
    };
    ClusterNode {
        id: Uuid::new_v4(),
        cluster_id,
        container_id,
        container_name: name.to_string(),
        role,
        hostname: name.to_string(),
        address: None,
        port,
        status: NodeStatus::Starting,
        resources: resources.clone(),
        read_only: role == NodeRole::Replica,
        ordinal,
        created_at: Utc::now(),
    }
}

/// What replicas are pointed at and how they are sized.
pub struct ReplicaPlan<'a> {
    pub cluster_id: ClusterId,
    pub naming: &'a ClusterNaming,
    pub network: Option<&'a str>,
    pub engine_version: &'a str,
    pub version: EngineVersion,
    pub source_host: &'a str,
    pub creds: &'a OpenedCredentials,
    pub resources: &'a NodeResources,
}

#[derive(Debug)]
pub enum ReplicaOutcome {
    /// Replicating from the primary.
    Joined(ClusterNode),
    /// Container exists but never got to a syncing state.
    Stalled {
        node: ClusterNode,
        error: OrchestrationError,
    },
    /// Nothing was created.
    NotCreated {
        ordinal: u32,
        error: OrchestrationError,
    },
}

impl ReplicaOutcome {
    pub fn ordinal(&self) -> u32 {
        match self {
            ReplicaOutcome::Joined(node) | ReplicaOutcome::Stalled { node, .. } => node.ordinal,
            ReplicaOutcome::NotCreated { ordinal, .. } => *ordinal,
        }
    }

    pub fn error(&self) -> Option<&OrchestrationError> {
        match self {
            ReplicaOutcome::Joined(_) => None,
            ReplicaOutcome::Stalled { error, .. } | ReplicaOutcome::NotCreated { error, .. } => Some(error),
        }
    }
}

/// Replicas the router reads from: replicating, or joined and still catching up.
pub fn is_routable(node: &ClusterNode) -> bool {
    node.role == NodeRole::Replica && matches!(node.status, NodeStatus::Running | NodeStatus::Syncing)
}

/// Brings up one replica per ordinal. Outcomes come back in ordinal order.
pub async fn bring_up(
    ctx: &EngineContext,
    plan: &ReplicaPlan<'_>,
    ordinals: Vec<u32>,
    task: &Task,
) -> Vec<ReplicaOutcome> {
    let parallelism = ctx.config.workflows.replica_parallelism.max(1);
    let mut outcomes: Vec<ReplicaOutcome> = stream::iter(ordinals)
        .map(|ordinal| bring_up_one(ctx, plan, ordinal, task))
        .buffer_unordered(parallelism)
        .collect()
        .await;
    outcomes.sort_by_key(ReplicaOutcome::ordinal);
    outcomes
}

async fn bring_up_one(ctx: &EngineContext, plan: &ReplicaPlan<'_>, ordinal: u32, task: &Task) -> ReplicaOutcome {
    let name = plan.naming.replica(ordinal);
    let spec = mysql_spec(
        ctx,
        &plan.cluster_id,
        &name,
        plan.network,
        plan.engine_version,
        plan.creds,
        NodeRole::Replica,
        ordinal,
        plan.resources,
    );

    let container_id = match ctx.runtime.run_container(&spec).await {
        Ok(id) => id,
        Err(error) => {
            ctx.log(task, format!("replica {} could not be created: {}", name, error)).await;
            return ReplicaOutcome::NotCreated { ordinal, error };
        }
    };
    ctx.log(task, format!("replica {} started as {}", name, container_id)).await;

    let mut node = new_node(
        ctx,
        plan.cluster_id,
        container_id,
        &name,
        NodeRole::Replica,
        ordinal,
        plan.resources,
    );
    if let Err(error) = ctx.store.put_node(node.clone()).await {
        return stalled(ctx, task, node, error).await;
    }

    match join(ctx, plan, &node).await {
        Ok(status) => {
            node.status = status;
            if let Err(error) = ctx.store.put_node(node.clone()).await {
                return stalled(ctx, task, node, error).await;
            }
            ctx.log(task, format!("replica {} is replicating from {}", name, plan.source_host))
                .await;
            ReplicaOutcome::Joined(node)
        }
        Err(error) => stalled(ctx, task, node, error).await,
    }
}

/// Readiness, replication setup, then a bounded wait for the threads.
async fn join(ctx: &EngineContext, plan: &ReplicaPlan<'_>, node: &ClusterNode) -> Result<NodeStatus> {
    ctx.wait_ready(&node.container_id, &node.container_name).await?;

    let shell = MysqlShell::new(ctx.runtime.as_ref(), &node.container_id, &plan.creds.root_password);
    let setup = replica_setup_statements(
        plan.version,
        plan.source_host,
        ctx.config.workflows.mysql_port,
        plan.creds,
    )?;
    shell.run(&setup).await?;

    let policy = ctx.config.readiness.replication_policy();
    if !shell.wait_syncing(plan.version, policy).await? {
        return Err(OrchestrationError::ContainerNotReady {
            container: node.container_name.clone(),
            waited: policy.timeout,
        });
    }
    let threads = shell.replica_threads(plan.version).await?;
    debug!(container_id = %node.container_id, ?threads, "replica joined");
    Ok(if threads.is_replicating() {
        NodeStatus::Running
    } else {
        NodeStatus::Syncing
    })
}

async fn stalled(ctx: &EngineContext, task: &Task, mut node: ClusterNode, error: OrchestrationError) -> ReplicaOutcome {
    warn!(container_id = %node.container_id, error = %error, "replica did not join");
    ctx.log(
        task,
        format!("replica {} ({}) did not join: {}", node.container_name, node.container_id, error),
    )
    .await;
    node.status = NodeStatus::Failed;
    if let Err(err) = ctx.store.put_node(node.clone()).await {
        warn!(node_id = %node.id, error = %err, "could not record failed replica");
    }
    ReplicaOutcome::Stalled { node, error }
}

/// Next free replica ordinal. Ordinals are never reused, including the
/// primary's after a promotion.
pub fn next_ordinal(nodes: &[ClusterNode]) -> u32 {
    nodes
        .iter()
        .filter(|n| matches!(n.role, NodeRole::Primary | NodeRole::Replica))
        .map(|n| n.ordinal + 1)
        .max()
        .unwrap_or(1)
        .max(1)
}

/// Stops and removes a container, tolerating a stop failure.
pub async fn discard_container(ctx: &EngineContext, container_id: &ContainerId) -> Result<()> {
    if let Err(err) = ctx.runtime.stop_container(container_id).await {
        debug!(container_id = %container_id, error = %err, "stop before removal failed");
    }
    ctx.runtime.remove_container(container_id).await
}
