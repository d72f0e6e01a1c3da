//! Adding and removing replicas.
//!
//! Scale-up reuses the provisioning replica steps and then registers each
//! new replica with the router. Scale-down removes the highest ordinals
//! first and never touches the primary. Either way the stored replica count
//! is what was actually reached.

use std::time::Instant;

use tracing::{warn, Instrument};

use observability::workflow_span;
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, ClusterStatus, NodeRole, NodeStatus, OrchestrationError, Result,
    Task, TaskType,
};
use query_router_interface::RouterEndpoint;

use crate::context::EngineContext;
use crate::replication::EngineVersion;

use super::health::settle;
use super::replicas::{bring_up, discard_container, next_ordinal, ReplicaOutcome, ReplicaPlan};
use super::{require_status, validate_replica_count, validate_resources, ScaleRequest};

pub async fn begin(ctx: &EngineContext, cluster_id: &ClusterId, request: &ScaleRequest) -> Result<Task> {
    validate_replica_count(request.replica_count)?;
    if let Some(resources) = &request.resources {
        validate_resources(resources)?;
    }
    let (_, task) = ctx
        .begin_structural(cluster_id, TaskType::Scale, |c| {
            require_status(c, "scale", &[ClusterStatus::Healthy, ClusterStatus::Degraded])
        })
        .await?;
    Ok(task)
}

pub async fn run(ctx: &EngineContext, cluster_id: ClusterId, request: ScaleRequest, task: Task) -> Result<Cluster> {
    let started = Instant::now();
    let outcome = scale(ctx, &cluster_id, &request, &task)
        .instrument(workflow_span!("scale", cluster_id, task.id))
        .await;
    if let Err(err) = &outcome {
        ctx.log(&task, format!("scale did not complete: {}", err)).await;
    }
    ctx.finish(&task, started, &outcome).await;
    outcome
}

async fn scale(ctx: &EngineContext, cluster_id: &ClusterId, request: &ScaleRequest, task: &Task) -> Result<Cluster> {
    let cluster = ctx.store.require_cluster(cluster_id).await?;
    let nodes = ctx.store.list_nodes_for_cluster(cluster_id).await?;
    let mut replicas: Vec<ClusterNode> = nodes.iter().filter(|n| n.role == NodeRole::Replica).cloned().collect();
    replicas.sort_by_key(|n| n.ordinal);
    let current = replicas.len() as u32;
    let target = request.replica_count;
    ctx.log(task, format!("scaling from {} to {} replicas", current, target)).await;

    let failure = if target > current {
        scale_up(ctx, &cluster, &nodes, target - current, request, task).await
    } else if target < current {
        let mut victims = replicas;
        victims.reverse();
        victims.truncate((current - target) as usize);
        scale_down(ctx, &cluster, victims, task).await
    } else {
        None
    };

    let settled = settle(ctx, cluster_id, failure.as_ref()).await;
    match &settled {
        Ok(settled) => {
            ctx.log(
                task,
                format!("cluster has {} replicas and is {}", settled.replica_count, settled.status),
            )
            .await
        }
        Err(err) => warn!(cluster_id = %cluster_id, error = %err, "could not settle cluster status"),
    }
    match failure {
        Some(err) => Err(err),
        None => settled,
    }
}

/// Returns the first failure, if any replica did not make it. Replicas that
/// joined stay even when a sibling failed, and every container that still
/// exists ends up in the stored topology.
async fn scale_up(
    ctx: &EngineContext,
    cluster: &Cluster,
    nodes: &[ClusterNode],
    additional: u32,
    request: &ScaleRequest,
    task: &Task,
) -> Option<OrchestrationError> {
    let Some(primary) = nodes.iter().find(|n| n.role == NodeRole::Primary) else {
        return Some(OrchestrationError::InvalidState {
            cluster_id: cluster.id,
            status: cluster.status,
            operation: "scale without a primary".to_string(),
        });
    };
    let opened = ctx
        .credentials(cluster)
        .and_then(|creds| EngineVersion::parse(&cluster.engine_version).map(|version| (creds, version)));
    let (creds, version) = match opened {
        Ok(opened) => opened,
        Err(err) => return Some(err),
    };
    let naming = ctx.naming(&cluster.id);
    let resources = request.resources.clone().unwrap_or_else(|| cluster.resources.clone());
    let first = next_ordinal(nodes);
    let ordinals: Vec<u32> = (first..first + additional).collect();

    let plan = ReplicaPlan {
        cluster_id: cluster.id,
        naming: &naming,
        network: cluster.network_id.as_deref(),
        engine_version: &cluster.engine_version,
        version,
        source_host: &primary.hostname,
        creds: &creds,
        resources: &resources,
    };
    let outcomes = bring_up(ctx, &plan, ordinals, task).await;

    let mut failure: Option<OrchestrationError> = None;
    let endpoint = match ctx.router_endpoint(cluster) {
        Ok(endpoint) => Some(endpoint),
        Err(err) => {
            ctx.log(task, format!("router endpoint unavailable: {}", err)).await;
            failure = Some(err);
            None
        }
    };

    for outcome in outcomes {
        match outcome {
            ReplicaOutcome::Joined(node) => {
                if let Some(endpoint) = &endpoint {
                    match add_to_read_group(ctx, endpoint, cluster.id, &node).await {
                        Ok(()) => ctx.log(task, format!("router reads from {}", node.hostname)).await,
                        Err(err) => {
                            ctx.log(task, format!("router did not accept {}: {}", node.hostname, err)).await;
                            failure.get_or_insert(err);
                        }
                    }
                }
                if let Err(err) = record_replica(ctx, &cluster.id, &node.container_id).await {
                    failure.get_or_insert(err);
                }
            }
            ReplicaOutcome::Stalled { node, error } => {
                failure.get_or_insert(error);
                match discard_container(ctx, &node.container_id).await {
                    Ok(()) => {
                        if let Err(err) = ctx.store.delete_node(&cluster.id, &node.id).await {
                            warn!(node_id = %node.id, error = %err, "could not drop discarded replica");
                        }
                    }
                    Err(err) => {
                        warn!(container_id = %node.container_id, error = %err, "could not clean up replica");
                        ctx.log(
                            task,
                            format!("replica {} left behind: {}", node.container_id, err),
                        )
                        .await;
                        if let Err(err) = record_replica(ctx, &cluster.id, &node.container_id).await {
                            warn!(container_id = %node.container_id, error = %err, "could not record leftover replica");
                        }
                    }
                }
            }
            ReplicaOutcome::NotCreated { error, .. } => {
                failure.get_or_insert(error);
            }
        }
    }
    failure
}

async fn add_to_read_group(
    ctx: &EngineContext,
    endpoint: &RouterEndpoint,
    cluster_id: ClusterId,
    node: &ClusterNode,
) -> Result<()> {
    let target = ctx.router_target(cluster_id, &node.hostname)?;
    ctx.router.add_replica(endpoint, &target).await.map_err(|err| {
        if let OrchestrationError::RouterOperationFailed { operation, .. } = &err {
            ctx.metrics.router_failure(operation);
        }
        err
    })
}

/// Adds the container to the replica list and recounts.
async fn record_replica(ctx: &EngineContext, cluster_id: &ClusterId, container_id: &str) -> Result<()> {
    ctx.update_cluster(cluster_id, |c| {
        if !c.is_replica_container(container_id) {
            c.replica_container_ids.push(container_id.to_string());
        }
        c.replica_count = c.replica_container_ids.len() as u32;
        Ok(())
    })
    .await
    .map(|_| ())
}

/// Removes `victims` in order. A container that cannot be removed keeps its
/// node and its place in the replica list.
async fn scale_down(
    ctx: &EngineContext,
    cluster: &Cluster,
    victims: Vec<ClusterNode>,
    task: &Task,
) -> Option<OrchestrationError> {
    let mut failure: Option<OrchestrationError> = None;
    let endpoint = match ctx.router_endpoint(cluster) {
        Ok(endpoint) => Some(endpoint),
        Err(err) => {
            ctx.log(task, format!("router endpoint unavailable: {}", err)).await;
            failure = Some(err);
            None
        }
    };

    for victim in victims {
        if let Err(err) = discard_container(ctx, &victim.container_id).await {
            ctx.log(
                task,
                format!("could not remove replica {} ({}): {}", victim.hostname, victim.container_id, err),
            )
            .await;
            failure.get_or_insert(err);
            continue;
        }

        if let Some(endpoint) = &endpoint {
            if let Err(err) = ctx.router.remove_server(endpoint, &victim.hostname).await {
                if let OrchestrationError::RouterOperationFailed { operation, .. } = &err {
                    ctx.metrics.router_failure(operation);
                }
                ctx.log(task, format!("router still lists {}: {}", victim.hostname, err)).await;
                failure.get_or_insert(err);
            }
        }

        if let Err(err) = ctx.store.delete_node(&cluster.id, &victim.id).await {
            failure.get_or_insert(err);
        }
        let container_id = victim.container_id.clone();
        let recorded = ctx
            .update_cluster(&cluster.id, |c| {
                c.replica_container_ids.retain(|id| *id != container_id);
                c.replica_count = c.replica_container_ids.len() as u32;
                Ok(())
            })
            .await;
        if let Err(err) = recorded {
            failure.get_or_insert(err);
        }
        let state = if victim.status == NodeStatus::Failed { " failed" } else { "" };
        ctx.log(task, format!("removed{} replica {}", state, victim.hostname)).await;
    }
    failure
}
