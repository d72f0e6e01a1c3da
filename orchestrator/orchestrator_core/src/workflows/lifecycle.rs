//! Delete, stop and start.
//!
//! Delete enters `DELETING` before touching anything and resolves either by
//! removing the record with its nodes and tasks or, when something could not
//! be removed, by moving to `FAILED` with the leftovers named. Each resource
//! is forgotten as soon as it is gone, so deleting again only retries what
//! is left.

use std::time::Instant;

use tracing::{info, warn, Instrument};

use observability::workflow_span;
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, ClusterStatus, ContainerId, NodeRole, NodeStatus, OrchestrationError,
    Result, Task, TaskType,
};

use crate::context::EngineContext;
use crate::participant::participant_for;

use super::health::settle;
use super::replicas::discard_container;
use super::require_status;

pub async fn begin_delete(ctx: &EngineContext, cluster_id: &ClusterId) -> Result<Task> {
    let (_, task) = ctx
        .begin_structural(cluster_id, TaskType::Delete, |c| {
            if c.status == ClusterStatus::Deleting {
                Err(OrchestrationError::InvalidState {
                    cluster_id: c.id,
                    status: c.status,
                    operation: "delete".to_string(),
                })
            } else {
                Ok(())
            }
        })
        .await?;
    let entered = ctx
        .update_cluster(cluster_id, |c| {
            c.status = ClusterStatus::Deleting;
            Ok(())
        })
        .await;
    if let Err(err) = entered {
        ctx.tracker.fail(&task, format!("could not enter DELETING: {}", err)).await?;
        return Err(err);
    }
    Ok(task)
}

pub async fn run_delete(ctx: &EngineContext, cluster_id: ClusterId, task: Task) -> Result<()> {
    let started = Instant::now();
    let outcome = delete(ctx, &cluster_id, &task)
        .instrument(workflow_span!("delete", cluster_id, task.id))
        .await;

    match &outcome {
        Ok(()) => {
            // The task goes with the cluster, so it is finalized first.
            ctx.finish(&task, started, &outcome).await;
            ctx.store.delete_cluster(&cluster_id).await?;
            info!(cluster_id = %cluster_id, "cluster deleted");
        }
        Err(err) => {
            ctx.log(&task, format!("delete did not complete: {}", err)).await;
            let message = err.to_string();
            if let Err(mark) = ctx
                .update_cluster(&cluster_id, |c| {
                    c.status = ClusterStatus::Failed;
                    c.error_message = Some(message.clone());
                    Ok(())
                })
                .await
            {
                warn!(cluster_id = %cluster_id, error = %mark, "could not record failed delete");
            }
            ctx.finish(&task, started, &outcome).await;
        }
    }
    outcome
}

/// Containers in teardown order: router, replicas (highest ordinal first),
/// primary. References the cluster holds without a node record are included.
fn teardown_order(cluster: &Cluster, nodes: &[ClusterNode]) -> Vec<(Option<ClusterNode>, ContainerId)> {
    let mut ordered: Vec<ClusterNode> = nodes.to_vec();
    ordered.sort_by_key(|n| {
        let rank = match n.role {
            NodeRole::Router => 0,
            NodeRole::Monitor => 1,
            NodeRole::Replica => 2,
            NodeRole::Primary => 3,
        };
        (rank, std::cmp::Reverse(n.ordinal))
    });

    let mut out: Vec<(Option<ClusterNode>, ContainerId)> = Vec::new();
    let known = |out: &Vec<(Option<ClusterNode>, ContainerId)>, id: &str| out.iter().any(|(_, c)| c == id);
    let orphans = cluster
        .router_container_id
        .iter()
        .chain(cluster.replica_container_ids.iter().rev())
        .chain(cluster.primary_container_id.iter());
    for node in ordered {
        let id = node.container_id.clone();
        out.push((Some(node), id));
    }
    let mut extra = Vec::new();
    for id in orphans {
        if !known(&out, id) && !extra.contains(id) {
            extra.push(id.clone());
        }
    }
    // Orphans have no ordering information; remove them before the recorded primary.
    let primary_at = out
        .iter()
        .position(|(n, _)| n.as_ref().map(|n| n.role) == Some(NodeRole::Primary))
        .unwrap_or(out.len());
    for (offset, id) in extra.into_iter().enumerate() {
        out.insert(primary_at + offset, (None, id));
    }
    out
}

async fn delete(ctx: &EngineContext, cluster_id: &ClusterId, task: &Task) -> Result<()> {
    let cluster = ctx.store.require_cluster(cluster_id).await?;
    let nodes = ctx.store.list_nodes_for_cluster(cluster_id).await?;
    let mut leftovers: Vec<String> = Vec::new();

    for (node, container_id) in teardown_order(&cluster, &nodes) {
        let label = node
            .as_ref()
            .map(|n| n.hostname.clone())
            .unwrap_or_else(|| container_id.clone());
        if let Err(err) = discard_container(ctx, &container_id).await {
            warn!(container_id = %container_id, error = %err, "could not remove container");
            ctx.log(task, format!("could not remove {} ({}): {}", label, container_id, err)).await;
            leftovers.push(format!("container {}", container_id));
            continue;
        }
        if let Some(node) = node {
            ctx.store.delete_node(cluster_id, &node.id).await?;
        }
        let removed = container_id.clone();
        ctx.update_cluster(cluster_id, |c| {
            if c.router_container_id.as_deref() == Some(removed.as_str()) {
                c.router_container_id = None;
            }
            if c.primary_container_id.as_deref() == Some(removed.as_str()) {
                c.primary_container_id = None;
            }
            c.replica_container_ids.retain(|id| *id != removed);
            Ok(())
        })
        .await?;
        ctx.log(task, format!("removed {}", label)).await;
    }

    if let Some(network_id) = cluster.network_id.clone() {
        if !leftovers.is_empty() {
            // Still in use by the containers that remain.
            leftovers.push(format!("network {}", network_id));
        } else if let Err(err) = ctx.runtime.remove_network(&network_id).await {
            ctx.log(task, format!("could not remove network {}: {}", network_id, err)).await;
            leftovers.push(format!("network {}", network_id));
        } else {
            ctx.update_cluster(cluster_id, |c| {
                c.network_id = None;
                Ok(())
            })
            .await?;
            ctx.log(task, format!("removed network {}", network_id)).await;
        }
    }

    if leftovers.is_empty() {
        Ok(())
    } else {
        Err(OrchestrationError::RuntimeError(format!(
            "leftover resources: {}",
            leftovers.join(", ")
        )))
    }
}

pub async fn begin_stop(ctx: &EngineContext, cluster_id: &ClusterId) -> Result<Task> {
    let (_, task) = ctx
        .begin_structural(cluster_id, TaskType::Stop, |c| {
            require_status(
                c,
                "stop",
                &[ClusterStatus::Healthy, ClusterStatus::Degraded, ClusterStatus::Failed],
            )
        })
        .await?;
    Ok(task)
}

pub async fn run_stop(ctx: &EngineContext, cluster_id: ClusterId, task: Task) -> Result<Cluster> {
    let started = Instant::now();
    let outcome = stop(ctx, &cluster_id, &task)
        .instrument(workflow_span!("stop", cluster_id, task.id))
        .await;
    let outcome = match outcome {
        Ok(cluster) => Ok(cluster),
        Err(err) => Err(mark_failed(ctx, &cluster_id, &task, err).await),
    };
    ctx.finish(&task, started, &outcome).await;
    outcome
}

async fn stop(ctx: &EngineContext, cluster_id: &ClusterId, task: &Task) -> Result<Cluster> {
    let mut nodes = ctx.store.list_nodes_for_cluster(cluster_id).await?;
    // Router first so clients stop being routed, primary last.
    nodes.sort_by_key(|n| {
        let rank = match n.role {
            NodeRole::Router => 0,
            NodeRole::Monitor => 1,
            NodeRole::Replica => 2,
            NodeRole::Primary => 3,
        };
        (rank, std::cmp::Reverse(n.ordinal))
    });

    let mut failure: Option<OrchestrationError> = None;
    for mut node in nodes {
        match ctx.runtime.stop_container(&node.container_id).await {
            Ok(()) => {
                node.status = NodeStatus::Stopped;
                ctx.store.put_node(node.clone()).await?;
                ctx.log(task, format!("stopped {}", node.hostname)).await;
            }
            Err(err) => {
                ctx.log(task, format!("could not stop {}: {}", node.hostname, err)).await;
                failure.get_or_insert(err);
            }
        }
    }
    if let Some(err) = failure {
        return Err(err);
    }

    ctx.update_cluster(cluster_id, |c| {
        c.status = ClusterStatus::Stopped;
        Ok(())
    })
    .await
}

pub async fn begin_start(ctx: &EngineContext, cluster_id: &ClusterId) -> Result<Task> {
    let (_, task) = ctx
        .begin_structural(cluster_id, TaskType::Start, |c| {
            require_status(c, "start", &[ClusterStatus::Stopped])
        })
        .await?;
    Ok(task)
}

pub async fn run_start(ctx: &EngineContext, cluster_id: ClusterId, task: Task) -> Result<Cluster> {
    let started = Instant::now();
    let outcome = start(ctx, &cluster_id, &task)
        .instrument(workflow_span!("start", cluster_id, task.id))
        .await;
    ctx.finish(&task, started, &outcome).await;
    outcome
}

async fn start(ctx: &EngineContext, cluster_id: &ClusterId, task: &Task) -> Result<Cluster> {
    let cluster = ctx.store.require_cluster(cluster_id).await?;
    let access = ctx.database_access(&cluster)?;
    let mut nodes = ctx.store.list_nodes_for_cluster(cluster_id).await?;
    // Primary first so replicas have a source, router last.
    nodes.sort_by_key(|n| {
        let rank = match n.role {
            NodeRole::Primary => 0,
            NodeRole::Replica => 1,
            NodeRole::Monitor => 2,
            NodeRole::Router => 3,
        };
        (rank, n.ordinal)
    });

    let mut failure: Option<OrchestrationError> = None;
    for mut node in nodes {
        let brought_up = async {
            ctx.runtime.start_container(&node.container_id).await?;
            ctx.wait_ready(&node.container_id, &node.container_name).await
        }
        .await;

        match brought_up {
            Ok(()) => {
                let participant = participant_for(node.clone(), &access);
                node.status = participant
                    .observe(ctx.runtime.as_ref())
                    .await
                    .unwrap_or(NodeStatus::Failed);
                ctx.log(task, format!("started {} ({:?})", node.hostname, node.status)).await;
            }
            Err(err) => {
                ctx.log(task, format!("could not start {}: {}", node.hostname, err)).await;
                node.status = NodeStatus::Failed;
                let critical = node.role == NodeRole::Primary;
                ctx.store.put_node(node).await?;
                if critical {
                    return Err(mark_failed(ctx, cluster_id, task, err).await);
                }
                failure.get_or_insert(err);
                continue;
            }
        }
        ctx.store.put_node(node).await?;
    }

    let settled = settle(ctx, cluster_id, failure.as_ref()).await?;
    ctx.log(task, format!("cluster is {}", settled.status)).await;
    match failure {
        Some(err) => Err(err),
        None => Ok(settled),
    }
}

/// Records `err` on the cluster as `FAILED` and hands it back.
async fn mark_failed(ctx: &EngineContext, cluster_id: &ClusterId, task: &Task, err: OrchestrationError) -> OrchestrationError {
    ctx.log(task, format!("{} failed: {}", task.task_type, err)).await;
    let message = err.to_string();
    if let Err(mark) = ctx
        .update_cluster(cluster_id, |c| {
            c.status = ClusterStatus::Failed;
            c.error_message = Some(message.clone());
            Ok(())
        })
        .await
    {
        warn!(cluster_id = %cluster_id, error = %mark, "could not mark cluster failed");
    }
    err
}
