//! Health refresh: observe every node and move the cluster between
//! `HEALTHY`, `DEGRADED` and `FAILED` to match.
//!
//! Clusters that a structural workflow owns, or that are transient or
//! stopped, are left alone. The cluster write is conditioned on the version
//! read before observing, so a workflow that claims the cluster meanwhile
//! wins and this round is dropped.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, ClusterStatus, NodeRole, NodeStatus, OrchestrationError, Result,
};
use query_router_interface::OP_ADD_REPLICA;

use crate::context::EngineContext;
use crate::participant::{derive_cluster_status, participant_for, status_from_records, ReplicationParticipant};

use super::replicas::is_routable;

/// Recomputes the status from the statuses recorded on the nodes and writes
/// it together with `failure` as the error message. A router failure never
/// leaves the cluster `HEALTHY`.
pub async fn settle(
    ctx: &EngineContext,
    cluster_id: &ClusterId,
    failure: Option<&OrchestrationError>,
) -> Result<Cluster> {
    let cluster = ctx.store.require_cluster(cluster_id).await?;
    let nodes = ctx.store.list_nodes_for_cluster(cluster_id).await?;
    let access = ctx.database_access(&cluster)?;
    let mut status = status_from_records(&nodes, &access, cluster.replica_count, cluster.router_sync_pending);
    if status == ClusterStatus::Healthy
        && matches!(failure, Some(OrchestrationError::RouterOperationFailed { .. }))
    {
        status = ClusterStatus::Degraded;
    }
    let note = failure.map(|e| e.to_string());
    ctx.update_cluster(cluster_id, |c| {
        c.status = status;
        if let Some(note) = &note {
            c.error_message = Some(note.clone());
        }
        Ok(())
    })
    .await
}

fn is_observable(status: ClusterStatus) -> bool {
    !status.is_transient() && status != ClusterStatus::Stopped
}

/// One observation round for one cluster.
pub async fn refresh_cluster(ctx: &EngineContext, cluster_id: &ClusterId) -> Result<Cluster> {
    let cluster = ctx.store.require_cluster(cluster_id).await?;
    if !is_observable(cluster.status) {
        debug!(cluster_id = %cluster_id, status = %cluster.status, "not observing cluster");
        return Ok(cluster);
    }
    if let Some(active) = ctx.tracker.active_structural(cluster_id).await? {
        debug!(cluster_id = %cluster_id, task_id = %active.id, "structural task in flight, skipping refresh");
        return Ok(cluster);
    }

    let access = ctx.database_access(&cluster)?;
    let participants: Vec<Box<dyn ReplicationParticipant>> = ctx
        .store
        .list_nodes_for_cluster(cluster_id)
        .await?
        .into_iter()
        .map(|node| participant_for(node, &access))
        .collect();

    let mut observed: Vec<(&dyn ReplicationParticipant, NodeStatus)> = Vec::with_capacity(participants.len());
    for participant in &participants {
        let node = participant.node();
        let mut status = match participant.observe(ctx.runtime.as_ref()).await {
            Ok(status) => status,
            Err(err) => {
                warn!(node_id = %node.id, error = %err, "node observation failed");
                NodeStatus::Failed
            }
        };
        // A replica coming back from FAILED is outside the read group until it is re-added.
        if node.role == NodeRole::Replica && !is_routable(node) && status == NodeStatus::Running {
            if let Err(err) = route_replica(ctx, &cluster, node).await {
                warn!(node = %node.hostname, error = %err, "recovered replica not routed yet");
                status = node.status;
            } else {
                info!(cluster_id = %cluster_id, node = %node.hostname, "recovered replica added to the read group");
            }
        }
        observed.push((participant.as_ref(), status));
    }

    let derived = derive_cluster_status(&observed, cluster.replica_count, cluster.router_sync_pending);
    let changed: Vec<(&dyn ReplicationParticipant, NodeStatus)> = observed
        .iter()
        .filter(|(p, status)| p.node().status != *status)
        .copied()
        .collect();
    if derived == cluster.status && changed.is_empty() {
        return Ok(cluster);
    }

    let read_version = cluster.version;
    let written = ctx
        .update_cluster(cluster_id, |c| {
            if c.version != read_version {
                return Err(OrchestrationError::ConcurrentModification {
                    cluster_id: c.id,
                    expected: read_version,
                    found: c.version,
                });
            }
            c.status = derived;
            Ok(())
        })
        .await?;

    for (participant, status) in changed {
        let node = participant.node();
        // Only the status is ours to change; reload so a concurrent role change survives.
        if let Some(mut fresh) = ctx.store.get_node(cluster_id, &node.id).await? {
            if fresh.role == node.role && fresh.status != status {
                info!(
                    cluster_id = %cluster_id,
                    node = %fresh.hostname,
                    from = ?fresh.status,
                    to = ?status,
                    "node status changed"
                );
                fresh.status = status;
                ctx.store.put_node(fresh).await?;
            }
        }
    }
    Ok(written)
}

async fn route_replica(ctx: &EngineContext, cluster: &Cluster, node: &ClusterNode) -> Result<()> {
    let endpoint = ctx.router_endpoint(cluster)?;
    let target = ctx.router_target(cluster.id, &node.hostname)?;
    ctx.router.add_replica(&endpoint, &target).await.map_err(|err| {
        ctx.metrics.router_failure(OP_ADD_REPLICA);
        err
    })
}

/// Refreshes every managed cluster and publishes the per-status gauge.
/// Per-cluster failures are logged and do not stop the round.
pub async fn refresh_all(ctx: &EngineContext) -> Result<HashMap<ClusterStatus, u64>> {
    let mut counts: HashMap<ClusterStatus, u64> = HashMap::new();
    for cluster in ctx.store.list_clusters().await? {
        let status = match refresh_cluster(ctx, &cluster.id).await {
            Ok(refreshed) => refreshed.status,
            Err(OrchestrationError::ConcurrentModification { .. }) => {
                debug!(cluster_id = %cluster.id, "cluster changed during refresh");
                cluster.status
            }
            Err(err) => {
                warn!(cluster_id = %cluster.id, error = %err, "health refresh failed");
                cluster.status
            }
        };
        *counts.entry(status).or_default() += 1;
    }

    for status in [
        ClusterStatus::Provisioning,
        ClusterStatus::Healthy,
        ClusterStatus::Degraded,
        ClusterStatus::Failed,
        ClusterStatus::Stopped,
        ClusterStatus::Deleting,
    ] {
        ctx.metrics
            .set_clusters_by_status(&status.to_string(), counts.get(&status).copied().unwrap_or(0));
    }
    Ok(counts)
}
