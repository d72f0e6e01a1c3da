//! Absorbing a promotion the topology monitor already carried out.
//!
//! The monitor picks and promotes the successor; this module only brings
//! the recorded roles, the cluster's primary reference and the router's
//! write group in line with it. Every step is attempted even when an
//! earlier one failed, and whatever could not be confirmed leaves the
//! cluster `DEGRADED` with the error recorded.

use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use observability::{failover_span, AlertSeverity, FailoverEventData, StreamEvent};
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, ClusterStatus, NodeRole, NodeStatus, OrchestrationError, Result,
    Task, TaskType,
};
use query_router_interface::OP_UPDATE_MASTER;

use crate::context::EngineContext;
use crate::naming::parse_cluster_alias;

use super::health::settle;
use super::{require_status, FailoverEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverOutcome {
    /// Roles, topology and routing were moved to the successor.
    Reconciled,
    /// The successor was already the recorded primary; nothing to do.
    AlreadyReconciled,
    /// Topology was already current but the router was not; only the router was repointed.
    RouterResynced,
}

impl FailoverOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverOutcome::Reconciled => "reconciled",
            FailoverOutcome::AlreadyReconciled => "already_reconciled",
            FailoverOutcome::RouterResynced => "router_resynced",
        }
    }
}

const FAILOVER_ALLOWED: &[ClusterStatus] = &[ClusterStatus::Healthy, ClusterStatus::Degraded, ClusterStatus::Failed];

pub async fn handle(ctx: &EngineContext, event: FailoverEvent) -> Result<FailoverOutcome> {
    let span = failover_span!(event.cluster_alias, event.failed_host, event.successor_host);
    let outcome = reconcile(ctx, &event).instrument(span).await;
    ctx.metrics.failover_reconciled(match &outcome {
        Ok(outcome) => outcome.as_str(),
        Err(_) => "failed",
    });
    outcome
}

/// Whether `host` as reported by the monitor names `node`. The monitor may
/// append the port.
fn host_matches(node: &ClusterNode, host: &str) -> bool {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => name,
        _ => host,
    };
    node.hostname == host || node.container_name == host || node.address.as_deref() == Some(host)
}

async fn reconcile(ctx: &EngineContext, event: &FailoverEvent) -> Result<FailoverOutcome> {
    let cluster_id = parse_cluster_alias(&ctx.config.naming.alias_prefix, &event.cluster_alias).map_err(|err| {
        warn!(alias = %event.cluster_alias, "dropping failover event for an unmanaged cluster");
        err
    })?;
    let cluster = ctx.store.require_cluster(&cluster_id).await?;
    if cluster.status == ClusterStatus::Deleting {
        info!(cluster_id = %cluster_id, "cluster is being deleted, dropping failover event");
        return Err(OrchestrationError::InvalidState {
            cluster_id,
            status: cluster.status,
            operation: "failover".to_string(),
        });
    }

    let nodes = ctx.store.list_nodes_for_cluster(&cluster_id).await?;
    let successor = nodes
        .iter()
        .find(|n| host_matches(n, &event.successor_host))
        .cloned()
        .ok_or_else(|| {
            OrchestrationError::NodeNotFound(format!("{} in cluster {}", event.successor_host, cluster_id))
        })?;
    if !matches!(successor.role, NodeRole::Primary | NodeRole::Replica) {
        return Err(OrchestrationError::Validation(format!(
            "successor {} is a {} node",
            successor.hostname, successor.role
        )));
    }

    let already_primary = successor.role == NodeRole::Primary
        && cluster.primary_container_id.as_deref() == Some(successor.container_id.as_str());
    if already_primary {
        if !cluster.router_sync_pending {
            info!(cluster_id = %cluster_id, successor = %successor.hostname, "failover already reconciled");
            return Ok(FailoverOutcome::AlreadyReconciled);
        }
        let (cluster, task) = ctx
            .begin_structural(&cluster_id, TaskType::Failover, |c| require_status(c, "failover", FAILOVER_ALLOWED))
            .await?;
        let started = Instant::now();
        let result = resync_router(ctx, &cluster, &successor, &task).await;
        ctx.finish(&task, started, &result).await;
        return result.map(|_| FailoverOutcome::RouterResynced);
    }

    let (cluster, task) = ctx
        .begin_structural(&cluster_id, TaskType::Failover, |c| require_status(c, "failover", FAILOVER_ALLOWED))
        .await?;
    let started = Instant::now();
    let result = promote(ctx, &cluster, &successor, nodes, event, &task).await;
    ctx.finish(&task, started, &result).await;
    result.map(|_| FailoverOutcome::Reconciled)
}

/// Demotes, promotes, records and repoints. Returns the first error after all of
/// them have been attempted.
async fn promote(
    ctx: &EngineContext,
    cluster: &Cluster,
    successor: &ClusterNode,
    loaded: Vec<ClusterNode>,
    event: &FailoverEvent,
    task: &Task,
) -> Result<Cluster> {
    let cluster_id = cluster.id;
    let mut errors: Vec<OrchestrationError> = Vec::new();
    ctx.log(
        task,
        format!(
            "monitor reports {} failed, {} promoted ({})",
            event.failed_host, event.successor_host, event.failure_type
        ),
    )
    .await;

    // Reload after the claim; the pre-claim view still names the old primary if that fails.
    let nodes = match ctx.store.list_nodes_for_cluster(&cluster_id).await {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(cluster_id = %cluster_id, error = %err, "could not reload nodes, using the pre-claim view");
            errors.push(err);
            loaded
        }
    };
    let old_primary = nodes
        .iter()
        .find(|n| n.role == NodeRole::Primary && n.id != successor.id)
        .cloned();
    if let Some(old) = &old_primary {
        if !host_matches(old, &event.failed_host) {
            warn!(
                cluster_id = %cluster_id,
                recorded = %old.hostname,
                reported = %event.failed_host,
                "failed host is not the recorded primary"
            );
            ctx.log(
                task,
                format!("recorded primary {} differs from reported {}", old.hostname, event.failed_host),
            )
            .await;
        }
    }

    // Node roles
    if let Some(mut old) = old_primary.clone() {
        old.role = NodeRole::Replica;
        old.status = NodeStatus::Failed;
        old.read_only = true;
        match ctx.store.put_node(old).await {
            Ok(()) => ctx.log(task, format!("demoted {} to a failed replica", event.failed_host)).await,
            Err(err) => errors.push(err),
        }
    }
    let mut promoted = successor.clone();
    promoted.role = NodeRole::Primary;
    promoted.status = NodeStatus::Running;
    promoted.read_only = false;
    match ctx.store.put_node(promoted).await {
        Ok(()) => ctx.log(task, format!("recorded {} as primary", successor.hostname)).await,
        Err(err) => errors.push(err),
    }

    // Cluster topology
    let successor_container = successor.container_id.clone();
    let failed_container = cluster
        .primary_container_id
        .clone()
        .or_else(|| old_primary.as_ref().map(|n| n.container_id.clone()))
        .filter(|id| *id != successor_container);
    let topology = ctx
        .update_cluster(&cluster_id, |c| {
            c.primary_container_id = Some(successor_container.clone());
            c.replica_container_ids.retain(|id| *id != successor_container);
            if let Some(failed) = &failed_container {
                if !c.is_replica_container(failed) {
                    c.replica_container_ids.push(failed.clone());
                }
            }
            Ok(())
        })
        .await;
    if let Err(err) = topology {
        errors.push(err);
    }

    // Router
    let router_result = repoint_router(ctx, cluster, successor).await;
    let sync_pending = router_result.is_err();
    match router_result {
        Ok(()) => ctx.log(task, format!("router writes to {}", successor.hostname)).await,
        Err(err) => {
            warn!(cluster_id = %cluster_id, error = %err, "router still points at the old primary");
            ctx.log(
                task,
                format!(
                    "router could not be repointed to {}; redeliver the event to retry: {}",
                    successor.hostname, err
                ),
            )
            .await;
            errors.push(err);
        }
    }
    if let Err(err) = ctx
        .update_cluster(&cluster_id, |c| {
            c.router_sync_pending = sync_pending;
            Ok(())
        })
        .await
    {
        errors.push(err);
    }

    // Notification
    let mut notification = StreamEvent::failover(FailoverEventData {
        cluster_id,
        cluster_name: cluster.name.clone(),
        old_primary: old_primary.as_ref().map(|n| n.hostname.clone()).unwrap_or_else(|| event.failed_host.clone()),
        new_primary: successor.hostname.clone(),
        failure_type: event.failure_type.clone(),
        timestamp: Utc::now(),
    });
    notification = notification.with_correlation(task.id.to_string());
    ctx.notifier.publish(notification).await;
    if !cluster.features.auto_failover {
        ctx.notifier
            .publish(StreamEvent::alert(
                &cluster_id,
                AlertSeverity::Warning,
                format!(
                    "cluster {} failed over to {} although automatic failover is disabled",
                    cluster.name, successor.hostname
                ),
            ))
            .await;
    }

    let settled = settle(ctx, &cluster_id, errors.first()).await;
    match (errors.into_iter().next(), settled) {
        (Some(err), _) => Err(err),
        (None, Ok(cluster)) => {
            ctx.log(task, format!("cluster is {}", cluster.status)).await;
            Ok(cluster)
        }
        (None, Err(err)) => Err(err),
    }
}

async fn repoint_router(ctx: &EngineContext, cluster: &Cluster, successor: &ClusterNode) -> Result<()> {
    let endpoint = ctx.router_endpoint(cluster)?;
    let target = ctx.router_target(cluster.id, &successor.hostname)?;
    ctx.router.update_master(&endpoint, &target).await.map_err(|err| {
        ctx.metrics.router_failure(OP_UPDATE_MASTER);
        err
    })
}

/// Redelivery after a router failure: node and cluster topology are already
/// current, so only the router is repointed.
async fn resync_router(ctx: &EngineContext, cluster: &Cluster, successor: &ClusterNode, task: &Task) -> Result<Cluster> {
    let cluster_id: ClusterId = cluster.id;
    ctx.log(task, format!("re-issuing router update for {}", successor.hostname)).await;
    if let Err(err) = repoint_router(ctx, cluster, successor).await {
        ctx.log(task, format!("router still not repointed: {}", err)).await;
        if let Err(settle_err) = settle(ctx, &cluster_id, Some(&err)).await {
            warn!(cluster_id = %cluster_id, error = %settle_err, "could not record router failure");
        }
        return Err(err);
    }
    let cleared = ctx
        .update_cluster(&cluster_id, |c| {
            c.router_sync_pending = false;
            c.error_message = None;
            Ok(())
        })
        .await;
    if let Err(err) = cleared {
        // Router is current; the flag stays set and the next redelivery clears it.
        if let Err(settle_err) = settle(ctx, &cluster_id, Some(&err)).await {
            warn!(cluster_id = %cluster_id, error = %settle_err, "could not record resync");
        }
        return Err(err);
    }
    ctx.log(task, format!("router writes to {}", successor.hostname)).await;
    settle(ctx, &cluster_id, None).await
}
