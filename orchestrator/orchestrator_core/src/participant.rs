//! Per-role health observation.
//!
//! Each node role observes itself differently: a primary only has to be
//! up, a replica also has to be applying the primary's changes, a router has
//! to be up to route. Callers obtain a participant from [`participant_for`]
//! and never branch on the role themselves.

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::debug;

use container_runtime_interface::{ContainerRuntime, HealthProbe};
use orchestrator_shared_types::{ClusterNode, ClusterStatus, NodeRole, NodeStatus, Result};

use crate::replication::{EngineVersion, MysqlShell};

/// What a participant needs to log into its database.
#[derive(Debug, Clone)]
pub struct DatabaseAccess {
    pub root_password: SecretString,
    pub version: EngineVersion,
}

#[async_trait]
pub trait ReplicationParticipant: Send + Sync {
    fn node(&self) -> &ClusterNode;

    /// Current status of the node as observed through the runtime.
    async fn observe(&self, runtime: &dyn ContainerRuntime) -> Result<NodeStatus>;

    /// Whether this node being down takes the whole cluster down.
    fn is_critical(&self) -> bool {
        false
    }

    /// Whether this node counts toward the cluster's replica capacity.
    fn serves_reads(&self) -> bool {
        false
    }
}

/// Container up and healthy, without looking inside.
async fn container_status(runtime: &dyn ContainerRuntime, node: &ClusterNode) -> NodeStatus {
    match runtime.probe_health(&node.container_id).await {
        Ok(HealthProbe::Healthy) => NodeStatus::Running,
        Ok(HealthProbe::Starting) => NodeStatus::Starting,
        Ok(HealthProbe::Unhealthy(reason)) => {
            debug!(container_id = %node.container_id, %reason, "container unhealthy");
            NodeStatus::Failed
        }
        Err(err) => {
            debug!(container_id = %node.container_id, error = %err, "container probe failed");
            NodeStatus::Failed
        }
    }
}

pub struct PrimaryParticipant {
    node: ClusterNode,
}

#[async_trait]
impl ReplicationParticipant for PrimaryParticipant {
    fn node(&self) -> &ClusterNode {
        &self.node
    }

    async fn observe(&self, runtime: &dyn ContainerRuntime) -> Result<NodeStatus> {
        Ok(container_status(runtime, &self.node).await)
    }

    fn is_critical(&self) -> bool {
        true
    }
}

pub struct ReplicaParticipant {
    node: ClusterNode,
    access: DatabaseAccess,
}

#[async_trait]
impl ReplicationParticipant for ReplicaParticipant {
    fn node(&self) -> &ClusterNode {
        &self.node
    }

    async fn observe(&self, runtime: &dyn ContainerRuntime) -> Result<NodeStatus> {
        let status = container_status(runtime, &self.node).await;
        if status != NodeStatus::Running {
            return Ok(status);
        }
        let shell = MysqlShell::new(runtime, &self.node.container_id, &self.access.root_password);
        Ok(match shell.replica_threads(self.access.version).await {
            Ok(threads) if threads.is_replicating() => NodeStatus::Running,
            Ok(threads) if threads.is_syncing() => NodeStatus::Syncing,
            Ok(_) => NodeStatus::Failed,
            Err(err) => {
                debug!(container_id = %self.node.container_id, error = %err, "replica status query failed");
                NodeStatus::Failed
            }
        })
    }

    fn serves_reads(&self) -> bool {
        true
    }
}

pub struct RouterParticipant {
    node: ClusterNode,
}

#[async_trait]
impl ReplicationParticipant for RouterParticipant {
    fn node(&self) -> &ClusterNode {
        &self.node
    }

    async fn observe(&self, runtime: &dyn ContainerRuntime) -> Result<NodeStatus> {
        Ok(container_status(runtime, &self.node).await)
    }
}

pub struct MonitorParticipant {
    node: ClusterNode,
}

#[async_trait]
impl ReplicationParticipant for MonitorParticipant {
    fn node(&self) -> &ClusterNode {
        &self.node
    }

    async fn observe(&self, runtime: &dyn ContainerRuntime) -> Result<NodeStatus> {
        Ok(container_status(runtime, &self.node).await)
    }
}

pub fn participant_for(node: ClusterNode, access: &DatabaseAccess) -> Box<dyn ReplicationParticipant> {
    match node.role {
        NodeRole::Primary => Box::new(PrimaryParticipant { node }),
        NodeRole::Replica => Box::new(ReplicaParticipant {
            node,
            access: access.clone(),
        }),
        NodeRole::Router => Box::new(RouterParticipant { node }),
        NodeRole::Monitor => Box::new(MonitorParticipant { node }),
    }
}

/// Stable status implied by a set of observed participants.
///
/// A critical node not running means `FAILED`. Fewer running read-serving
/// nodes than requested, any other node not running, or a router that may
/// still point at a stale primary means `DEGRADED`.
pub fn derive_cluster_status(
    observed: &[(&dyn ReplicationParticipant, NodeStatus)],
    requested_replicas: u32,
    router_sync_pending: bool,
) -> ClusterStatus {
    let mut critical_seen = false;
    let mut running_replicas = 0u32;
    let mut degraded = router_sync_pending;

    for (participant, status) in observed {
        let running = *status == NodeStatus::Running;
        if participant.is_critical() {
            critical_seen = true;
            if !running {
                return ClusterStatus::Failed;
            }
        } else if participant.serves_reads() {
            if running {
                running_replicas += 1;
            } else {
                degraded = true;
            }
        } else if !running {
            degraded = true;
        }
    }

    if !critical_seen {
        return ClusterStatus::Failed;
    }
    if degraded || running_replicas < requested_replicas {
        ClusterStatus::Degraded
    } else {
        ClusterStatus::Healthy
    }
}

/// [`derive_cluster_status`] over the statuses already recorded on the nodes.
pub fn status_from_records(
    nodes: &[ClusterNode],
    access: &DatabaseAccess,
    requested_replicas: u32,
    router_sync_pending: bool,
) -> ClusterStatus {
    let participants: Vec<Box<dyn ReplicationParticipant>> = nodes
        .iter()
        .cloned()
        .map(|node| participant_for(node, access))
        .collect();
    let observed: Vec<(&dyn ReplicationParticipant, NodeStatus)> = participants
        .iter()
        .map(|p| (p.as_ref(), p.node().status))
        .collect();
    derive_cluster_status(&observed, requested_replicas, router_sync_pending)
}
