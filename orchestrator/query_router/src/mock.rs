//! In-memory router for tests.
//!
//! Keeps one routing table per cluster with the same semantics as the
//! ProxySQL statements, records every call, and can be told to fail a named
//! operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use orchestrator_shared_types::{ClusterId, Result};
use query_router_interface::{
    desired_servers, AdminRotation, BackendServer, BootstrapOutcome, HostgroupIds, QueryRouter,
    RouterEndpoint, RouterError, RouterTarget, RouterWeights, RoutingConfig, OP_ADD_REPLICA,
    OP_APPLY_TOPOLOGY, OP_BOOTSTRAP_ADMIN, OP_CONFIGURE_ROUTING, OP_REMOVE_SERVER,
    OP_ROUTING_TABLE, OP_UPDATE_MASTER,
};

/// One recorded router call: operation name and its main argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterCall {
    pub cluster_id: ClusterId,
    pub operation: String,
    pub argument: String,
}

#[derive(Debug, Default)]
pub struct MockRouter {
    hostgroups: HostgroupIds,
    weights: RouterWeights,
    tables: Arc<RwLock<HashMap<ClusterId, Vec<BackendServer>>>>,
    rotated: Arc<RwLock<HashSet<ClusterId>>>,
    configured: Arc<RwLock<HashSet<ClusterId>>>,
    calls: Arc<RwLock<Vec<RouterCall>>>,
    failing: Arc<RwLock<HashSet<String>>>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hostgroups(&self) -> HostgroupIds {
        self.hostgroups
    }

    /// Every later call of `operation` fails until [`MockRouter::heal`].
    pub async fn fail_operation(&self, operation: &str) {
        self.failing.write().await.insert(operation.to_string());
    }

    pub async fn heal(&self) {
        self.failing.write().await.clear();
    }

    pub async fn calls(&self) -> Vec<RouterCall> {
        self.calls.read().await.clone()
    }

    pub async fn calls_of(&self, operation: &str) -> Vec<RouterCall> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    pub async fn table(&self, cluster_id: &ClusterId) -> Vec<BackendServer> {
        self.tables.read().await.get(cluster_id).cloned().unwrap_or_default()
    }

    pub async fn group(&self, cluster_id: &ClusterId, hostgroup_id: u32) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .table(cluster_id)
            .await
            .into_iter()
            .filter(|s| s.hostgroup_id == hostgroup_id)
            .map(|s| s.hostname)
            .collect();
        hosts.sort();
        hosts
    }

    pub async fn writers(&self, cluster_id: &ClusterId) -> Vec<String> {
        self.group(cluster_id, self.hostgroups.writer).await
    }

    pub async fn readers(&self, cluster_id: &ClusterId) -> Vec<String> {
        self.group(cluster_id, self.hostgroups.reader).await
    }

    pub async fn is_configured(&self, cluster_id: &ClusterId) -> bool {
        self.configured.read().await.contains(cluster_id)
    }

    /// Records the call, then fails it if the operation is poisoned.
    async fn enter(&self, endpoint: &RouterEndpoint, operation: &str, argument: &str) -> Result<()> {
        self.calls.write().await.push(RouterCall {
            cluster_id: endpoint.cluster_id,
            operation: operation.to_string(),
            argument: argument.to_string(),
        });
        if self.failing.read().await.contains(operation) {
            return Err(RouterError::Statement {
                statement: operation.to_string(),
                message: "injected failure".to_string(),
            }
            .into_operation_error(operation, endpoint.cluster_id));
        }
        Ok(())
    }

    fn row(&self, hostgroup_id: u32, target: &RouterTarget, weight: u32) -> BackendServer {
        BackendServer {
            hostgroup_id,
            hostname: target.hostname.clone(),
            port: target.port,
            weight,
            status: "ONLINE".to_string(),
        }
    }

    fn backfill_readers(&self, table: &mut Vec<BackendServer>) {
        let hg = self.hostgroups;
        if table.iter().any(|s| s.hostgroup_id == hg.reader) {
            return;
        }
        let copies: Vec<BackendServer> = table
            .iter()
            .filter(|s| s.hostgroup_id == hg.writer)
            .map(|s| BackendServer {
                hostgroup_id: hg.reader,
                weight: self.weights.reader,
                ..s.clone()
            })
            .collect();
        table.extend(copies);
    }
}

#[async_trait]
impl QueryRouter for MockRouter {
    async fn bootstrap_admin(
        &self,
        endpoint: &RouterEndpoint,
        rotation: &AdminRotation,
    ) -> Result<BootstrapOutcome> {
        if rotation.already_rotated {
            return Ok(BootstrapOutcome::AlreadyRotated);
        }
        self.enter(endpoint, OP_BOOTSTRAP_ADMIN, &rotation.default_user).await?;
        let newly = self.rotated.write().await.insert(endpoint.cluster_id);
        Ok(if newly {
            BootstrapOutcome::Rotated
        } else {
            BootstrapOutcome::AlreadyRotated
        })
    }

    async fn configure_routing(&self, endpoint: &RouterEndpoint, config: &RoutingConfig) -> Result<()> {
        self.enter(endpoint, OP_CONFIGURE_ROUTING, &config.app_user).await?;
        self.configured.write().await.insert(endpoint.cluster_id);
        Ok(())
    }

    async fn apply_topology(
        &self,
        endpoint: &RouterEndpoint,
        write: &RouterTarget,
        reads: &[RouterTarget],
    ) -> Result<()> {
        self.enter(endpoint, OP_APPLY_TOPOLOGY, &write.hostname).await?;
        let desired = desired_servers(self.hostgroups, self.weights, write, reads);
        info!(cluster_id = %endpoint.cluster_id, servers = desired.len(), "MockRouter: topology applied");
        self.tables.write().await.insert(endpoint.cluster_id, desired);
        Ok(())
    }

    async fn add_replica(&self, endpoint: &RouterEndpoint, target: &RouterTarget) -> Result<()> {
        self.enter(endpoint, OP_ADD_REPLICA, &target.hostname).await?;
        let hg = self.hostgroups;
        let mut tables = self.tables.write().await;
        let table = tables.entry(endpoint.cluster_id).or_default();
        table.retain(|s| !(s.hostgroup_id == hg.reader && s.hostname == target.hostname));
        table.push(self.row(hg.reader, target, self.weights.reader));

        let writers: HashSet<String> = table
            .iter()
            .filter(|s| s.hostgroup_id == hg.writer)
            .map(|s| s.hostname.clone())
            .collect();
        table.retain(|s| {
            !(s.hostgroup_id == hg.reader && s.hostname != target.hostname && writers.contains(&s.hostname))
        });
        Ok(())
    }

    async fn remove_server(&self, endpoint: &RouterEndpoint, hostname: &str) -> Result<()> {
        self.enter(endpoint, OP_REMOVE_SERVER, hostname).await?;
        let mut tables = self.tables.write().await;
        let table = tables.entry(endpoint.cluster_id).or_default();
        table.retain(|s| s.hostname != hostname);
        self.backfill_readers(table);
        Ok(())
    }

    async fn update_master(&self, endpoint: &RouterEndpoint, new_primary: &RouterTarget) -> Result<()> {
        self.enter(endpoint, OP_UPDATE_MASTER, &new_primary.hostname).await?;
        let hg = self.hostgroups;
        let mut tables = self.tables.write().await;
        let table = tables.entry(endpoint.cluster_id).or_default();
        table.retain(|s| {
            s.hostgroup_id != hg.writer
                && !(s.hostgroup_id == hg.reader && s.hostname == new_primary.hostname)
        });
        table.push(self.row(hg.writer, new_primary, self.weights.writer));
        self.backfill_readers(table);
        Ok(())
    }

    async fn routing_table(&self, endpoint: &RouterEndpoint) -> Result<Vec<BackendServer>> {
        self.enter(endpoint, OP_ROUTING_TABLE, "").await?;
        Ok(self.table(&endpoint.cluster_id).await)
    }
}
