//! Query router adapter contract.
//!
//! A router splits traffic between a writer hostgroup (the primary) and a
//! reader hostgroup (the replicas). Implementations are stateless per call:
//! every method receives the [`RouterEndpoint`] of the cluster's router and
//! ends by loading the change into the router's runtime and then persisting
//! it, so a crash between the two is repaired by re-applying.

use async_trait::async_trait;
use orchestrator_shared_types::{ClusterId, OrchestrationError, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod statement;

pub use statement::{validate_hostname, AdminParam, AdminStatement};

pub const OP_APPLY_TOPOLOGY: &str = "apply_topology";
pub const OP_ADD_REPLICA: &str = "add_replica";
pub const OP_REMOVE_SERVER: &str = "remove_server";
pub const OP_UPDATE_MASTER: &str = "update_master";
pub const OP_BOOTSTRAP_ADMIN: &str = "bootstrap_admin";
pub const OP_CONFIGURE_ROUTING: &str = "configure_routing";
pub const OP_ROUTING_TABLE: &str = "routing_table";

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Connection to router admin failed: {0}")]
    Connection(String),
    #[error("Statement failed: {statement}: {message}")]
    Statement { statement: String, message: String },
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Parameter binding failed: {0}")]
    Binding(String),
    #[error("Invalid hostname: {0:?}")]
    InvalidHostname(String),
}

impl RouterError {
    pub fn into_operation_error(self, operation: &str, cluster_id: ClusterId) -> OrchestrationError {
        OrchestrationError::RouterOperationFailed {
            operation: operation.to_string(),
            cluster_id,
            message: self.to_string(),
        }
    }
}

/// Numeric hostgroup ids as configured on the router.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostgroupIds {
    pub writer: u32,
    pub reader: u32,
}

impl Default for HostgroupIds {
    fn default() -> Self {
        Self { writer: 10, reader: 20 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterWeights {
    pub writer: u32,
    pub reader: u32,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            writer: 1000,
            reader: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Hostgroup {
    Writer,
    Reader,
}

/// A backend the router should send traffic to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RouterTarget {
    pub hostname: String,
    pub port: u16,
}

impl RouterTarget {
    pub fn new(hostname: impl Into<String>, port: u16) -> std::result::Result<Self, RouterError> {
        let hostname = hostname.into();
        validate_hostname(&hostname)?;
        Ok(Self { hostname, port })
    }
}

/// One row of the router's server table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendServer {
    pub hostgroup_id: u32,
    pub hostname: String,
    pub port: u16,
    pub weight: u32,
    pub status: String,
}

/// Where and as whom to reach a cluster's router admin interface.
#[derive(Debug, Clone)]
pub struct RouterEndpoint {
    pub cluster_id: ClusterId,
    pub host: String,
    pub admin_port: u16,
    pub admin_user: String,
    pub admin_password: SecretString,
}

/// First-boot credential rotation request.
#[derive(Debug, Clone)]
pub struct AdminRotation {
    pub default_user: String,
    pub default_password: SecretString,
    pub new_password: SecretString,
    /// Recorded state: the rotation already happened.
    pub already_rotated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Rotated,
    AlreadyRotated,
}

/// Users and rules the router needs before it can route.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub monitor_user: String,
    pub monitor_password: SecretString,
    pub app_user: String,
    pub app_password: SecretString,
}

/// Rows a router must hold for a given write target and read targets.
///
/// With no read targets the write target is also placed in the reader group,
/// so both hostgroups are always populated.
pub fn desired_servers(
    hostgroups: HostgroupIds,
    weights: RouterWeights,
    write: &RouterTarget,
    reads: &[RouterTarget],
) -> Vec<BackendServer> {
    let row = |hostgroup_id: u32, target: &RouterTarget, weight: u32| BackendServer {
        hostgroup_id,
        hostname: target.hostname.clone(),
        port: target.port,
        weight,
        status: "ONLINE".to_string(),
    };

    let mut servers = vec![row(hostgroups.writer, write, weights.writer)];
    if reads.is_empty() {
        servers.push(row(hostgroups.reader, write, weights.reader));
    } else {
        for target in reads.iter().filter(|t| t.hostname != write.hostname) {
            servers.push(row(hostgroups.reader, target, weights.reader));
        }
    }
    servers
}

#[async_trait]
pub trait QueryRouter: Send + Sync {
    /// Rotates the router's first-boot admin credential. Returns
    /// `AlreadyRotated` without changes when the rotation was recorded or the
    /// new credential is already in effect.
    async fn bootstrap_admin(
        &self,
        endpoint: &RouterEndpoint,
        rotation: &AdminRotation,
    ) -> Result<BootstrapOutcome>;

    /// Monitor credentials, application user and read/write split rules.
    async fn configure_routing(&self, endpoint: &RouterEndpoint, config: &RoutingConfig) -> Result<()>;

    /// Makes the routing table match `write` and `reads` exactly.
    async fn apply_topology(
        &self,
        endpoint: &RouterEndpoint,
        write: &RouterTarget,
        reads: &[RouterTarget],
    ) -> Result<()>;

    /// Adds one reader entry.
    async fn add_replica(&self, endpoint: &RouterEndpoint, target: &RouterTarget) -> Result<()>;

    /// Removes every entry for `hostname`.
    async fn remove_server(&self, endpoint: &RouterEndpoint, hostname: &str) -> Result<()>;

    /// Replaces the writer entry with `new_primary`, removing it from the readers.
    async fn update_master(&self, endpoint: &RouterEndpoint, new_primary: &RouterTarget) -> Result<()>;

    /// The router's live (runtime) server table.
    async fn routing_table(&self, endpoint: &RouterEndpoint) -> Result<Vec<BackendServer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> RouterTarget {
        RouterTarget::new(host, 3306).unwrap()
    }

    #[test]
    fn test_desired_servers_splits_groups() {
        let servers = desired_servers(
            HostgroupIds::default(),
            RouterWeights::default(),
            &target("p"),
            &[target("r1"), target("r2")],
        );
        let writers: Vec<_> = servers.iter().filter(|s| s.hostgroup_id == 10).collect();
        let readers: Vec<_> = servers.iter().filter(|s| s.hostgroup_id == 20).collect();
        assert_eq!(writers.len(), 1);
        assert_eq!(writers[0].weight, 1000);
        assert_eq!(readers.len(), 2);
        assert!(readers.iter().all(|s| s.weight == 500));
    }

    #[test]
    fn test_primary_serves_reads_without_replicas() {
        let servers = desired_servers(
            HostgroupIds::default(),
            RouterWeights::default(),
            &target("p"),
            &[],
        );
        assert_eq!(servers.len(), 2);
        assert!(servers.iter().all(|s| s.hostname == "p"));
    }

    #[test]
    fn test_target_rejects_injection() {
        assert!(RouterTarget::new("x'); DELETE FROM mysql_users; --", 3306).is_err());
    }

    #[test]
    fn test_router_error_carries_operation() {
        let cid = ClusterId::nil();
        let err = RouterError::Connection("refused".into()).into_operation_error(OP_UPDATE_MASTER, cid);
        match err {
            OrchestrationError::RouterOperationFailed { operation, cluster_id, .. } => {
                assert_eq!(operation, "update_master");
                assert_eq!(cluster_id, cid);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
