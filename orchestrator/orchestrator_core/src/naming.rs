//! Names of the things the engine creates for a cluster.
//!
//! Container name and hostname are the same string, so the router and the
//! topology monitor refer to a node by the name the runtime gave it.

use orchestrator_shared_types::{ClusterId, OrchestrationError, Result};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ClusterNaming {
    base: String,
}

impl ClusterNaming {
    pub fn new(container_prefix: &str, cluster_id: &ClusterId) -> Self {
        let simple = cluster_id.simple().to_string();
        Self {
            base: format!("{}-{}", container_prefix, &simple[..12]),
        }
    }

    pub fn network(&self) -> String {
        format!("{}-net", self.base)
    }

    pub fn primary(&self) -> String {
        format!("{}-primary", self.base)
    }

    pub fn replica(&self, ordinal: u32) -> String {
        format!("{}-replica-{}", self.base, ordinal)
    }

    pub fn router(&self) -> String {
        format!("{}-router", self.base)
    }
}

/// Alias the topology monitor uses for a cluster.
pub fn cluster_alias(alias_prefix: &str, cluster_id: &ClusterId) -> String {
    format!("{}-{}", alias_prefix, cluster_id)
}

/// Reverse of [`cluster_alias`]. Anything that does not parse names no
/// managed cluster.
pub fn parse_cluster_alias(alias_prefix: &str, alias: &str) -> Result<ClusterId> {
    alias
        .strip_prefix(alias_prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| OrchestrationError::ClusterNotFound(alias.to_string()))
}
