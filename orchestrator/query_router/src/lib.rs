//! Query router implementations.
//!
//! - `ProxySqlRouter`: drives a ProxySQL admin interface (requires `proxysql` feature)
//! - `MockRouter`: in-memory routing tables for tests (requires `mock-router` feature)

#[cfg(feature = "proxysql")]
pub mod proxysql;

#[cfg(feature = "mock-router")]
pub mod mock;

pub use query_router_interface::{
    AdminRotation, BackendServer, BootstrapOutcome, HostgroupIds, QueryRouter, RouterEndpoint,
    RouterError, RouterTarget, RouterWeights, RoutingConfig,
};

#[cfg(feature = "proxysql")]
pub use proxysql::{ProxySqlConfig, ProxySqlRouter};

#[cfg(feature = "mock-router")]
pub use mock::{MockRouter, RouterCall};
