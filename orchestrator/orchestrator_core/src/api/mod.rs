//! REST API module for the orchestrator.
//!
//! # Endpoints
//!
//! ## Clusters
//! - `POST /api/v1/clusters` - Create a cluster (202, provisioning continues in the background)
//! - `GET /api/v1/clusters` - List clusters
//! - `GET /api/v1/clusters/:id` - Get a cluster
//! - `DELETE /api/v1/clusters/:id` - Delete a cluster
//! - `POST /api/v1/clusters/:id/scale` - Change the replica count
//! - `POST /api/v1/clusters/:id/stop` / `start` - Stop or start every container
//! - `POST /api/v1/clusters/:id/refresh` - Observe node health now
//!
//! ## Nodes and tasks
//! - `GET /api/v1/clusters/:id/nodes`
//! - `GET /api/v1/clusters/:id/nodes/:node_id/stats`
//! - `GET /api/v1/clusters/:id/nodes/:node_id/logs?lines=N&timestamps=true`
//! - `GET /api/v1/clusters/:id/tasks`
//! - `GET /api/v1/clusters/:id/tasks/:task_id`
//!
//! ## Webhooks
//! - `POST /api/v1/webhooks/orchestrator/failover` - Topology monitor failure events
//!
//! `GET /health` and `GET /metrics` sit outside the versioned prefix.
//!
//! Structural operations answer `409 Conflict` while another one is in
//! flight for the same cluster; callers retry.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::{build_router, ApiServer, ApiServerConfig};
pub use state::ApiState;
