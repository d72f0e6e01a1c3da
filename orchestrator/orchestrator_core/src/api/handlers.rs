//! API request handlers.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use container_runtime_interface::LogOptions;
use orchestrator_shared_types::{
    Cluster, ClusterFeatures, ClusterId, ClusterStatus, ContainerId, NodeId, NodeResources, OrchestrationError,
    TaskId,
};

use crate::workflows::{CreateClusterRequest, FailoverEvent, ScaleRequest};
use crate::FailoverOutcome;

use super::error::{ApiError, ApiResult};
use super::state::ApiState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Response for list operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub count: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let count = items.len();
        Self { items, count }
    }
}

/// A cluster as the API shows it. Credentials never leave the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub id: ClusterId,
    pub owner: String,
    pub name: String,
    pub engine_version: String,
    pub replica_count: u32,
    pub status: ClusterStatus,
    pub network_id: Option<String>,
    pub primary_container_id: Option<ContainerId>,
    pub router_container_id: Option<ContainerId>,
    pub replica_container_ids: Vec<ContainerId>,
    pub features: ClusterFeatures,
    pub resources: NodeResources,
    pub version: u64,
    pub error_message: Option<String>,
    pub router_sync_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Cluster> for ClusterResponse {
    fn from(c: Cluster) -> Self {
        ClusterResponse {
            id: c.id,
            owner: c.owner,
            name: c.name,
            engine_version: c.engine_version,
            replica_count: c.replica_count,
            status: c.status,
            network_id: c.network_id,
            primary_container_id: c.primary_container_id,
            router_container_id: c.router_container_id,
            replica_container_ids: c.replica_container_ids,
            features: c.features,
            resources: c.resources,
            version: c.version,
            error_message: c.error_message,
            router_sync_pending: c.router_sync_pending,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterResponse {
    pub cluster: ClusterResponse,
    pub task_id: TaskId,
}

/// Returned by every operation that continues in the background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub cluster_id: ClusterId,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverResponse {
    pub outcome: FailoverOutcome,
}

/// Query parameters for log requests.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LogsQuery {
    /// Return only the last N lines.
    pub lines: Option<usize>,
    /// Include timestamps in output.
    #[serde(default)]
    pub timestamps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub logs: String,
    /// Number of lines returned.
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: bool,
}

// ============================================================================
// Cluster Handlers
// ============================================================================

/// Create a cluster; provisioning continues in the background.
pub async fn create_cluster(
    State(state): State<ApiState>,
    Json(request): Json<CreateClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    let (cluster, task_id) = state.orchestrator.create_cluster(request).await?;
    info!(cluster_id = %cluster.id, task_id = %task_id, "cluster creation accepted");
    let response = CreateClusterResponse {
        cluster: cluster.into(),
        task_id,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn list_clusters(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let clusters = state.orchestrator.list_clusters().await?;
    let items: Vec<ClusterResponse> = clusters.into_iter().map(Into::into).collect();
    Ok(Json(ListResponse::from(items)))
}

pub async fn get_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cluster = state.orchestrator.get_cluster(&cluster_id).await?;
    Ok(Json(ClusterResponse::from(cluster)))
}

pub async fn delete_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task_id = state.orchestrator.delete_cluster(&cluster_id).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { cluster_id, task_id })))
}

pub async fn scale_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
    Json(request): Json<ScaleRequest>,
) -> ApiResult<impl IntoResponse> {
    let task_id = state.orchestrator.scale_cluster(&cluster_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { cluster_id, task_id })))
}

pub async fn stop_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task_id = state.orchestrator.stop_cluster(&cluster_id).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { cluster_id, task_id })))
}

pub async fn start_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task_id = state.orchestrator.start_cluster(&cluster_id).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { cluster_id, task_id })))
}

/// Run one health observation round now and return the result.
pub async fn refresh_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cluster = state.orchestrator.refresh_health(&cluster_id).await?;
    Ok(Json(ClusterResponse::from(cluster)))
}

// ============================================================================
// Node Handlers
// ============================================================================

pub async fn list_nodes(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let nodes = state.orchestrator.list_nodes(&cluster_id).await?;
    Ok(Json(ListResponse::from(nodes)))
}

pub async fn node_stats(
    State(state): State<ApiState>,
    Path((cluster_id, node_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let stats = state.orchestrator.node_stats(&cluster_id, &node_id).await?;
    Ok(Json(stats))
}

pub async fn node_logs(
    State(state): State<ApiState>,
    Path((cluster_id, node_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let options = LogOptions {
        tail: query.lines,
        timestamps: query.timestamps,
    };
    let logs = state.orchestrator.node_logs(&cluster_id, &node_id, &options).await?;
    let lines = logs.lines().count();
    Ok(Json(LogsResponse {
        cluster_id,
        node_id,
        logs,
        lines,
    }))
}

// ============================================================================
// Task Handlers
// ============================================================================

pub async fn list_tasks(
    State(state): State<ApiState>,
    Path(cluster_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let tasks = state.orchestrator.list_tasks(&cluster_id).await?;
    Ok(Json(ListResponse::from(tasks)))
}

pub async fn get_task(
    State(state): State<ApiState>,
    Path((cluster_id, task_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let task = state.orchestrator.get_task(&cluster_id, &task_id).await?;
    Ok(Json(task))
}

// ============================================================================
// Webhooks
// ============================================================================

/// Failure-detection event from the topology monitor. Reconciliation runs
/// before the response is sent. A structural workflow in flight answers 503
/// so the monitor redelivers.
pub async fn failover_webhook(
    State(state): State<ApiState>,
    Json(event): Json<FailoverEvent>,
) -> ApiResult<impl IntoResponse> {
    if event.successor_host.is_empty() {
        return Err(ApiError::validation_error("successorHost is required"));
    }
    match state.orchestrator.handle_failover(event.clone()).await {
        Ok(outcome) => Ok(Json(FailoverResponse { outcome })),
        Err(err) => {
            if !matches!(err, OrchestrationError::ClusterNotFound(_)) {
                warn!(
                    alias = %event.cluster_alias,
                    successor = %event.successor_host,
                    error = %err,
                    "failover event not reconciled"
                );
            }
            let busy = matches!(
                err,
                OrchestrationError::OperationInProgress { .. } | OrchestrationError::ConcurrentModification { .. }
            );
            let api = ApiError::from(err);
            Err(if busy { api.retry_later() } else { api })
        }
    }
}

// ============================================================================
// Service endpoints
// ============================================================================

pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state
        .orchestrator
        .context()
        .store
        .health_check()
        .await
        .unwrap_or(false);
    let (code, status) = if store {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            store,
        }),
    )
}

pub async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = state.metrics.as_ref().map(|m| m.render()).unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
