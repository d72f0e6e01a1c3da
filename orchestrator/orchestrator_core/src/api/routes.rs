//! API route definitions.

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::ApiState;

/// Build the API router with all routes.
pub fn build_router(state: ApiState) -> Router {
    // Cluster routes
    let cluster_routes = Router::new()
        .route("/", post(handlers::create_cluster).get(handlers::list_clusters))
        .route(
            "/:cluster_id",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route("/:cluster_id/scale", post(handlers::scale_cluster))
        .route("/:cluster_id/stop", post(handlers::stop_cluster))
        .route("/:cluster_id/start", post(handlers::start_cluster))
        .route("/:cluster_id/refresh", post(handlers::refresh_cluster))
        .route("/:cluster_id/nodes", get(handlers::list_nodes))
        .route("/:cluster_id/nodes/:node_id/stats", get(handlers::node_stats))
        .route("/:cluster_id/nodes/:node_id/logs", get(handlers::node_logs))
        .route("/:cluster_id/tasks", get(handlers::list_tasks))
        .route("/:cluster_id/tasks/:task_id", get(handlers::get_task));

    // Inbound events from the topology monitor
    let webhook_routes = Router::new().route("/orchestrator/failover", post(handlers::failover_webhook));

    let api_v1 = Router::new()
        .nest("/clusters", cluster_routes)
        .nest("/webhooks", webhook_routes);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api_v1)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Where the API listens.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: ApiState) -> Self {
        Self { config, state }
    }

    /// Serves until `shutdown` resolves, then lets in-flight requests
    /// finish. Background workflows keep running on the runtime.
    pub async fn serve_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "API server listening");
        axum::serve(listener, build_router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
    }
}
