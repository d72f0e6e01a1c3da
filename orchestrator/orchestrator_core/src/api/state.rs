//! API server state.

use std::sync::Arc;

use observability::MetricsRegistry;

use crate::Orchestrator;

/// Shared state for the API server.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    /// Scrape source for `GET /metrics`; absent when no recorder is installed.
    pub metrics: Option<Arc<MetricsRegistry>>,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(registry);
        self
    }
}
