//! Prometheus-compatible metrics for the orchestrator.
//!
//! Counters and histograms for workflows, failover reconciliation, router
//! operations and cluster lifecycle transitions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Registry for orchestrator metrics with Prometheus exporter.
pub struct MetricsRegistry {
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Installs the Prometheus recorder as the process-wide recorder.
    /// Fails if another recorder is already installed.
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        // Register metric descriptions
        Self::register_descriptions();

        Ok(Self { handle })
    }

    /// A registry whose recorder is not installed globally. It renders an
    /// empty scrape; used when a recorder is already present.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// Register all metric descriptions.
    fn register_descriptions() {
        describe_counter!(
            "dbcluster_workflows_total",
            "Workflows finished, by type and outcome"
        );
        describe_histogram!(
            "dbcluster_workflow_duration_seconds",
            "Wall time of a workflow from start to terminal task status"
        );
        describe_counter!(
            "dbcluster_failover_reconciliations_total",
            "Failover events processed, by outcome"
        );
        describe_counter!(
            "dbcluster_router_failures_total",
            "Router adapter calls that failed, by operation"
        );
        describe_counter!(
            "dbcluster_status_transitions_total",
            "Cluster lifecycle transitions"
        );
        describe_counter!(
            "dbcluster_cas_conflicts_total",
            "Version-conditioned cluster writes that hit a newer version"
        );
        describe_counter!(
            "dbcluster_rejected_operations_total",
            "Structural operations rejected because another was in flight"
        );
        describe_gauge!(
            "dbcluster_clusters",
            "Managed clusters by lifecycle status"
        );
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// High-level interface for recording orchestrator metrics.
#[derive(Clone, Default)]
pub struct OrchestratorMetrics;

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self
    }

    // === Workflow Metrics ===

    pub fn workflow_finished(&self, task_type: &str, outcome: &str, duration_secs: f64) {
        counter!(
            "dbcluster_workflows_total",
            "type" => task_type.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        histogram!("dbcluster_workflow_duration_seconds", "type" => task_type.to_string())
            .record(duration_secs);
    }

    pub fn operation_rejected(&self, task_type: &str) {
        counter!("dbcluster_rejected_operations_total", "type" => task_type.to_string()).increment(1);
    }

    // === Failover Metrics ===

    pub fn failover_reconciled(&self, outcome: &str) {
        counter!("dbcluster_failover_reconciliations_total", "outcome" => outcome.to_string())
            .increment(1);
    }

    // === Router Metrics ===

    pub fn router_failure(&self, operation: &str) {
        counter!("dbcluster_router_failures_total", "operation" => operation.to_string()).increment(1);
    }

    // === Lifecycle Metrics ===

    pub fn status_transition(&self, from: &str, to: &str) {
        counter!(
            "dbcluster_status_transitions_total",
            "from" => from.to_string(),
            "to" => to.to_string()
        )
        .increment(1);
    }

    pub fn cas_conflict(&self) {
        counter!("dbcluster_cas_conflicts_total").increment(1);
    }

    pub fn set_clusters_by_status(&self, status: &str, count: u64) {
        gauge!("dbcluster_clusters", "status" => status.to_string()).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_registry_renders() {
        let registry = MetricsRegistry::detached();
        OrchestratorMetrics::new().cas_conflict();
        // The global macros never reach a detached recorder
        assert!(!registry.render().contains("dbcluster_cas_conflicts_total"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = OrchestratorMetrics::new();
        metrics.workflow_finished("PROVISION", "completed", 0.5);
        metrics.failover_reconciled("degraded");
        metrics.router_failure("update_master");
        metrics.status_transition("PROVISIONING", "HEALTHY");
        metrics.cas_conflict();
    }
}
