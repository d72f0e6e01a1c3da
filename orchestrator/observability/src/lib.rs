//! Observability stack for the cluster orchestrator.
//!
//! - **Tracing**: structured logging with spans per workflow and failover
//! - **Metrics**: Prometheus-compatible counters for workflows and router calls
//! - **Events**: per-cluster notification topics for failovers and alerts
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              Observability Layer              │
//! ├──────────────┬───────────────┬────────────────┤
//! │   Tracing    │    Metrics    │     Events     │
//! │  (tracing)   │ (prometheus)  │  (broadcast)   │
//! ├──────────────┴───────────────┴────────────────┤
//! │             Orchestrator workflows            │
//! └───────────────────────────────────────────────┘
//! ```

pub mod events;
pub mod metrics;
pub mod tracing_setup;

pub use events::{
    cluster_topic, AlertEventData, AlertSeverity, EventHub, EventHubMetrics, EventType,
    FailoverEventData, NotificationSink, StreamEvent, TopicSubscription,
};
pub use metrics::{MetricsRegistry, OrchestratorMetrics};
pub use tracing_setup::{init_tracing, TracingConfig};

/// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level};
