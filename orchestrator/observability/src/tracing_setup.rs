//! Log output for the orchestrator process.
//!
//! Every workflow runs inside a [`workflow_span!`] and every failover inside
//! a [`failover_span!`], so each log line carries the cluster and task it
//! belongs to. `RUST_LOG` overrides the configured level.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Crates whose debug output drowns the workflow logs.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "h2=warn", "tower_http=info", "mysql_async=warn"];

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub log_level: Level,
    /// One JSON object per line instead of the human-readable format.
    pub json_output: bool,
    /// Log span open and close; useful to time workflow steps.
    pub span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "dbcluster-orchestrator".to_string(),
            log_level: Level::INFO,
            json_output: false,
            span_events: false,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Set the level from its name; unknown names keep the current level.
    pub fn with_level_name(mut self, name: &str) -> Self {
        if let Ok(level) = name.parse::<Level>() {
            self.log_level = level;
        }
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json_output = json;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    fn directives(&self) -> String {
        let mut directives = vec![self.log_level.to_string().to_lowercase()];
        directives.extend(QUIET_TARGETS.iter().map(|d| d.to_string()));
        directives.join(",")
    }

    fn build_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }
}

/// Install the global subscriber. Only the first call has an effect, so
/// tests may call it freely.
///
/// ```no_run
/// use observability::{init_tracing, TracingConfig};
///
/// init_tracing(TracingConfig::new("dbcluster-orchestrator").with_level_name("debug"));
/// ```
pub fn init_tracing(config: TracingConfig) {
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(span_events)
            .boxed()
    } else {
        fmt::layer().with_span_events(span_events).boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(config.build_filter())
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(
            service = %config.service_name,
            level = %config.log_level,
            json = config.json_output,
            "logging initialized"
        );
    }
}

/// Span for one run of a cluster workflow.
#[macro_export]
macro_rules! workflow_span {
    ($workflow:expr, $cluster_id:expr, $task_id:expr) => {
        tracing::info_span!(
            "workflow",
            workflow = $workflow,
            cluster_id = %$cluster_id,
            task_id = %$task_id
        )
    };
}

/// Span for handling one failure-detection event.
#[macro_export]
macro_rules! failover_span {
    ($alias:expr, $failed:expr, $successor:expr) => {
        tracing::info_span!(
            "failover",
            cluster_alias = %$alias,
            failed_host = %$failed,
            successor_host = %$successor
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_by_name() {
        let config = TracingConfig::default().with_level_name("warn");
        assert_eq!(config.log_level, Level::WARN);
        let config = config.with_level_name("loud");
        assert_eq!(config.log_level, Level::WARN);
    }

    #[test]
    fn test_directives_quiet_http_stack() {
        let config = TracingConfig::new("test").with_level(Level::DEBUG);
        let directives = config.directives();
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("hyper=warn"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(TracingConfig::default().with_json(true));
        init_tracing(TracingConfig::default());
    }
}
