//! `dbcluster-orchestrator`: the engine plus its REST API in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use container_runtime::{DockerCliConfig, DockerCliRuntime, MockRuntime};
use container_runtime_interface::ContainerRuntime;
use observability::{init_tracing, EventHub, MetricsRegistry, TracingConfig};
use orchestrator_core::api::{ApiServer, ApiServerConfig, ApiState};
use orchestrator_core::config::{OrchestratorConfig, RouterKind, RuntimeKind};
use orchestrator_core::{CredentialVault, Orchestrator};
use query_router::{MockRouter, ProxySqlConfig, ProxySqlRouter};
use query_router_interface::QueryRouter;
use state_store_interface::create_state_store;

const EVENT_HUB_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::load().await.context("loading configuration")?;

    init_tracing(
        TracingConfig::new("dbcluster-orchestrator")
            .with_level_name(&config.logging.level)
            .with_json(config.logging.json),
    );

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime.kind {
        RuntimeKind::Docker => {
            let docker = DockerCliRuntime::with_config(DockerCliConfig {
                docker_binary: config.runtime.docker_binary.clone(),
                command_timeout: Duration::from_secs(config.runtime.command_timeout_secs),
                stop_timeout: Duration::from_secs(config.runtime.stop_timeout_secs),
            })
            .await
            .context("docker CLI is not usable")?;
            Arc::new(docker)
        }
        RuntimeKind::Mock => {
            warn!("using the in-memory container runtime; nothing will actually run");
            Arc::new(MockRuntime::new())
        }
    };

    let router: Arc<dyn QueryRouter> = match config.router.kind {
        RouterKind::Proxysql => Arc::new(ProxySqlRouter::new(ProxySqlConfig {
            hostgroups: config.router.hostgroups(),
            weights: config.router.weights(),
            connect_timeout: Duration::from_secs(config.router.connect_timeout_secs),
            statement_timeout: Duration::from_secs(config.router.statement_timeout_secs),
        })),
        RouterKind::Mock => {
            warn!("using the in-memory query router");
            Arc::new(MockRouter::new())
        }
    };

    let store = create_state_store(config.store.to_state_store_config()?)
        .await
        .context("opening state store")?;
    store.initialize().await.context("initializing state store")?;

    let vault = CredentialVault::load_or_create(&config.secrets.key_file)
        .await
        .with_context(|| format!("loading vault key {}", config.secrets.key_file.display()))?;

    let metrics = match MetricsRegistry::install() {
        Ok(registry) => registry,
        Err(e) => {
            warn!(error = %e, "metrics recorder already installed; /metrics will be empty");
            MetricsRegistry::detached()
        }
    };

    let events = Arc::new(EventHub::new(EVENT_HUB_CAPACITY));
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.server.bind_address, config.server.port))?;
    let health_interval_secs = config.workflows.health_interval_secs;

    let orchestrator = Orchestrator::new(store, runtime, router, events, Arc::new(vault), config);
    let health_loop = if health_interval_secs > 0 {
        Some(orchestrator.spawn_health_loop(Duration::from_secs(health_interval_secs)))
    } else {
        info!("health refresh loop disabled");
        None
    };

    let state = ApiState::new(orchestrator).with_metrics(Arc::new(metrics));
    let server = ApiServer::new(ApiServerConfig { bind_addr }, state);
    info!(%bind_addr, "dbcluster orchestrator starting");

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await
        .context("API server exited")?;
    if let Some(handle) = health_loop {
        handle.abort();
    }
    Ok(())
}
