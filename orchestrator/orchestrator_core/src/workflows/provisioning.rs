//! Create request to a running cluster: network, primary, replicas, router.
//!
//! A failure after the primary exists does not roll anything back. The
//! cluster goes to `FAILED` with the step and container named in its error
//! message, and every container created so far stays recorded as a node so
//! delete can clean it up.

use std::time::Instant;

use tracing::Instrument;

use container_runtime_interface::{ContainerSpec, HealthCheck};
use observability::workflow_span;
use orchestrator_shared_types::{
    Cluster, ClusterId, ClusterNode, ClusterStatus, NodeRole, NodeStatus, OrchestrationError, Result,
    Task, TaskType,
};
use query_router_interface::{AdminRotation, BootstrapOutcome, RoutingConfig};
use secrecy::SecretString;

use crate::context::EngineContext;
use crate::credentials::OpenedCredentials;
use crate::participant::status_from_records;
use crate::replication::{primary_user_statements, EngineVersion, MysqlShell};

use super::replicas::{bring_up, is_routable, mysql_spec, new_node, ReplicaOutcome, ReplicaPlan, LABEL_CLUSTER, LABEL_ROLE};
use super::{validate_replica_count, validate_resources, CreateClusterRequest, StepError, StepResult};

/// Validates the request and records the cluster in `PROVISIONING` together
/// with its running task. The workflow itself is [`run`].
pub async fn begin(ctx: &EngineContext, request: CreateClusterRequest) -> Result<(Cluster, Task)> {
    if request.name.trim().is_empty() {
        return Err(OrchestrationError::Validation("cluster name must not be empty".to_string()));
    }
    validate_replica_count(request.replica_count)?;
    let engine_version = request
        .engine_version
        .unwrap_or_else(|| ctx.config.images.default_engine_version.clone());
    EngineVersion::parse(&engine_version)?;
    let resources = request
        .resources
        .unwrap_or_else(|| ctx.config.workflows.default_resources());
    validate_resources(&resources)?;

    let credentials = ctx.vault.generate_credentials(
        &ctx.config.router.default_admin_user,
        ctx.config.secrets.password_length,
    )?;
    let mut cluster = Cluster::provisioning(
        request.owner,
        request.name,
        engine_version,
        request.replica_count,
        credentials,
    );
    cluster.resources = resources;
    if let Some(features) = request.features {
        cluster.features = features;
    }

    let cluster = ctx.store.insert_cluster(cluster).await?;
    let task = ctx.tracker.start(cluster.id, TaskType::Provision).await?;
    Ok((cluster, task))
}

pub async fn run(ctx: &EngineContext, cluster_id: ClusterId, task: Task) -> Result<Cluster> {
    let started = Instant::now();
    let outcome = async {
        match provision(ctx, &cluster_id, &task).await {
            Ok(cluster) => Ok(cluster),
            Err(failure) => Err(record_failure(ctx, &cluster_id, &task, failure).await),
        }
    }
    .instrument(workflow_span!("provision", cluster_id, task.id))
    .await;
    ctx.finish(&task, started, &outcome).await;
    outcome
}

async fn record_failure(
    ctx: &EngineContext,
    cluster_id: &ClusterId,
    task: &Task,
    failure: StepError,
) -> OrchestrationError {
    let message = failure.to_string();
    ctx.log(task, &message).await;
    let marked = ctx
        .update_cluster(cluster_id, |c| {
            c.status = ClusterStatus::Failed;
            c.error_message = Some(message.clone());
            Ok(())
        })
        .await;
    if let Err(err) = marked {
        tracing::error!(cluster_id = %cluster_id, error = %err, "could not mark cluster failed");
    }
    failure.source
}

async fn provision(ctx: &EngineContext, cluster_id: &ClusterId, task: &Task) -> std::result::Result<Cluster, StepError> {
    let cluster = ctx.store.require_cluster(cluster_id).await.step("load_cluster")?;
    let creds = ctx.credentials(&cluster).step("open_credentials")?;
    let version = EngineVersion::parse(&cluster.engine_version).step("parse_version")?;
    let naming = ctx.naming(cluster_id);

    // Network
    let network_id = ctx
        .runtime
        .create_network(&naming.network())
        .await
        .step("create_network")?;
    ctx.log(task, format!("network {} created", network_id)).await;
    ctx.update_cluster(cluster_id, |c| {
        c.network_id = Some(network_id.clone());
        Ok(())
    })
    .await
    .step("record_network")?;

    // Primary
    let primary_name = naming.primary();
    let spec = mysql_spec(
        ctx,
        cluster_id,
        &primary_name,
        Some(network_id.as_str()),
        &cluster.engine_version,
        &creds,
        NodeRole::Primary,
        0,
        &cluster.resources,
    );
    let primary_id = ctx.runtime.run_container(&spec).await.step("start_primary")?;
    ctx.log(task, format!("primary {} started as {}", primary_name, primary_id)).await;
    let mut primary = new_node(
        ctx,
        *cluster_id,
        primary_id.clone(),
        &primary_name,
        NodeRole::Primary,
        0,
        &cluster.resources,
    );
    ctx.store.put_node(primary.clone()).await.step_on("record_primary", &primary_id)?;
    ctx.update_cluster(cluster_id, |c| {
        c.primary_container_id = Some(primary_id.clone());
        Ok(())
    })
    .await
    .step_on("record_primary", &primary_id)?;

    ctx.wait_ready(&primary_id, &primary_name)
        .await
        .step_on("wait_primary", &primary_id)?;
    let shell = MysqlShell::new(ctx.runtime.as_ref(), &primary_id, &creds.root_password);
    let users = primary_user_statements(&creds).step_on("create_replication_user", &primary_id)?;
    shell.run(&users).await.step_on("create_replication_user", &primary_id)?;
    primary.status = NodeStatus::Running;
    ctx.store.put_node(primary.clone()).await.step_on("record_primary", &primary_id)?;
    ctx.log(task, "replication credential created on primary").await;

    // Replicas
    let ordinals: Vec<u32> = (1..=cluster.replica_count).collect();
    let plan = ReplicaPlan {
        cluster_id: *cluster_id,
        naming: &naming,
        network: Some(network_id.as_str()),
        engine_version: &cluster.engine_version,
        version,
        source_host: &primary_name,
        creds: &creds,
        resources: &cluster.resources,
    };
    let outcomes = bring_up(ctx, &plan, ordinals, task).await;
    let mut replicas: Vec<ClusterNode> = Vec::new();
    for outcome in outcomes {
        match outcome {
            ReplicaOutcome::Joined(node) | ReplicaOutcome::Stalled { node, .. } => replicas.push(node),
            ReplicaOutcome::NotCreated { .. } => {}
        }
    }
    let replica_ids: Vec<String> = replicas.iter().map(|n| n.container_id.clone()).collect();
    ctx.update_cluster(cluster_id, |c| {
        c.replica_container_ids = replica_ids.clone();
        Ok(())
    })
    .await
    .step("record_replicas")?;

    // Router
    let router = start_router(ctx, &cluster, &network_id, task).await?;
    configure_router(ctx, cluster_id, &creds, &primary, &replicas, task).await?;

    // Final status from what actually came up
    let mut nodes = vec![primary];
    nodes.extend(replicas);
    nodes.push(router);
    let access = ctx.database_access(&cluster).step("derive_status")?;
    let status = status_from_records(&nodes, &access, cluster.replica_count, false);
    let written = ctx
        .update_cluster(cluster_id, |c| {
            c.status = status;
            if status == ClusterStatus::Degraded {
                c.error_message = Some(format!(
                    "{} of {} replicas came up",
                    nodes.iter().filter(|n| n.role == NodeRole::Replica && n.status == NodeStatus::Running).count(),
                    c.replica_count
                ));
            }
            Ok(())
        })
        .await
        .step("finalize")?;
    ctx.log(task, format!("cluster is {}", written.status)).await;
    Ok(written)
}

fn router_health_check(admin_port: u16) -> HealthCheck {
    HealthCheck {
        command: vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("echo > /dev/tcp/127.0.0.1/{}", admin_port),
        ],
        interval: std::time::Duration::from_secs(5),
        retries: 12,
    }
}

async fn start_router(
    ctx: &EngineContext,
    cluster: &Cluster,
    network_id: &str,
    task: &Task,
) -> std::result::Result<ClusterNode, StepError> {
    let naming = ctx.naming(&cluster.id);
    let name = naming.router();
    let resources = ctx.config.workflows.router_resources();

    let mut spec = ContainerSpec::new(&name, &ctx.config.images.router_image);
    spec.network = Some(network_id.to_string());
    spec.labels.insert(LABEL_CLUSTER.to_string(), cluster.id.to_string());
    spec.labels.insert(LABEL_ROLE.to_string(), NodeRole::Router.to_string());
    spec.resources = resources.clone();
    spec.health_check = Some(router_health_check(ctx.config.router.admin_port));

    let router_id = ctx.runtime.run_container(&spec).await.step("start_router")?;
    ctx.log(task, format!("router {} started as {}", name, router_id)).await;
    let mut node = new_node(ctx, cluster.id, router_id.clone(), &name, NodeRole::Router, 0, &resources);
    ctx.store.put_node(node.clone()).await.step_on("record_router", &router_id)?;
    ctx.update_cluster(&cluster.id, |c| {
        c.router_container_id = Some(router_id.clone());
        Ok(())
    })
    .await
    .step_on("record_router", &router_id)?;

    ctx.wait_ready(&router_id, &name).await.step_on("wait_router", &router_id)?;
    node.status = NodeStatus::Running;
    ctx.store.put_node(node.clone()).await.step_on("record_router", &router_id)?;
    Ok(node)
}

/// One-time admin rotation, users, then the initial routing table.
async fn configure_router(
    ctx: &EngineContext,
    cluster_id: &ClusterId,
    creds: &OpenedCredentials,
    primary: &ClusterNode,
    replicas: &[ClusterNode],
    task: &Task,
) -> std::result::Result<(), StepError> {
    let cluster = ctx.store.require_cluster(cluster_id).await.step("bootstrap_router")?;
    let router_id = cluster.router_container_id.clone().unwrap_or_default();
    let endpoint = ctx.router_endpoint(&cluster).step_on("bootstrap_router", &router_id)?;

    let rotation = AdminRotation {
        default_user: ctx.config.router.default_admin_user.clone(),
        default_password: SecretString::new(ctx.config.router.default_admin_password.clone()),
        new_password: creds.router_admin_password.clone(),
        already_rotated: cluster.credentials.router_admin_rotated,
    };
    let rotated = ctx
        .router
        .bootstrap_admin(&endpoint, &rotation)
        .await
        .map_err(|e| router_failed(ctx, e))
        .step_on("bootstrap_router", &router_id)?;
    if !cluster.credentials.router_admin_rotated {
        ctx.update_cluster(cluster_id, |c| {
            c.credentials.router_admin_rotated = true;
            Ok(())
        })
        .await
        .step_on("bootstrap_router", &router_id)?;
    }
    match rotated {
        BootstrapOutcome::Rotated => ctx.log(task, "router admin credential rotated").await,
        BootstrapOutcome::AlreadyRotated => ctx.log(task, "router admin credential already rotated").await,
    }

    let routing = RoutingConfig {
        monitor_user: creds.monitor_user.clone(),
        monitor_password: creds.monitor_password.clone(),
        app_user: creds.app_user.clone(),
        app_password: creds.app_password.clone(),
    };
    ctx.router
        .configure_routing(&endpoint, &routing)
        .await
        .map_err(|e| router_failed(ctx, e))
        .step_on("configure_routing", &router_id)?;

    let write = ctx
        .router_target(*cluster_id, &primary.hostname)
        .step_on("apply_topology", &router_id)?;
    let reads = replicas
        .iter()
        .filter(|n| is_routable(n))
        .map(|n| ctx.router_target(*cluster_id, &n.hostname))
        .collect::<Result<Vec<_>>>()
        .step_on("apply_topology", &router_id)?;
    ctx.router
        .apply_topology(&endpoint, &write, &reads)
        .await
        .map_err(|e| router_failed(ctx, e))
        .step_on("apply_topology", &router_id)?;
    ctx.log(
        task,
        format!("router writes to {} and reads from {} replicas", write.hostname, reads.len()),
    )
    .await;
    Ok(())
}

fn router_failed(ctx: &EngineContext, err: OrchestrationError) -> OrchestrationError {
    if let OrchestrationError::RouterOperationFailed { operation, .. } = &err {
        ctx.metrics.router_failure(operation);
    }
    err
}
