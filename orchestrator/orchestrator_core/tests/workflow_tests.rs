//! Provisioning, scaling, stop/start and delete against the in-memory
//! runtime and router.

mod common;

use common::{create_request, harness, REPLICATING};
use container_runtime_interface::{ContainerRuntime, ExecOutput};
use orchestrator_core::ScaleRequest;
use orchestrator_shared_types::{
    ClusterStatus, NodeRole, NodeStatus, OrchestrationError, TaskStatus, TaskType,
};
use query_router_interface::{QueryRouter, OP_ADD_REPLICA, OP_REMOVE_SERVER};
use state_store_interface::StateStore;
use std::sync::atomic::Ordering;

const CATCHING_UP: &str = "Replica_IO_Running: Connecting\nReplica_SQL_Running: Yes\n";

fn replica_status(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn scale_to(replica_count: u32) -> ScaleRequest {
    ScaleRequest {
        replica_count,
        resources: None,
    }
}

#[tokio::test]
async fn test_provisioning_builds_primary_replicas_and_router() {
    let h = harness().await;
    let (cluster, task_id) = h
        .orchestrator
        .create_cluster(create_request("orders", 2))
        .await
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Provisioning);

    let task = h.wait_for_task(&cluster.id, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.task_type, TaskType::Provision);

    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Healthy);
    assert_eq!(cluster.replica_count, 2);
    assert_eq!(cluster.replica_container_ids.len(), 2);
    assert!(cluster.primary_container_id.is_some());
    assert!(cluster.router_container_id.is_some());
    assert!(cluster.network_id.is_some());
    assert!(cluster.error_message.is_none());

    let primaries = h.nodes_with_role(&cluster.id, NodeRole::Primary).await;
    let replicas = h.nodes_with_role(&cluster.id, NodeRole::Replica).await;
    assert_eq!(primaries.len(), 1);
    assert_eq!(replicas.len(), 2);
    assert!(!primaries[0].read_only);
    assert!(replicas.iter().all(|r| r.read_only && r.status == NodeStatus::Running));
    assert_eq!(h.nodes_with_role(&cluster.id, NodeRole::Router).await.len(), 1);

    assert!(h.router.is_configured(&cluster.id).await);
    assert_eq!(h.router.writers(&cluster.id).await, vec![primaries[0].hostname.clone()]);
    let mut expected_readers: Vec<String> = replicas.iter().map(|r| r.hostname.clone()).collect();
    expected_readers.sort();
    assert_eq!(h.router.readers(&cluster.id).await, expected_readers);

    assert!(cluster.topology_is_consistent());
    let primary_spec = h
        .runtime
        .spec_of(&primaries[0].container_id)
        .await
        .expect("primary container exists");
    assert_eq!(primary_spec.network, cluster.network_id);

    // primary, two replicas, router
    assert_eq!(h.runtime.container_count().await, 4);
    assert_eq!(h.runtime.network_count().await, 1);
}

#[tokio::test]
async fn test_provisioning_rejects_oversized_replica_count() {
    let h = harness().await;
    let err = h
        .orchestrator
        .create_cluster(create_request("orders", 99))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation(_)));
    assert!(h.orchestrator.list_clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_provisioning_with_unready_replica_ends_degraded() {
    let h = harness().await;
    h.runtime.never_ready_matching("replica-2").await;
    let (cluster, task_id) = h
        .orchestrator
        .create_cluster(create_request("orders", 2))
        .await
        .unwrap();
    h.wait_for_task(&cluster.id, &task_id).await;

    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Degraded);
    assert!(cluster.error_message.is_some());
}

#[tokio::test]
async fn test_replicas_still_catching_up_are_routed() {
    let h = harness().await;
    h.runtime
        .respond_to_exec("SHOW REPLICA STATUS", replica_status(CATCHING_UP))
        .await;
    let cluster = h.provisioned("orders", 2).await;
    assert_eq!(cluster.status, ClusterStatus::Degraded);

    let primary = h.nodes_with_role(&cluster.id, NodeRole::Primary).await.remove(0);
    let replicas = h.nodes_with_role(&cluster.id, NodeRole::Replica).await;
    assert!(replicas.iter().all(|r| r.status == NodeStatus::Syncing));
    let expected_readers: Vec<String> = replicas.iter().map(|r| r.hostname.clone()).collect();
    assert_eq!(h.router.readers(&cluster.id).await, expected_readers);
    assert!(!h.router.readers(&cluster.id).await.contains(&primary.hostname));

    h.runtime
        .respond_to_exec("SHOW REPLICA STATUS", replica_status(REPLICATING))
        .await;
    let refreshed = h.orchestrator.refresh_health(&cluster.id).await.unwrap();
    assert_eq!(refreshed.status, ClusterStatus::Healthy);
    assert_eq!(h.router.readers(&cluster.id).await, expected_readers);
}

#[tokio::test]
async fn test_provisioning_fails_when_primary_cannot_be_created() {
    let h = harness().await;
    h.runtime.fail_create_matching("primary").await;
    let (cluster, task_id) = h
        .orchestrator
        .create_cluster(create_request("orders", 1))
        .await
        .unwrap();
    let task = h.wait_for_task(&cluster.id, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);

    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert!(cluster.error_message.is_some());
}

#[tokio::test]
async fn test_scale_down_removes_highest_ordinals_first() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 3).await;
    let replicas = h.nodes_with_role(&cluster.id, NodeRole::Replica).await;
    let primary_before = cluster.primary_container_id.clone();

    let task_id = h.orchestrator.scale_cluster(&cluster.id, scale_to(1)).await.unwrap();
    let task = h.wait_for_task(&cluster.id, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    let removed: Vec<String> = h
        .router
        .calls_of(OP_REMOVE_SERVER)
        .await
        .into_iter()
        .map(|c| c.argument)
        .collect();
    assert_eq!(removed, vec![replicas[2].hostname.clone(), replicas[1].hostname.clone()]);

    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Healthy);
    assert_eq!(cluster.replica_count, 1);
    assert_eq!(cluster.replica_container_ids, vec![replicas[0].container_id.clone()]);
    assert_eq!(cluster.primary_container_id, primary_before);
    assert_eq!(h.router.readers(&cluster.id).await, vec![replicas[0].hostname.clone()]);
}

#[tokio::test]
async fn test_scale_up_then_back_to_zero_leaves_no_replicas() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    assert_eq!(cluster.status, ClusterStatus::Healthy);

    let task_id = h.orchestrator.scale_cluster(&cluster.id, scale_to(2)).await.unwrap();
    assert_eq!(h.wait_for_task(&cluster.id, &task_id).await.status, TaskStatus::Completed);
    assert_eq!(h.nodes_with_role(&cluster.id, NodeRole::Replica).await.len(), 2);
    assert_eq!(h.router.readers(&cluster.id).await.len(), 2);

    let task_id = h.orchestrator.scale_cluster(&cluster.id, scale_to(0)).await.unwrap();
    assert_eq!(h.wait_for_task(&cluster.id, &task_id).await.status, TaskStatus::Completed);

    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.replica_count, 0);
    assert!(cluster.replica_container_ids.is_empty());
    assert!(h.nodes_with_role(&cluster.id, NodeRole::Replica).await.is_empty());
    assert!(h.router.readers(&cluster.id).await.is_empty());
    assert_eq!(cluster.status, ClusterStatus::Healthy);
}

#[tokio::test]
async fn test_new_replicas_continue_after_highest_ordinal() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 2).await;

    let task_id = h.orchestrator.scale_cluster(&cluster.id, scale_to(1)).await.unwrap();
    h.wait_for_task(&cluster.id, &task_id).await;
    let task_id = h.orchestrator.scale_cluster(&cluster.id, scale_to(2)).await.unwrap();
    h.wait_for_task(&cluster.id, &task_id).await;

    let ordinals: Vec<u32> = h
        .nodes_with_role(&cluster.id, NodeRole::Replica)
        .await
        .into_iter()
        .map(|n| n.ordinal)
        .collect();
    // the freed ordinal is handed out again; ordinal 1 is never disturbed
    assert_eq!(ordinals, vec![1, 2]);
}

#[tokio::test]
async fn test_second_structural_operation_is_rejected() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    h.runtime.never_ready_matching("replica-2").await;

    let first = h.orchestrator.scale_cluster(&cluster.id, scale_to(2)).await.unwrap();
    let err = h
        .orchestrator
        .scale_cluster(&cluster.id, scale_to(3))
        .await
        .unwrap_err();
    match err {
        OrchestrationError::OperationInProgress { task_id, task_type, .. } => {
            assert_eq!(task_id, first);
            assert_eq!(task_type, TaskType::Scale);
        }
        other => panic!("unexpected error: {}", other),
    }
    let err = h.orchestrator.delete_cluster(&cluster.id).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::OperationInProgress { .. }));

    h.wait_for_task(&cluster.id, &first).await;
}

#[tokio::test]
async fn test_partial_scale_up_records_reached_count() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    h.runtime.never_ready_matching("replica-2").await;

    let task_id = h.orchestrator.scale_cluster(&cluster.id, scale_to(2)).await.unwrap();
    let task = h.wait_for_task(&cluster.id, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.is_some());

    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.replica_count, 1);
    assert_eq!(cluster.replica_container_ids.len(), 1);
    assert!(cluster.error_message.is_some());
    assert_eq!(h.nodes_with_role(&cluster.id, NodeRole::Replica).await.len(), 1);
    assert_eq!(h.router.readers(&cluster.id).await.len(), 1);
}

#[tokio::test]
async fn test_store_failure_mid_scale_still_settles() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;

    let task_id = h.orchestrator.scale_cluster(&cluster.id, scale_to(2)).await.unwrap();
    // The claim already landed; the next cluster write records the first new replica.
    h.store.fail_cluster_update_after(0);
    let task = h.wait_for_task(&cluster.id, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);

    let replicas = h.nodes_with_role(&cluster.id, NodeRole::Replica).await;
    assert_eq!(replicas.len(), 2);
    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert!(!cluster.is_replica_container(&replicas[0].container_id));
    assert!(cluster.is_replica_container(&replicas[1].container_id));
    assert_eq!(cluster.replica_count, 1);
    assert!(cluster
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("injected"));
    assert_eq!(h.router.readers(&cluster.id).await.len(), 2);
}

#[tokio::test]
async fn test_racing_claims_admit_exactly_one() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    let ctx = h.orchestrator.context();

    h.store.interleave_task_reads(true);
    let (first, second) = tokio::join!(
        ctx.begin_structural(&cluster.id, TaskType::Scale, |_| Ok(())),
        ctx.begin_structural(&cluster.id, TaskType::Delete, |_| Ok(())),
    );
    h.store.interleave_task_reads(false);

    let (winner, loser) = match (first, second) {
        (Ok((_, task)), Err(err)) | (Err(err), Ok((_, task))) => (task, err),
        (first, second) => panic!(
            "expected exactly one claim, got {} and {}",
            first.is_ok(),
            second.is_ok()
        ),
    };
    match loser {
        OrchestrationError::OperationInProgress { task_id, .. } => assert_eq!(task_id, winner.id),
        other => panic!("unexpected error: {}", other),
    }

    let tasks = h.orchestrator.list_tasks(&cluster.id).await.unwrap();
    let claimed: Vec<_> = tasks.iter().filter(|t| t.task_type != TaskType::Provision).collect();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, winner.id);
    assert_eq!(claimed[0].status, TaskStatus::Running);
    assert!(tasks.iter().all(|t| t.status != TaskStatus::Failed));

    ctx.tracker.complete(&winner).await.unwrap();
}

#[tokio::test]
async fn test_scale_rejected_while_stopped() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 1).await;
    let task_id = h.orchestrator.stop_cluster(&cluster.id).await.unwrap();
    h.wait_for_task(&cluster.id, &task_id).await;

    let err = h
        .orchestrator
        .scale_cluster(&cluster.id, scale_to(2))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidState { .. }));
}

#[tokio::test]
async fn test_stop_then_start_returns_to_healthy() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 2).await;

    let task_id = h.orchestrator.stop_cluster(&cluster.id).await.unwrap();
    assert_eq!(h.wait_for_task(&cluster.id, &task_id).await.status, TaskStatus::Completed);
    let stopped = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(stopped.status, ClusterStatus::Stopped);
    assert!(h
        .nodes(&cluster.id)
        .await
        .iter()
        .all(|n| n.status == NodeStatus::Stopped));

    let err = h.orchestrator.stop_cluster(&cluster.id).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidState { .. }));

    let task_id = h.orchestrator.start_cluster(&cluster.id).await.unwrap();
    assert_eq!(h.wait_for_task(&cluster.id, &task_id).await.status, TaskStatus::Completed);
    let started = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(started.status, ClusterStatus::Healthy);
    assert!(h
        .nodes(&cluster.id)
        .await
        .iter()
        .all(|n| n.status == NodeStatus::Running));
}

#[tokio::test]
async fn test_start_requires_stopped_cluster() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    let err = h.orchestrator.start_cluster(&cluster.id).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidState { .. }));
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 2).await;

    let task_id = h.orchestrator.delete_cluster(&cluster.id).await.unwrap();
    let deleting = h.store.get_cluster(&cluster.id).await.unwrap();
    assert!(matches!(
        deleting.map(|c| c.status),
        Some(ClusterStatus::Deleting) | None
    ));
    h.wait_for_removal(&cluster.id).await;

    let err = h.orchestrator.get_cluster(&cluster.id).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::ClusterNotFound(_)));
    assert_eq!(h.runtime.container_count().await, 0);
    assert_eq!(h.runtime.network_count().await, 0);
    assert!(h.store.list_nodes_for_cluster(&cluster.id).await.unwrap().is_empty());
    assert!(h.store.list_tasks_for_cluster(&cluster.id).await.unwrap().is_empty());
    assert!(h.store.get_task(&cluster.id, &task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_with_leftovers_marks_cluster_failed() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 1).await;
    h.runtime.should_fail_remove.store(true, Ordering::SeqCst);

    let task_id = h.orchestrator.delete_cluster(&cluster.id).await.unwrap();
    let task = h.wait_for_task(&cluster.id, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);

    let cluster = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert!(cluster
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("leftover resources"));
    assert_eq!(h.runtime.container_names().await.len(), 3);

    // a retry once the runtime cooperates finishes the job
    h.runtime.should_fail_remove.store(false, Ordering::SeqCst);
    h.orchestrator.delete_cluster(&cluster.id).await.unwrap();
    h.wait_for_removal(&cluster.id).await;
    assert_eq!(h.runtime.container_count().await, 0);
    assert_eq!(h.runtime.network_count().await, 0);
}

#[tokio::test]
async fn test_health_refresh_tracks_crashes() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 2).await;
    let replicas = h.nodes_with_role(&cluster.id, NodeRole::Replica).await;

    h.runtime.crash_container(&replicas[1].container_id).await;
    let refreshed = h.orchestrator.refresh_health(&cluster.id).await.unwrap();
    assert_eq!(refreshed.status, ClusterStatus::Degraded);
    let crashed = h.node_by_host(&cluster.id, &replicas[1].hostname).await;
    assert_eq!(crashed.status, NodeStatus::Failed);

    let primary = cluster.primary_container_id.clone().unwrap();
    h.runtime.crash_container(&primary).await;
    let refreshed = h.orchestrator.refresh_health(&cluster.id).await.unwrap();
    assert_eq!(refreshed.status, ClusterStatus::Failed);
}

#[tokio::test]
async fn test_recovered_replica_rejoins_read_group() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 2).await;
    let lost = h.nodes_with_role(&cluster.id, NodeRole::Replica).await.remove(1);

    h.runtime.crash_container(&lost.container_id).await;
    let refreshed = h.orchestrator.refresh_health(&cluster.id).await.unwrap();
    assert_eq!(refreshed.status, ClusterStatus::Degraded);
    let endpoint = h.orchestrator.context().router_endpoint(&refreshed).unwrap();
    h.router.remove_server(&endpoint, &lost.hostname).await.unwrap();

    h.runtime.start_container(&lost.container_id).await.unwrap();
    h.router.fail_operation(OP_ADD_REPLICA).await;
    let refreshed = h.orchestrator.refresh_health(&cluster.id).await.unwrap();
    assert_eq!(refreshed.status, ClusterStatus::Degraded);
    assert_eq!(h.node_by_host(&cluster.id, &lost.hostname).await.status, NodeStatus::Failed);
    assert!(!h.router.readers(&cluster.id).await.contains(&lost.hostname));

    h.router.heal().await;
    let refreshed = h.orchestrator.refresh_health(&cluster.id).await.unwrap();
    assert_eq!(refreshed.status, ClusterStatus::Healthy);
    assert_eq!(h.node_by_host(&cluster.id, &lost.hostname).await.status, NodeStatus::Running);
    assert!(h.router.readers(&cluster.id).await.contains(&lost.hostname));
}

#[tokio::test]
async fn test_health_refresh_leaves_unchanged_cluster_alone() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 1).await;
    let refreshed = h.orchestrator.refresh_health(&cluster.id).await.unwrap();
    assert_eq!(refreshed.status, ClusterStatus::Healthy);
    assert_eq!(refreshed.version, cluster.version);

    h.orchestrator.refresh_all().await.unwrap();
    let after = h.orchestrator.get_cluster(&cluster.id).await.unwrap();
    assert_eq!(after.version, cluster.version);
}

#[tokio::test]
async fn test_node_logs_and_stats_require_known_node() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    let err = h
        .orchestrator
        .node_stats(&cluster.id, &uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::NodeNotFound(_)));

    let nodes = h.orchestrator.list_nodes(&cluster.id).await.unwrap();
    assert_eq!(nodes[0].role, NodeRole::Primary);
    h.orchestrator.node_stats(&cluster.id, &nodes[0].id).await.unwrap();
}
