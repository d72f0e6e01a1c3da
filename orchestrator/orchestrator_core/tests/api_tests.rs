//! REST API driven through the router without a listening socket.

#![cfg(feature = "rest-api")]

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{harness, Harness};
use orchestrator_core::api::{build_router, ApiState};
use orchestrator_core::ScaleRequest;

fn app(h: &Harness) -> Router {
    build_router(ApiState::new(h.orchestrator.clone()))
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness().await;
    let (status, body) = send(app(&h), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], true);
}

#[tokio::test]
async fn test_create_cluster_is_accepted() {
    let h = harness().await;
    let (status, body) = send(
        app(&h),
        "POST",
        "/api/v1/clusters",
        Some(json!({ "name": "orders", "owner": "team-a", "replica_count": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cluster"]["status"], "PROVISIONING");
    assert!(body["cluster"].get("credentials").is_none());
    assert!(body["task_id"].is_string());

    let cluster_id: uuid::Uuid = serde_json::from_value(body["cluster"]["id"].clone()).unwrap();
    let task_id: uuid::Uuid = serde_json::from_value(body["task_id"].clone()).unwrap();
    h.wait_for_task(&cluster_id, &task_id).await;

    let (status, body) = send(app(&h), "GET", &format!("/api/v1/clusters/{}", cluster_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "HEALTHY");

    let (status, body) = send(app(&h), "GET", "/api/v1/clusters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, body) = send(
        app(&h),
        "GET",
        &format!("/api/v1/clusters/{}/nodes", cluster_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // primary, replica, router
    assert_eq!(body["count"], 3);
    assert_eq!(body["items"][0]["role"], "PRIMARY");

    let (status, body) = send(
        app(&h),
        "GET",
        &format!("/api/v1/clusters/{}/tasks/{}", cluster_id, task_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
}

#[tokio::test]
async fn test_oversized_replica_count_is_bad_request() {
    let h = harness().await;
    let (status, body) = send(
        app(&h),
        "POST",
        "/api/v1/clusters",
        Some(json!({ "name": "orders", "replica_count": 99 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_unknown_cluster_is_not_found() {
    let h = harness().await;
    let id = uuid::Uuid::new_v4();
    let (status, body) = send(app(&h), "GET", &format!("/api/v1/clusters/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(app(&h), "DELETE", &format!("/api/v1/clusters/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_conflicting_operation_is_409() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    h.runtime.never_ready_matching("replica-1").await;

    let uri = format!("/api/v1/clusters/{}/scale", cluster.id);
    let (status, first) = send(app(&h), "POST", &uri, Some(json!({ "replica_count": 1 }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(app(&h), "POST", &uri, Some(json!({ "replica_count": 2 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["details"]["task_id"], first["task_id"]);

    let task_id: uuid::Uuid = serde_json::from_value(first["task_id"].clone()).unwrap();
    h.wait_for_task(&cluster.id, &task_id).await;
}

#[tokio::test]
async fn test_failover_webhook() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 1).await;
    let nodes = h.orchestrator.list_nodes(&cluster.id).await.unwrap();
    let alias = h.orchestrator.context().alias(&cluster.id);

    let uri = "/api/v1/webhooks/orchestrator/failover";
    let (status, _) = send(
        app(&h),
        "POST",
        uri,
        Some(json!({ "clusterAlias": "nobody", "failedHost": "a", "successorHost": "b" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        app(&h),
        "POST",
        uri,
        Some(json!({ "clusterAlias": alias, "failedHost": "a", "successorHost": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        app(&h),
        "POST",
        uri,
        Some(json!({
            "clusterAlias": alias,
            "failedHost": nodes[0].hostname,
            "successorHost": nodes[1].hostname,
            "failureType": "DeadMaster",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "reconciled");
}

#[tokio::test]
async fn test_failover_webhook_during_scale_asks_for_redelivery() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 1).await;
    let nodes = h.orchestrator.list_nodes(&cluster.id).await.unwrap();
    let alias = h.orchestrator.context().alias(&cluster.id);

    h.runtime.never_ready_matching("replica-2").await;
    let scale_task = h
        .orchestrator
        .scale_cluster(
            &cluster.id,
            ScaleRequest {
                replica_count: 2,
                resources: None,
            },
        )
        .await
        .unwrap();

    let (status, body) = send(
        app(&h),
        "POST",
        "/api/v1/webhooks/orchestrator/failover",
        Some(json!({
            "clusterAlias": alias,
            "failedHost": nodes[0].hostname,
            "successorHost": nodes[1].hostname,
            "failureType": "DeadMaster",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(body["details"]["task_id"], json!(scale_task));

    h.wait_for_task(&cluster.id, &scale_task).await;
}

#[tokio::test]
async fn test_node_logs_endpoint() {
    let h = harness().await;
    let cluster = h.provisioned("orders", 0).await;
    let nodes = h.orchestrator.list_nodes(&cluster.id).await.unwrap();

    let (status, body) = send(
        app(&h),
        "GET",
        &format!("/api/v1/clusters/{}/nodes/{}/logs?lines=10", cluster.id, nodes[0].id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_id"], json!(nodes[0].id));

    let (status, _) = send(
        app(&h),
        "GET",
        &format!("/api/v1/clusters/{}/nodes/{}/stats", cluster.id, uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
