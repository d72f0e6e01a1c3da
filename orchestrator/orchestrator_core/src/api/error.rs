//! API error types and responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use orchestrator_shared_types::OrchestrationError;

/// API error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Optional details about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Common error constructors
    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::new(format!("{} not found: {}", resource, id), "NOT_FOUND")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(message, "INTERNAL_ERROR")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(message, "CONFLICT")
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(message, "VALIDATION_ERROR")
    }

    /// Keeps message and details but answers 503, for callers that only
    /// retry server errors.
    pub fn retry_later(mut self) -> Self {
        self.code = "SERVICE_UNAVAILABLE".to_string();
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.code.as_str() {
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "CONFLICT" => StatusCode::CONFLICT,
            "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        let retryable = err.is_retryable();
        let api = match &err {
            OrchestrationError::ClusterNotFound(id) => ApiError::not_found("Cluster", id),
            OrchestrationError::NodeNotFound(id) => ApiError::not_found("Node", id),
            OrchestrationError::TaskNotFound(id) => ApiError::not_found("Task", &id.to_string()),
            OrchestrationError::InvalidState { status, .. } => {
                ApiError::conflict(err.to_string()).with_details(serde_json::json!({ "status": status }))
            }
            OrchestrationError::OperationInProgress { task_id, task_type, .. } => ApiError::conflict(err.to_string())
                .with_details(serde_json::json!({ "task_id": task_id, "task_type": task_type })),
            OrchestrationError::ConcurrentModification { .. } => ApiError::conflict(err.to_string()),
            OrchestrationError::Validation(msg) => ApiError::validation_error(msg.clone()),
            _ => ApiError::internal_error(err.to_string()),
        };
        if retryable && api.details.is_none() {
            api.with_details(serde_json::json!({ "retryable": true }))
        } else {
            api
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_shared_types::{ClusterStatus, TaskType};
    use uuid::Uuid;

    #[test]
    fn test_api_error_creation() {
        let error = ApiError::not_found("Cluster", "123");
        assert!(error.error.contains("Cluster"));
        assert!(error.error.contains("123"));
        assert_eq!(error.code, "NOT_FOUND");
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::not_found("Node", "n1"), StatusCode::NOT_FOUND),
            (ApiError::conflict("busy"), StatusCode::CONFLICT),
            (ApiError::validation_error("replica_count"), StatusCode::BAD_REQUEST),
            (ApiError::conflict("busy").retry_later(), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::internal_error("docker"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_orchestration_error_conversion() {
        let cases = [
            (OrchestrationError::ClusterNotFound("x".into()), "NOT_FOUND"),
            (OrchestrationError::TaskNotFound(Uuid::new_v4()), "NOT_FOUND"),
            (
                OrchestrationError::InvalidState {
                    cluster_id: Uuid::new_v4(),
                    status: ClusterStatus::Deleting,
                    operation: "scale".into(),
                },
                "CONFLICT",
            ),
            (
                OrchestrationError::OperationInProgress {
                    cluster_id: Uuid::new_v4(),
                    task_id: Uuid::new_v4(),
                    task_type: TaskType::Scale,
                },
                "CONFLICT",
            ),
            (
                OrchestrationError::ConcurrentModification {
                    cluster_id: Uuid::new_v4(),
                    expected: 3,
                    found: 4,
                },
                "CONFLICT",
            ),
            (OrchestrationError::Validation("bad".into()), "VALIDATION_ERROR"),
            (OrchestrationError::RuntimeError("boom".into()), "INTERNAL_ERROR"),
        ];
        for (err, code) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.code, code, "{}", api.error);
        }
    }

    #[test]
    fn test_retryable_errors_are_flagged() {
        let api: ApiError = OrchestrationError::ConcurrentModification {
            cluster_id: Uuid::new_v4(),
            expected: 1,
            found: 2,
        }
        .into();
        assert_eq!(api.details, Some(serde_json::json!({ "retryable": true })));
    }
}
