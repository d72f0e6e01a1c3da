//! Cluster event hub.
//!
//! Every event is published on a per-cluster topic (`cluster/<id>`). The hub
//! only emits; delivery to dashboards or chat channels is left to whoever
//! subscribes.
//!
//! ```text
//! {
//!   "type": "failover",
//!   "topic": "cluster/6f1c...",
//!   "timestamp": "2024-01-15T10:30:00Z",
//!   "data": { "cluster_id": "...", "old_primary": "...", "new_primary": "..." }
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use orchestrator_shared_types::{ClusterId, ClusterStatus, TaskId, TaskType};

/// Topic name for a cluster.
pub fn cluster_topic(cluster_id: &ClusterId) -> String {
    format!("cluster/{}", cluster_id)
}

/// Event types for streaming.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Failover,
    Alert,
    ClusterStatusChanged,
    TaskFinished,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Unique event ID.
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub topic: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Event payload (varies by event type).
    pub data: serde_json::Value,
    /// Optional correlation ID for tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl StreamEvent {
    /// Create a new event.
    pub fn new(event_type: EventType, cluster_id: &ClusterId, data: impl Serialize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            topic: cluster_topic(cluster_id),
            timestamp: Utc::now(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            correlation_id: None,
        }
    }

    /// Create an event with correlation ID.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn failover(data: FailoverEventData) -> Self {
        let cluster_id = data.cluster_id;
        Self::new(EventType::Failover, &cluster_id, data)
    }

    pub fn alert(cluster_id: &ClusterId, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self::new(
            EventType::Alert,
            cluster_id,
            AlertEventData {
                cluster_id: *cluster_id,
                severity,
                message: message.into(),
            },
        )
    }

    pub fn status_changed(cluster_id: &ClusterId, from: ClusterStatus, to: ClusterStatus) -> Self {
        Self::new(
            EventType::ClusterStatusChanged,
            cluster_id,
            serde_json::json!({ "cluster_id": cluster_id, "from": from, "to": to }),
        )
    }

    pub fn task_finished(
        cluster_id: &ClusterId,
        task_id: &TaskId,
        task_type: TaskType,
        succeeded: bool,
    ) -> Self {
        Self::new(
            EventType::TaskFinished,
            cluster_id,
            serde_json::json!({
                "cluster_id": cluster_id,
                "task_id": task_id,
                "task_type": task_type,
                "succeeded": succeeded
            }),
        )
        .with_correlation(task_id.to_string())
    }
}

/// Payload of a `failover` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverEventData {
    pub cluster_id: ClusterId,
    pub cluster_name: String,
    pub old_primary: String,
    pub new_primary: String,
    pub failure_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEventData {
    pub cluster_id: ClusterId,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Where the engine sends notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: StreamEvent);
}

/// Metrics for the event hub.
#[derive(Debug, Default, Clone)]
pub struct EventHubMetrics {
    pub total_events_broadcast: u64,
    pub events_by_type: HashMap<String, u64>,
}

/// Event hub for broadcasting cluster events.
#[derive(Clone)]
pub struct EventHub {
    /// Broadcast channel for events.
    sender: broadcast::Sender<StreamEvent>,
    /// Most recent events, oldest first
    history: Arc<RwLock<VecDeque<StreamEvent>>>,
    history_limit: usize,
    metrics: Arc<RwLock<EventHubMetrics>>,
}

impl EventHub {
    /// Create a new event hub.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Arc::new(RwLock::new(VecDeque::new())),
            history_limit: capacity.max(1),
            metrics: Arc::new(RwLock::new(EventHubMetrics::default())),
        }
    }

    /// Subscribe to every topic.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to one cluster's topic.
    pub fn subscribe_cluster(&self, cluster_id: &ClusterId) -> TopicSubscription {
        TopicSubscription {
            topic: cluster_topic(cluster_id),
            receiver: self.sender.subscribe(),
        }
    }

    /// Broadcast an event to all subscribers.
    pub async fn broadcast(&self, event: StreamEvent) {
        {
            let mut metrics = self.metrics.write().await;
            metrics.total_events_broadcast += 1;
            let type_str = format!("{:?}", event.event_type);
            *metrics.events_by_type.entry(type_str).or_insert(0) += 1;
        }
        {
            let mut history = self.history.write().await;
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Retained events for a cluster, oldest first.
    pub async fn recent_for_cluster(&self, cluster_id: &ClusterId) -> Vec<StreamEvent> {
        let topic = cluster_topic(cluster_id);
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Get current metrics.
    pub async fn get_metrics(&self) -> EventHubMetrics {
        self.metrics.read().await.clone()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl NotificationSink for EventHub {
    async fn publish(&self, event: StreamEvent) {
        self.broadcast(event).await;
    }
}

/// Receiver filtered to one topic.
pub struct TopicSubscription {
    topic: String,
    receiver: broadcast::Receiver<StreamEvent>,
}

impl TopicSubscription {
    /// Next event on this topic; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.topic == self.topic => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
