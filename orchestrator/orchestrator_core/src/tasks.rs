//! Task tracker: long-running cluster operations as inspectable records.
//!
//! A task is created `PENDING`, marked `RUNNING` when its workflow starts,
//! accumulates an append-only log and is finalized exactly once. Terminal
//! tasks are never written again; `complete` and `fail` on a terminal task
//! are no-ops so failure handlers can always call them.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use orchestrator_shared_types::{
    ClusterId, OrchestrationError, Result, Task, TaskId, TaskStatus, TaskType,
};
use state_store_interface::StateStore;

#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<dyn StateStore>,
    // Serializes read-modify-write of task records; replica steps log concurrently.
    write_lock: Arc<Mutex<()>>,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Persists a new `PENDING` task.
    pub async fn create(&self, cluster_id: ClusterId, task_type: TaskType) -> Result<Task> {
        let task = Task::new(cluster_id, task_type);
        self.store.put_task(task.clone()).await?;
        Ok(task)
    }

    /// `PENDING` to `RUNNING`.
    pub async fn mark_running(&self, task: &Task) -> Result<Task> {
        self.modify(task, |t| {
            if t.status == TaskStatus::Pending {
                t.status = TaskStatus::Running;
                t.started_at = Some(Utc::now());
            }
        })
        .await
    }

    /// Creates the task and immediately marks it `RUNNING`.
    pub async fn start(&self, cluster_id: ClusterId, task_type: TaskType) -> Result<Task> {
        let task = self.create(cluster_id, task_type).await?;
        self.mark_running(&task).await
    }

    pub async fn append_log(&self, task: &Task, line: impl AsRef<str>) -> Result<()> {
        let line = line.as_ref();
        info!(cluster_id = %task.cluster_id, task_id = %task.id, task_type = %task.task_type, "{}", line);
        self.modify(task, |t| {
            t.log.push_str(&format!("[{}] {}\n", Utc::now().to_rfc3339(), line));
        })
        .await
        .map(|_| ())
    }

    pub async fn complete(&self, task: &Task) -> Result<Task> {
        self.finish(task, TaskStatus::Completed, None).await
    }

    pub async fn fail(&self, task: &Task, reason: impl Into<String>) -> Result<Task> {
        self.finish(task, TaskStatus::Failed, Some(reason.into())).await
    }

    pub async fn get(&self, cluster_id: &ClusterId, task_id: &TaskId) -> Result<Task> {
        self.store
            .get_task(cluster_id, task_id)
            .await?
            .ok_or(OrchestrationError::TaskNotFound(*task_id))
    }

    /// The structural task currently in flight for a cluster, if any.
    pub async fn active_structural(&self, cluster_id: &ClusterId) -> Result<Option<Task>> {
        Ok(self
            .store
            .list_tasks_for_cluster(cluster_id)
            .await?
            .into_iter()
            .find(Task::is_active_structural))
    }

    async fn finish(&self, task: &Task, status: TaskStatus, error: Option<String>) -> Result<Task> {
        let reason = error.clone();
        let finished = self
            .modify(task, move |t| {
                t.status = status;
                t.error = error;
                t.completed_at = Some(Utc::now());
            })
            .await?;
        if let Some(reason) = reason.filter(|_| finished.status == TaskStatus::Failed) {
            warn!(cluster_id = %task.cluster_id, task_id = %task.id, error = %reason, "task failed");
        }
        Ok(finished)
    }

    /// Applies `change` to the stored task unless it is already terminal.
    async fn modify<F>(&self, task: &Task, change: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let _guard = self.write_lock.lock().await;
        let mut current = self.get(&task.cluster_id, &task.id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        change(&mut current);
        self.store.put_task(current.clone()).await?;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use state_store_interface::in_memory::InMemoryStateStore;
    use uuid::Uuid;

    fn tracker() -> TaskTracker {
        TaskTracker::new(Arc::new(InMemoryStateStore::new()))
    }

    #[tokio::test]
    async fn test_start_marks_running() {
        let tracker = tracker();
        let task = tracker.start(Uuid::new_v4(), TaskType::Provision).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn test_log_is_append_only() {
        let tracker = tracker();
        let task = tracker.start(Uuid::new_v4(), TaskType::Scale).await.unwrap();
        tracker.append_log(&task, "first").await.unwrap();
        tracker.append_log(&task, "second").await.unwrap();

        let stored = tracker.get(&task.cluster_id, &task.id).await.unwrap();
        let lines: Vec<&str> = stored.log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        let tracker = tracker();
        let task = tracker.start(Uuid::new_v4(), TaskType::Failover).await.unwrap();
        let done = tracker.complete(&task).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        // Later calls neither error nor mutate
        let after_fail = tracker.fail(&task, "too late").await.unwrap();
        assert_eq!(after_fail.status, TaskStatus::Completed);
        assert!(after_fail.error.is_none());
        tracker.append_log(&task, "ignored").await.unwrap();

        let stored = tracker.get(&task.cluster_id, &task.id).await.unwrap();
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn test_fail_records_reason() {
        let tracker = tracker();
        let task = tracker.start(Uuid::new_v4(), TaskType::Delete).await.unwrap();
        let failed = tracker.fail(&task, "container stuck").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("container stuck"));
        assert!(failed.completed_at.is_some());
        assert_eq!(tracker.fail(&task, "again").await.unwrap().error.as_deref(), Some("container stuck"));
    }

    #[tokio::test]
    async fn test_active_structural() {
        let tracker = tracker();
        let cluster_id = Uuid::new_v4();
        assert!(tracker.active_structural(&cluster_id).await.unwrap().is_none());

        let backup = tracker.start(cluster_id, TaskType::Backup).await.unwrap();
        assert!(tracker.active_structural(&cluster_id).await.unwrap().is_none());
        tracker.complete(&backup).await.unwrap();

        let scale = tracker.create(cluster_id, TaskType::Scale).await.unwrap();
        let active = tracker.active_structural(&cluster_id).await.unwrap().unwrap();
        assert_eq!(active.id, scale.id);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let tracker = tracker();
        let err = tracker.get(&Uuid::new_v4(), &Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::TaskNotFound(_)));
    }
}
