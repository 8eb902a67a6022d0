//! Durable FIFO task queue with compare-and-swap claims.

use crate::error::Result;
use crate::store::Store;
use crate::AgentType;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row as _;

/// Queue record status. Uppercase on the wire, matching the stored values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(TaskStatus::Pending),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One pending handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub entity_type: AgentType,
    pub entity_id: String,
    pub handler_name: String,
    pub status: TaskStatus,
    pub payload: Option<Value>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

impl Store {
    /// Insert a PENDING queue record.
    pub async fn enqueue_task(
        &self,
        task_id: &str,
        entity_type: AgentType,
        entity_id: &str,
        handler_name: &str,
        payload: Option<Value>,
    ) -> Result<()> {
        let payload_json = payload
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .context("failed to serialise task payload")?;

        sqlx::query(
            "INSERT INTO task_queue (task_id, entity_type, entity_id, handler_name, payload) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(handler_name)
        .bind(payload_json)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to enqueue task {task_id} ({handler_name})"))?;

        tracing::debug!(%task_id, %entity_id, handler = %handler_name, "task enqueued");
        Ok(())
    }

    /// All PENDING records, oldest first (rowid breaks same-second ties).
    pub async fn get_pending_tasks(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, entity_type, entity_id, handler_name, status, payload, created_at, \
             started_at, completed_at, error_message \
             FROM task_queue WHERE status = 'PENDING' ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("failed to fetch pending tasks")?;

        rows.into_iter().map(task_from_row).collect()
    }

    /// Atomic `PENDING → IN_PROGRESS`. Returns false when another claimer
    /// won or the record is already terminal.
    pub async fn claim_task(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE task_queue SET status = 'IN_PROGRESS', started_at = datetime('now') \
             WHERE task_id = ? AND status = 'PENDING'",
        )
        .bind(task_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to claim task {task_id}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal transition, stamping `completed_at`.
    pub async fn complete_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE task_queue SET status = ?, completed_at = datetime('now'), error_message = ? \
             WHERE task_id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(task_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to complete task {task_id}"))?;

        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT task_id, entity_type, entity_id, handler_name, status, payload, created_at, \
             started_at, completed_at, error_message FROM task_queue WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("failed to fetch task {task_id}"))?;

        row.map(task_from_row).transpose()
    }

    /// Every queue record for an entity, oldest first. Used by tests to
    /// assert the handler chain shape.
    pub async fn tasks_for_entity(&self, entity_id: &str) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, entity_type, entity_id, handler_name, status, payload, created_at, \
             started_at, completed_at, error_message \
             FROM task_queue WHERE entity_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(entity_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("failed to fetch tasks for entity {entity_id}"))?;

        rows.into_iter().map(task_from_row).collect()
    }

    /// Drop every queue record. Invoked at process start so tasks left
    /// IN_PROGRESS by a hard crash are never re-run blindly; resume goes
    /// through the planners' `next_handler` pointers instead.
    pub async fn clear_task_queue(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_queue")
            .execute(self.pool())
            .await
            .context("failed to clear task queue")?;

        Ok(result.rows_affected())
    }
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let entity_type_value: String = row
        .try_get("entity_type")
        .context("failed to read task entity_type")?;
    let status_value: String = row
        .try_get("status")
        .context("failed to read task status")?;

    let entity_type = AgentType::parse(&entity_type_value)
        .with_context(|| format!("invalid entity_type in database: {entity_type_value}"))?;
    let status = TaskStatus::parse(&status_value)
        .with_context(|| format!("invalid task status in database: {status_value}"))?;

    let payload = row
        .try_get::<Option<String>, _>("payload")
        .ok()
        .flatten()
        .and_then(|value| serde_json::from_str(&value).ok());

    Ok(TaskRecord {
        task_id: row.try_get("task_id").context("failed to read task_id")?,
        entity_type,
        entity_id: row
            .try_get("entity_id")
            .context("failed to read task entity_id")?,
        handler_name: row
            .try_get("handler_name")
            .context("failed to read handler_name")?,
        status,
        payload,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read task created_at")?,
        started_at: row
            .try_get::<Option<chrono::NaiveDateTime>, _>("started_at")
            .ok()
            .flatten()
            .map(crate::store::timestamp_to_rfc3339),
        completed_at: row
            .try_get::<Option<chrono::NaiveDateTime>, _>("completed_at")
            .ok()
            .flatten()
            .map(crate::store::timestamp_to_rfc3339),
        error_message: row.try_get("error_message").ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentType;

    #[tokio::test]
    async fn pending_tasks_come_back_in_fifo_order() {
        let store = Store::connect_in_memory().await.expect("store");

        for n in 0..3 {
            store
                .enqueue_task(
                    &format!("t{n}"),
                    AgentType::Planner,
                    "p1",
                    "execute_task_creation",
                    None,
                )
                .await
                .expect("enqueue");
        }

        let pending = store.get_pending_tasks().await.expect("pending");
        let ids: Vec<&str> = pending.iter().map(|task| task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2"]);
    }

    #[tokio::test]
    async fn claim_is_single_shot() {
        let store = Store::connect_in_memory().await.expect("store");
        store
            .enqueue_task("t1", AgentType::Worker, "w1", "execute_standard_worker", None)
            .await
            .expect("enqueue");

        assert!(store.claim_task("t1").await.expect("first claim"));
        assert!(!store.claim_task("t1").await.expect("second claim"));

        store
            .complete_task("t1", TaskStatus::Completed, None)
            .await
            .expect("complete");
        assert!(!store.claim_task("t1").await.expect("claim after terminal"));

        let task = store.get_task("t1").await.expect("fetch").expect("exists");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_completion_records_the_error() {
        let store = Store::connect_in_memory().await.expect("store");
        store
            .enqueue_task("t1", AgentType::Planner, "p1", "bogus_handler", None)
            .await
            .expect("enqueue");
        store.claim_task("t1").await.expect("claim");
        store
            .complete_task("t1", TaskStatus::Failed, Some("unknown handler: bogus_handler"))
            .await
            .expect("complete");

        let task = store.get_task("t1").await.expect("fetch").expect("exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("unknown handler: bogus_handler")
        );
    }

    #[tokio::test]
    async fn startup_wipe_empties_the_queue() {
        let store = Store::connect_in_memory().await.expect("store");
        for n in 0..4 {
            store
                .enqueue_task(&format!("t{n}"), AgentType::Planner, "p1", "execute_synthesis", None)
                .await
                .expect("enqueue");
        }
        store.claim_task("t0").await.expect("claim");

        let cleared = store.clear_task_queue().await.expect("clear");
        assert_eq!(cleared, 4);
        assert!(store.get_pending_tasks().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn payload_round_trips_as_json() {
        let store = Store::connect_in_memory().await.expect("store");
        let payload = serde_json::json!({"planner_id": "p1"});
        store
            .enqueue_task("t1", AgentType::Worker, "w1", "worker_initialisation", Some(payload.clone()))
            .await
            .expect("enqueue");

        let task = store.get_task("t1").await.expect("fetch").expect("exists");
        assert_eq!(task.payload, Some(payload));
        assert_eq!(task.entity_type, AgentType::Worker);
    }
}
