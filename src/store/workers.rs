//! Worker rows: one per planner task attempt chain.

use crate::error::Result;
use crate::store::Store;
use crate::tables::TableMeta;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::collections::HashMap;

/// Worker task status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTaskStatus {
    Pending,
    InProgress,
    Completed,
    FailedValidation,
    Recorded,
    Failed,
}

impl WorkerTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerTaskStatus::Pending => "pending",
            WorkerTaskStatus::InProgress => "in_progress",
            WorkerTaskStatus::Completed => "completed",
            WorkerTaskStatus::FailedValidation => "failed_validation",
            WorkerTaskStatus::Recorded => "recorded",
            WorkerTaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(WorkerTaskStatus::Pending),
            "in_progress" => Some(WorkerTaskStatus::InProgress),
            "completed" => Some(WorkerTaskStatus::Completed),
            "failed_validation" => Some(WorkerTaskStatus::FailedValidation),
            "recorded" => Some(WorkerTaskStatus::Recorded),
            "failed" => Some(WorkerTaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub planner_id: String,
    pub worker_name: Option<String>,
    pub task_status: WorkerTaskStatus,
    pub task_description: String,
    pub acceptance_criteria: Vec<String>,
    pub user_request: String,
    pub task_result: String,
    pub querying_structured_data: bool,
    pub image_keys: Vec<String>,
    pub variable_keys: Vec<String>,
    pub tools: Vec<String>,
    pub input_variable_paths: HashMap<String, String>,
    pub input_image_paths: HashMap<String, String>,
    pub output_variable_paths: HashMap<String, String>,
    pub output_image_paths: HashMap<String, String>,
    pub tables: Vec<TableMeta>,
    pub document_paths: Vec<String>,
    pub current_attempt: u32,
    pub max_retry: u32,
    /// Sticks once validation has failed, surviving the later `recorded`
    /// transition, so the planner's failed-task budget can be counted.
    pub validation_failed: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for a new worker row.
#[derive(Debug, Clone)]
pub struct CreateWorkerInput {
    pub worker_id: String,
    pub planner_id: String,
    pub worker_name: Option<String>,
    pub task_description: String,
    pub acceptance_criteria: Vec<String>,
    pub user_request: String,
    pub querying_structured_data: bool,
    pub image_keys: Vec<String>,
    pub variable_keys: Vec<String>,
    pub tools: Vec<String>,
    pub input_variable_paths: HashMap<String, String>,
    pub input_image_paths: HashMap<String, String>,
    pub tables: Vec<TableMeta>,
    pub document_paths: Vec<String>,
    pub max_retry: u32,
}

/// Partial worker update. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkerInput {
    pub task_status: Option<WorkerTaskStatus>,
    pub task_result: Option<String>,
    pub current_attempt: Option<u32>,
}

impl Store {
    pub async fn create_worker(&self, input: CreateWorkerInput) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (worker_id, planner_id, worker_name, task_status, \
             task_description, acceptance_criteria, user_request, querying_structured_data, \
             image_keys, variable_keys, tools, input_variable_paths, input_image_paths, \
             tables, document_paths, max_retry) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.worker_id)
        .bind(&input.planner_id)
        .bind(&input.worker_name)
        .bind(WorkerTaskStatus::Pending.as_str())
        .bind(&input.task_description)
        .bind(serde_json::to_string(&input.acceptance_criteria).context("failed to serialise criteria")?)
        .bind(&input.user_request)
        .bind(input.querying_structured_data)
        .bind(serde_json::to_string(&input.image_keys).context("failed to serialise image keys")?)
        .bind(serde_json::to_string(&input.variable_keys).context("failed to serialise variable keys")?)
        .bind(serde_json::to_string(&input.tools).context("failed to serialise tools")?)
        .bind(serde_json::to_string(&input.input_variable_paths).context("failed to serialise input variable paths")?)
        .bind(serde_json::to_string(&input.input_image_paths).context("failed to serialise input image paths")?)
        .bind(serde_json::to_string(&input.tables).context("failed to serialise tables")?)
        .bind(serde_json::to_string(&input.document_paths).context("failed to serialise document paths")?)
        .bind(input.max_retry as i64)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to create worker {}", input.worker_id))?;

        Ok(())
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let row = sqlx::query(&select_worker("WHERE worker_id = ?"))
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("failed to fetch worker {worker_id}"))?;

        row.map(worker_from_row).transpose()
    }

    pub async fn update_worker(&self, worker_id: &str, input: UpdateWorkerInput) -> Result<()> {
        let mut query = String::from("UPDATE workers SET updated_at = datetime('now')");

        if let Some(status) = input.task_status {
            query.push_str(", task_status = ?");
            // Remember failed validations across the recorded transition.
            if status == WorkerTaskStatus::FailedValidation {
                query.push_str(", validation_failed = 1");
            }
        }
        if input.task_result.is_some() {
            query.push_str(", task_result = ?");
        }
        if input.current_attempt.is_some() {
            query.push_str(", current_attempt = ?");
        }
        query.push_str(" WHERE worker_id = ?");

        let mut sql = sqlx::query(&query);
        if let Some(status) = input.task_status {
            sql = sql.bind(status.as_str());
        }
        if let Some(ref task_result) = input.task_result {
            sql = sql.bind(task_result.clone());
        }
        if let Some(current_attempt) = input.current_attempt {
            sql = sql.bind(current_attempt as i64);
        }

        sql.bind(worker_id)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to update worker {worker_id}"))?;

        Ok(())
    }

    /// Record an output variable artefact path on the worker.
    pub async fn merge_worker_output_variable_path(
        &self,
        worker_id: &str,
        key: &str,
        path: &str,
    ) -> Result<()> {
        self.merge_worker_path(worker_id, "output_variable_paths", key, path)
            .await
    }

    /// Record an output image artefact path on the worker.
    pub async fn merge_worker_output_image_path(
        &self,
        worker_id: &str,
        key: &str,
        path: &str,
    ) -> Result<()> {
        self.merge_worker_path(worker_id, "output_image_paths", key, path)
            .await
    }

    async fn merge_worker_path(
        &self,
        worker_id: &str,
        column: &'static str,
        key: &str,
        path: &str,
    ) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("failed to open worker path merge transaction")?;

        let query = format!("SELECT {column} FROM workers WHERE worker_id = ?");
        let current: String = sqlx::query_scalar(&query)
            .bind(worker_id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to read {column} for worker {worker_id}"))?;

        let mut paths: HashMap<String, String> =
            serde_json::from_str(&current).unwrap_or_default();
        paths.insert(key.to_string(), path.to_string());

        let update =
            format!("UPDATE workers SET {column} = ?, updated_at = datetime('now') WHERE worker_id = ?");
        sqlx::query(&update)
            .bind(serde_json::to_string(&paths).context("failed to serialise paths")?)
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write {column} for worker {worker_id}"))?;

        tx.commit()
            .await
            .context("failed to commit worker path merge transaction")?;

        Ok(())
    }

    /// All workers belonging to a planner, oldest first.
    pub async fn workers_for_planner(&self, planner_id: &str) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query(&select_worker(
            "WHERE planner_id = ? ORDER BY created_at ASC, worker_id ASC",
        ))
        .bind(planner_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("failed to list workers for planner {planner_id}"))?;

        rows.into_iter().map(worker_from_row).collect()
    }

    /// How many of the planner's workers have ever failed validation.
    pub async fn count_failed_tasks(&self, planner_id: &str) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workers WHERE planner_id = ? AND validation_failed = 1",
        )
        .bind(planner_id)
        .fetch_one(self.pool())
        .await
        .with_context(|| format!("failed to count failed tasks for planner {planner_id}"))?;

        Ok(count as u32)
    }
}

fn select_worker(suffix: &str) -> String {
    format!(
        "SELECT worker_id, planner_id, worker_name, task_status, task_description, \
         acceptance_criteria, user_request, task_result, querying_structured_data, image_keys, \
         variable_keys, tools, input_variable_paths, input_image_paths, output_variable_paths, \
         output_image_paths, tables, document_paths, current_attempt, max_retry, \
         validation_failed, created_at, updated_at FROM workers {suffix}"
    )
}

fn worker_from_row(row: sqlx::sqlite::SqliteRow) -> Result<WorkerRecord> {
    let status_value: String = row
        .try_get("task_status")
        .context("failed to read worker task_status")?;
    let task_status = WorkerTaskStatus::parse(&status_value)
        .with_context(|| format!("invalid worker status in database: {status_value}"))?;

    fn json_column<T: serde::de::DeserializeOwned + Default>(
        row: &sqlx::sqlite::SqliteRow,
        column: &str,
    ) -> T {
        row.try_get::<String, _>(column)
            .ok()
            .and_then(|value| serde_json::from_str(&value).ok())
            .unwrap_or_default()
    }

    Ok(WorkerRecord {
        worker_id: row
            .try_get("worker_id")
            .context("failed to read worker_id")?,
        planner_id: row
            .try_get("planner_id")
            .context("failed to read worker planner_id")?,
        worker_name: row.try_get("worker_name").ok(),
        task_status,
        task_description: row
            .try_get("task_description")
            .context("failed to read task_description")?,
        acceptance_criteria: json_column(&row, "acceptance_criteria"),
        user_request: row
            .try_get("user_request")
            .context("failed to read user_request")?,
        task_result: row
            .try_get("task_result")
            .context("failed to read task_result")?,
        querying_structured_data: row
            .try_get::<bool, _>("querying_structured_data")
            .context("failed to read querying_structured_data")?,
        image_keys: json_column(&row, "image_keys"),
        variable_keys: json_column(&row, "variable_keys"),
        tools: json_column(&row, "tools"),
        input_variable_paths: json_column(&row, "input_variable_paths"),
        input_image_paths: json_column(&row, "input_image_paths"),
        output_variable_paths: json_column(&row, "output_variable_paths"),
        output_image_paths: json_column(&row, "output_image_paths"),
        tables: json_column(&row, "tables"),
        document_paths: json_column(&row, "document_paths"),
        current_attempt: row
            .try_get::<i64, _>("current_attempt")
            .context("failed to read current_attempt")? as u32,
        max_retry: row
            .try_get::<i64, _>("max_retry")
            .context("failed to read max_retry")? as u32,
        validation_failed: row
            .try_get::<bool, _>("validation_failed")
            .context("failed to read validation_failed")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read worker created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read worker updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input(worker_id: &str, planner_id: &str) -> CreateWorkerInput {
        CreateWorkerInput {
            worker_id: worker_id.to_string(),
            planner_id: planner_id.to_string(),
            worker_name: Some("Rusty".to_string()),
            task_description: "Sum the revenue column".to_string(),
            acceptance_criteria: vec!["A single number is produced".to_string()],
            user_request: "What is total revenue?".to_string(),
            querying_structured_data: true,
            image_keys: vec![],
            variable_keys: vec![],
            tools: vec![],
            input_variable_paths: HashMap::new(),
            input_image_paths: HashMap::new(),
            tables: vec![],
            document_paths: vec![],
            max_retry: 5,
        }
    }

    #[tokio::test]
    async fn worker_round_trips_with_json_columns() {
        let store = Store::connect_in_memory().await.expect("store");
        store
            .create_worker(sample_input("w1", "p1"))
            .await
            .expect("create");

        let worker = store.get_worker("w1").await.expect("fetch").expect("exists");
        assert_eq!(worker.task_status, WorkerTaskStatus::Pending);
        assert_eq!(worker.current_attempt, 0);
        assert_eq!(worker.acceptance_criteria.len(), 1);
        assert!(worker.querying_structured_data);

        store
            .merge_worker_output_variable_path("w1", "revenue_total", "/tmp/p1/variables/revenue_total.blob")
            .await
            .expect("merge");
        let worker = store.get_worker("w1").await.expect("fetch").expect("exists");
        assert_eq!(worker.output_variable_paths.len(), 1);
    }

    #[tokio::test]
    async fn validation_failure_flag_survives_recorded_transition() {
        let store = Store::connect_in_memory().await.expect("store");
        store
            .create_worker(sample_input("w1", "p1"))
            .await
            .expect("create");
        store
            .create_worker(sample_input("w2", "p1"))
            .await
            .expect("create");

        store
            .update_worker(
                "w1",
                UpdateWorkerInput {
                    task_status: Some(WorkerTaskStatus::FailedValidation),
                    task_result: Some("Task failed after multiple tries.".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("fail");
        store
            .update_worker(
                "w1",
                UpdateWorkerInput {
                    task_status: Some(WorkerTaskStatus::Recorded),
                    ..Default::default()
                },
            )
            .await
            .expect("record");

        assert_eq!(store.count_failed_tasks("p1").await.expect("count"), 1);

        let workers = store.workers_for_planner("p1").await.expect("list");
        assert_eq!(workers.len(), 2);
        assert!(workers[0].validation_failed);
        assert!(!workers[1].validation_failed);
    }
}
