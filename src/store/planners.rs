//! Planner rows and the router ↔ planner message link.

use crate::error::Result;
use crate::store::Store;
use crate::tables::TableMeta;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::collections::HashMap;

/// Planner lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStatus {
    Planning,
    Executing,
    Completed,
    Failed,
}

impl PlannerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlannerStatus::Planning => "planning",
            PlannerStatus::Executing => "executing",
            PlannerStatus::Completed => "completed",
            PlannerStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planning" => Some(PlannerStatus::Planning),
            "executing" => Some(PlannerStatus::Executing),
            "completed" => Some(PlannerStatus::Completed),
            "failed" => Some(PlannerStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PlannerStatus::Completed | PlannerStatus::Failed)
    }
}

impl std::fmt::Display for PlannerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The planner's resume pointer.
///
/// Either a real handler name from the registry, or one of two sentinels:
/// `waiting_for_worker` (no planner task in flight; the active worker's
/// terminal step re-enters the chain through synthesis) and `completed`.
/// The sentinels never reach the task queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NextHandler(String);

impl NextHandler {
    const WAITING_FOR_WORKER: &'static str = "waiting_for_worker";
    const COMPLETED: &'static str = "completed";

    /// A queueable handler name.
    pub fn handler(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn waiting_for_worker() -> Self {
        Self(Self::WAITING_FOR_WORKER.to_string())
    }

    pub fn completed() -> Self {
        Self(Self::COMPLETED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_waiting_for_worker(&self) -> bool {
        self.0 == Self::WAITING_FOR_WORKER
    }

    pub fn is_completed(&self) -> bool {
        self.0 == Self::COMPLETED
    }

    /// The handler name to enqueue, or None for the sentinels.
    pub fn queueable(&self) -> Option<&str> {
        if self.is_waiting_for_worker() || self.is_completed() {
            None
        } else {
            Some(&self.0)
        }
    }
}

impl std::fmt::Display for NextHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerRecord {
    pub planner_id: String,
    pub planner_name: Option<String>,
    pub user_question: String,
    pub instruction: String,
    pub execution_plan: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub failed_task_limit: u32,
    pub status: PlannerStatus,
    pub next_handler: Option<NextHandler>,
    pub user_response: Option<String>,
    pub variable_paths: HashMap<String, String>,
    pub image_paths: HashMap<String, String>,
    pub tables: Vec<TableMeta>,
    pub document_paths: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for a new planner row.
#[derive(Debug, Clone)]
pub struct CreatePlannerInput {
    pub planner_id: String,
    pub planner_name: Option<String>,
    pub user_question: String,
    pub instruction: String,
    pub model: String,
    pub temperature: f64,
    pub failed_task_limit: u32,
    pub status: PlannerStatus,
    pub next_handler: NextHandler,
}

/// Partial planner update. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlannerInput {
    pub status: Option<PlannerStatus>,
    pub next_handler: Option<NextHandler>,
    pub execution_plan: Option<String>,
    pub user_response: Option<String>,
}

impl Store {
    pub async fn create_planner(&self, input: CreatePlannerInput) -> Result<()> {
        sqlx::query(
            "INSERT INTO planners (planner_id, planner_name, user_question, instruction, model, \
             temperature, failed_task_limit, status, next_handler) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.planner_id)
        .bind(&input.planner_name)
        .bind(&input.user_question)
        .bind(&input.instruction)
        .bind(&input.model)
        .bind(input.temperature)
        .bind(input.failed_task_limit as i64)
        .bind(input.status.as_str())
        .bind(input.next_handler.as_str())
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to create planner {}", input.planner_id))?;

        Ok(())
    }

    pub async fn get_planner(&self, planner_id: &str) -> Result<Option<PlannerRecord>> {
        let row = sqlx::query(
            "SELECT planner_id, planner_name, user_question, instruction, execution_plan, model, \
             temperature, failed_task_limit, status, next_handler, user_response, variable_paths, \
             image_paths, tables, document_paths, created_at, updated_at \
             FROM planners WHERE planner_id = ?",
        )
        .bind(planner_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("failed to fetch planner {planner_id}"))?;

        row.map(planner_from_row).transpose()
    }

    pub async fn update_planner(&self, planner_id: &str, input: UpdatePlannerInput) -> Result<()> {
        let mut query = String::from("UPDATE planners SET updated_at = datetime('now')");

        if input.status.is_some() {
            query.push_str(", status = ?");
        }
        if input.next_handler.is_some() {
            query.push_str(", next_handler = ?");
        }
        if input.execution_plan.is_some() {
            query.push_str(", execution_plan = ?");
        }
        if input.user_response.is_some() {
            query.push_str(", user_response = ?");
        }
        query.push_str(" WHERE planner_id = ?");

        let mut sql = sqlx::query(&query);
        if let Some(status) = input.status {
            sql = sql.bind(status.as_str());
        }
        if let Some(ref next_handler) = input.next_handler {
            sql = sql.bind(next_handler.as_str().to_string());
        }
        if let Some(ref execution_plan) = input.execution_plan {
            sql = sql.bind(execution_plan.clone());
        }
        if let Some(ref user_response) = input.user_response {
            sql = sql.bind(user_response.clone());
        }

        sql.bind(planner_id)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to update planner {planner_id}"))?;

        Ok(())
    }

    /// Replace the planner's table metadata and document path context.
    pub async fn set_planner_context(
        &self,
        planner_id: &str,
        tables: &[TableMeta],
        document_paths: &[String],
    ) -> Result<()> {
        sqlx::query(
            "UPDATE planners SET tables = ?, document_paths = ?, updated_at = datetime('now') \
             WHERE planner_id = ?",
        )
        .bind(serde_json::to_string(tables).context("failed to serialise tables")?)
        .bind(serde_json::to_string(document_paths).context("failed to serialise document paths")?)
        .bind(planner_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to set context for planner {planner_id}"))?;

        Ok(())
    }

    /// Record a variable artefact path under the planner.
    pub async fn merge_planner_variable_path(
        &self,
        planner_id: &str,
        key: &str,
        path: &str,
    ) -> Result<()> {
        self.merge_planner_path(planner_id, "variable_paths", key, path)
            .await
    }

    /// Record an image artefact path under the planner.
    pub async fn merge_planner_image_path(
        &self,
        planner_id: &str,
        key: &str,
        path: &str,
    ) -> Result<()> {
        self.merge_planner_path(planner_id, "image_paths", key, path)
            .await
    }

    async fn merge_planner_path(
        &self,
        planner_id: &str,
        column: &'static str,
        key: &str,
        path: &str,
    ) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("failed to open path merge transaction")?;

        let query = format!("SELECT {column} FROM planners WHERE planner_id = ?");
        let current: String = sqlx::query_scalar(&query)
            .bind(planner_id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to read {column} for planner {planner_id}"))?;

        let mut paths: HashMap<String, String> =
            serde_json::from_str(&current).unwrap_or_default();
        paths.insert(key.to_string(), path.to_string());

        let update =
            format!("UPDATE planners SET {column} = ?, updated_at = datetime('now') WHERE planner_id = ?");
        sqlx::query(&update)
            .bind(serde_json::to_string(&paths).context("failed to serialise paths")?)
            .bind(planner_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write {column} for planner {planner_id}"))?;

        tx.commit()
            .await
            .context("failed to commit path merge transaction")?;

        Ok(())
    }

    /// Record which planner a given assistant message spawned.
    pub async fn link_message_planner(
        &self,
        router_id: &str,
        message_id: i64,
        planner_id: &str,
        relation: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_planner_links (router_id, message_id, planner_id, relation) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(router_id)
        .bind(message_id)
        .bind(planner_id)
        .bind(relation)
        .execute(self.pool())
        .await
        .context("failed to link message to planner")?;

        Ok(())
    }

    /// The planner backing a given assistant message, if any.
    pub async fn planner_for_message(&self, message_id: i64) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT planner_id FROM message_planner_links WHERE message_id = ? \
             ORDER BY link_id DESC LIMIT 1",
        )
        .bind(message_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to resolve planner for message")?;

        Ok(row.map(|row| row.get("planner_id")))
    }

    /// The router that owns a planner, via the message link.
    pub async fn router_for_planner(&self, planner_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT router_id FROM message_planner_links WHERE planner_id = ? \
             ORDER BY link_id ASC LIMIT 1",
        )
        .bind(planner_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to resolve router for planner")?;

        Ok(row.map(|row| row.get("router_id")))
    }

    /// Non-terminal planners, for the startup resume scan.
    pub async fn planners_needing_resume(&self) -> Result<Vec<PlannerRecord>> {
        let rows = sqlx::query(
            "SELECT planner_id, planner_name, user_question, instruction, execution_plan, model, \
             temperature, failed_task_limit, status, next_handler, user_response, variable_paths, \
             image_paths, tables, document_paths, created_at, updated_at \
             FROM planners WHERE status IN ('planning', 'executing') ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("failed to list resumable planners")?;

        rows.into_iter().map(planner_from_row).collect()
    }

    /// Terminal planners whose outcome has not yet been relayed to the
    /// owning router. Feeds the completion pump.
    pub async fn planners_awaiting_relay(&self) -> Result<Vec<PlannerRecord>> {
        let rows = sqlx::query(
            "SELECT planner_id, planner_name, user_question, instruction, execution_plan, model, \
             temperature, failed_task_limit, status, next_handler, user_response, variable_paths, \
             image_paths, tables, document_paths, created_at, updated_at \
             FROM planners WHERE status IN ('completed', 'failed') AND response_relayed = 0 \
             ORDER BY updated_at ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("failed to list planners awaiting relay")?;

        rows.into_iter().map(planner_from_row).collect()
    }

    pub async fn mark_planner_relayed(&self, planner_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE planners SET response_relayed = 1, updated_at = datetime('now') \
             WHERE planner_id = ?",
        )
        .bind(planner_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to mark planner {planner_id} as relayed"))?;

        Ok(())
    }
}

fn planner_from_row(row: sqlx::sqlite::SqliteRow) -> Result<PlannerRecord> {
    let status_value: String = row
        .try_get("status")
        .context("failed to read planner status")?;
    let status = PlannerStatus::parse(&status_value)
        .with_context(|| format!("invalid planner status in database: {status_value}"))?;

    let variable_paths: String = row
        .try_get("variable_paths")
        .unwrap_or_else(|_| "{}".to_string());
    let image_paths: String = row
        .try_get("image_paths")
        .unwrap_or_else(|_| "{}".to_string());
    let tables: String = row.try_get("tables").unwrap_or_else(|_| "[]".to_string());
    let document_paths: String = row
        .try_get("document_paths")
        .unwrap_or_else(|_| "[]".to_string());

    Ok(PlannerRecord {
        planner_id: row
            .try_get("planner_id")
            .context("failed to read planner_id")?,
        planner_name: row.try_get("planner_name").ok(),
        user_question: row
            .try_get("user_question")
            .context("failed to read user_question")?,
        instruction: row
            .try_get("instruction")
            .context("failed to read instruction")?,
        execution_plan: row.try_get("execution_plan").ok(),
        model: row.try_get("model").ok(),
        temperature: row.try_get("temperature").ok(),
        failed_task_limit: row
            .try_get::<i64, _>("failed_task_limit")
            .context("failed to read failed_task_limit")? as u32,
        status,
        next_handler: row
            .try_get::<Option<String>, _>("next_handler")
            .ok()
            .flatten()
            .map(|value| NextHandler(value)),
        user_response: row.try_get("user_response").ok(),
        variable_paths: serde_json::from_str(&variable_paths).unwrap_or_default(),
        image_paths: serde_json::from_str(&image_paths).unwrap_or_default(),
        tables: serde_json::from_str(&tables).unwrap_or_default(),
        document_paths: serde_json::from_str(&document_paths).unwrap_or_default(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read planner created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read planner updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input(planner_id: &str) -> CreatePlannerInput {
        CreatePlannerInput {
            planner_id: planner_id.to_string(),
            planner_name: Some("Muffin".to_string()),
            user_question: "What is total revenue?".to_string(),
            instruction: "Query via SQL.".to_string(),
            model: "gemini-2.5-pro".to_string(),
            temperature: 0.0,
            failed_task_limit: 3,
            status: PlannerStatus::Planning,
            next_handler: NextHandler::handler("execute_task_creation"),
        }
    }

    #[tokio::test]
    async fn planner_create_update_and_resume_scan() {
        let store = Store::connect_in_memory().await.expect("store");
        store.create_planner(sample_input("p1")).await.expect("create");

        store
            .update_planner(
                "p1",
                UpdatePlannerInput {
                    status: Some(PlannerStatus::Executing),
                    next_handler: Some(NextHandler::waiting_for_worker()),
                    execution_plan: Some("# Objective\nrevenue".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        let planner = store.get_planner("p1").await.expect("fetch").expect("exists");
        assert_eq!(planner.status, PlannerStatus::Executing);
        let next = planner.next_handler.expect("next handler set");
        assert!(next.is_waiting_for_worker());
        assert_eq!(next.queueable(), None);

        let resumable = store.planners_needing_resume().await.expect("scan");
        assert_eq!(resumable.len(), 1);

        store
            .update_planner(
                "p1",
                UpdatePlannerInput {
                    status: Some(PlannerStatus::Completed),
                    next_handler: Some(NextHandler::completed()),
                    user_response: Some("done".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("complete");

        assert!(store.planners_needing_resume().await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn path_merges_accumulate() {
        let store = Store::connect_in_memory().await.expect("store");
        store.create_planner(sample_input("p1")).await.expect("create");

        store
            .merge_planner_variable_path("p1", "revenue_total", "/tmp/p1/variables/revenue_total.blob")
            .await
            .expect("merge");
        store
            .merge_planner_variable_path("p1", "by_region", "/tmp/p1/variables/by_region.blob")
            .await
            .expect("merge");
        store
            .merge_planner_image_path("p1", "chart", "/tmp/p1/images/chart.b64")
            .await
            .expect("merge");

        let planner = store.get_planner("p1").await.expect("fetch").expect("exists");
        assert_eq!(planner.variable_paths.len(), 2);
        assert_eq!(
            planner.image_paths.get("chart").map(String::as_str),
            Some("/tmp/p1/images/chart.b64")
        );
    }

    #[tokio::test]
    async fn message_link_resolves_both_directions() {
        let store = Store::connect_in_memory().await.expect("store");
        store.create_planner(sample_input("p1")).await.expect("create");

        store
            .link_message_planner("r1", 42, "p1", "initiated")
            .await
            .expect("link");

        assert_eq!(
            store.planner_for_message(42).await.expect("resolve").as_deref(),
            Some("p1")
        );
        assert_eq!(
            store.router_for_planner("p1").await.expect("resolve").as_deref(),
            Some("r1")
        );
        assert!(store.planner_for_message(43).await.expect("resolve").is_none());
    }
}
