//! Durable state: agents, messages, task queue, usage ledger (SQLite).

pub mod messages;
pub mod planners;
pub mod queue;
pub mod routers;
pub mod usage;
pub mod workers;

pub use messages::{Content, MessageRecord, Part, Role};
pub use planners::{CreatePlannerInput, NextHandler, PlannerRecord, PlannerStatus, UpdatePlannerInput};
pub use queue::{TaskRecord, TaskStatus};
pub use routers::{RouterRecord, RouterStatus};
pub use usage::{UsageBucket, UsageSummary};
pub use workers::{CreateWorkerInput, UpdateWorkerInput, WorkerRecord, WorkerTaskStatus};

use crate::error::{Result, StoreError};
use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

/// Persistent, process-crash-safe storage backing all entities.
///
/// Cheap to clone; all clones share one pool. Writes are serialised by
/// SQLite itself, and message ordering comes from the autoincrement id,
/// so concurrent handlers never interleave within one agent's log.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at the given sqlx URL and run schema
    /// initialisation.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(StoreError::SqliteConnect)?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every caller
    /// on the same database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::SqliteConnect)?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and indices if they don't exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routers (
                router_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                model TEXT,
                temperature REAL,
                title TEXT NOT NULL DEFAULT 'New conversation',
                preview TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create routers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS planners (
                planner_id TEXT PRIMARY KEY,
                planner_name TEXT,
                user_question TEXT NOT NULL,
                instruction TEXT NOT NULL DEFAULT '',
                execution_plan TEXT,
                model TEXT,
                temperature REAL,
                failed_task_limit INTEGER NOT NULL,
                status TEXT NOT NULL,
                next_handler TEXT,
                user_response TEXT,
                variable_paths TEXT NOT NULL DEFAULT '{}',
                image_paths TEXT NOT NULL DEFAULT '{}',
                tables TEXT NOT NULL DEFAULT '[]',
                document_paths TEXT NOT NULL DEFAULT '[]',
                response_relayed INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create planners table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                planner_id TEXT NOT NULL,
                worker_name TEXT,
                task_status TEXT NOT NULL,
                task_description TEXT NOT NULL DEFAULT '',
                acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                user_request TEXT NOT NULL DEFAULT '',
                task_result TEXT NOT NULL DEFAULT '',
                querying_structured_data INTEGER NOT NULL DEFAULT 0,
                image_keys TEXT NOT NULL DEFAULT '[]',
                variable_keys TEXT NOT NULL DEFAULT '[]',
                tools TEXT NOT NULL DEFAULT '[]',
                input_variable_paths TEXT NOT NULL DEFAULT '{}',
                input_image_paths TEXT NOT NULL DEFAULT '{}',
                output_variable_paths TEXT NOT NULL DEFAULT '{}',
                output_image_paths TEXT NOT NULL DEFAULT '{}',
                tables TEXT NOT NULL DEFAULT '[]',
                document_paths TEXT NOT NULL DEFAULT '[]',
                current_attempt INTEGER NOT NULL DEFAULT 0,
                max_retry INTEGER NOT NULL,
                validation_failed INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create workers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_type TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create messages table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_planner_links (
                link_id INTEGER PRIMARY KEY AUTOINCREMENT,
                router_id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                planner_id TEXT NOT NULL,
                relation TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create message_planner_links table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_queue (
                task_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                handler_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                payload TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                started_at TIMESTAMP,
                completed_at TIMESTAMP,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create task_queue table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                caller TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create llm_usage table")?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_messages_agent ON messages(agent_type, agent_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_message ON message_planner_links(message_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_planner ON message_planner_links(planner_id)",
            "CREATE INDEX IF NOT EXISTS idx_queue_status ON task_queue(status)",
            "CREATE INDEX IF NOT EXISTS idx_workers_planner ON workers(planner_id)",
            "CREATE INDEX IF NOT EXISTS idx_planners_status ON planners(status)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("failed to create index")?;
        }

        Ok(())
    }
}

/// Convert a SQLite NaiveDateTime column to an RFC 3339 string.
pub(crate) fn timestamp_to_rfc3339(value: chrono::NaiveDateTime) -> String {
    value.and_utc().to_rfc3339()
}
