//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::path::PathBuf;

/// Per-call timeout for sandbox and SQL executions, in seconds.
pub const EXECUTION_TIMEOUT_SECS: u64 = 30;

/// Taskforce configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen port.
    pub port: u16,

    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Base directory for per-planner collateral files (variables,
    /// images, plan JSON, per-planner database).
    pub collaterals_base_path: PathBuf,

    /// LLM provider configuration.
    pub llm: LlmConfig,

    /// Retry and failure budgets.
    pub limits: TaskLimits,
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Model used by the router for chat and classification.
    pub router_model: String,

    /// Model used by planners.
    pub planner_model: String,

    /// Model used by workers.
    pub worker_model: String,

    /// OpenAI API key (from env).
    pub openai_key: Option<String>,

    /// Gemini API key (from env).
    pub gemini_key: Option<String>,

    /// Anthropic API key (from env).
    pub anthropic_key: Option<String>,
}

/// Retry and failure budgets for planners and workers.
#[derive(Debug, Clone, Copy)]
pub struct TaskLimits {
    /// A planner gives up on the overall request after this many
    /// failed-validation tasks.
    pub failed_task_limit: u32,

    /// Per-worker retry budget.
    pub max_retry_tasks: u32,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            failed_task_limit: 3,
            max_retry_tasks: 5,
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(value) => value
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a port number: {value}")))?,
            Err(_) => 8000,
        };

        let database_path = std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/taskforce.db"));

        let collaterals_base_path = std::env::var("COLLATERALS_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/collaterals"));

        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
        }
        std::fs::create_dir_all(&collaterals_base_path).with_context(|| {
            format!(
                "failed to create collaterals directory: {}",
                collaterals_base_path.display()
            )
        })?;

        let llm = LlmConfig {
            router_model: std::env::var("ROUTER_MODEL").unwrap_or_else(|_| "gpt-4.1-nano".into()),
            planner_model: std::env::var("PLANNER_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-pro".into()),
            worker_model: std::env::var("WORKER_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4".into()),
            openai_key: std::env::var("OPENAI_API_KEY").ok(),
            gemini_key: std::env::var("GEMINI_API_KEY").ok(),
            anthropic_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        };

        if llm.openai_key.is_none() && llm.gemini_key.is_none() && llm.anthropic_key.is_none() {
            return Err(ConfigError::Invalid(
                "no LLM provider API key found; set OPENAI_API_KEY, GEMINI_API_KEY or ANTHROPIC_API_KEY".into(),
            )
            .into());
        }

        let limits = TaskLimits {
            failed_task_limit: parse_env_u32("FAILED_TASK_LIMIT")?.unwrap_or(3),
            max_retry_tasks: parse_env_u32("MAX_RETRY_TASKS")?.unwrap_or(5),
        };

        Ok(Self {
            port,
            database_path,
            collaterals_base_path,
            llm,
            limits,
        })
    }

    /// SQLite connection URL, creating the file on first open.
    pub fn sqlite_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path.display())
    }
}

fn parse_env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key} is not a number: {value}")).into()),
        Err(_) => Ok(None),
    }
}
