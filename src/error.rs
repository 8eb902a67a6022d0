//! Top-level error types for Taskforce.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[from] sqlx::Error),

    #[error("schema initialisation failed: {0}")]
    Migration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("task {task_id} is not claimable (already claimed or terminal)")]
    ClaimConflict { task_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider and structured-output errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("missing API key for provider: {0}")]
    MissingProviderKey(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("completion failed after retries: {0}")]
    CompletionFailed(String),

    #[error("structured output did not match schema: {0}")]
    SchemaViolation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent (router, planner, worker) state errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("router {id} not found")]
    RouterNotFound { id: String },

    #[error("planner {id} not found")]
    PlannerNotFound { id: String },

    #[error("worker {id} not found")]
    WorkerNotFound { id: String },

    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error("worker {worker_id} does not match current task {task_id}")]
    TaskMismatch { worker_id: String, task_id: String },

    #[error("no processable input files: {0}")]
    NoUsableFiles(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Sandbox execution errors (the harness itself, not user code).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn sandbox process: {0}")]
    Spawn(String),

    #[error("sandbox execution timed out after {0}s")]
    Timeout(u64),

    #[error("sandbox harness produced unreadable output: {0}")]
    Harness(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
