//! Handler registry and the chain helpers that drive the planner and
//! worker state machines through the durable queue.

pub mod planner;
pub mod worker;

use crate::error::Result;
use crate::store::{NextHandler, Store, TaskRecord, UpdatePlannerInput};
use crate::{AgentType, Deps};
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

pub const EXECUTE_INITIAL_PLANNING: &str = "execute_initial_planning";
pub const EXECUTE_TASK_CREATION: &str = "execute_task_creation";
pub const EXECUTE_SYNTHESIS: &str = "execute_synthesis";
pub const WORKER_INITIALISATION: &str = "worker_initialisation";
pub const EXECUTE_STANDARD_WORKER: &str = "execute_standard_worker";
pub const EXECUTE_SQL_WORKER: &str = "execute_sql_worker";

/// A handler invocation in flight.
pub type HandlerFuture = Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

/// Handlers are free functions of the queue record and the shared deps.
pub type HandlerFn = fn(TaskRecord, Deps) -> HandlerFuture;

/// Fixed mapping from handler names to handler functions, populated at
/// process start.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, HandlerFn>,
}

impl HandlerRegistry {
    /// The six handlers of the planner and worker state machines.
    pub fn standard() -> Arc<Self> {
        let mut handlers: HashMap<&'static str, HandlerFn> = HashMap::new();

        handlers.insert(EXECUTE_INITIAL_PLANNING, |record, deps| {
            Box::pin(planner::execute_initial_planning(record, deps))
        });
        handlers.insert(EXECUTE_TASK_CREATION, |record, deps| {
            Box::pin(planner::execute_task_creation(record, deps))
        });
        handlers.insert(EXECUTE_SYNTHESIS, |record, deps| {
            Box::pin(planner::execute_synthesis(record, deps))
        });
        handlers.insert(WORKER_INITIALISATION, |record, deps| {
            Box::pin(worker::worker_initialisation(record, deps))
        });
        handlers.insert(EXECUTE_STANDARD_WORKER, |record, deps| {
            Box::pin(worker::execute_standard_worker(record, deps))
        });
        handlers.insert(EXECUTE_SQL_WORKER, |record, deps| {
            Box::pin(worker::execute_sql_worker(record, deps))
        });

        Arc::new(Self { handlers })
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Atomically record a planner's next handler and enqueue it. This is
/// how planner handlers chain to their successor.
pub async fn update_next_and_enqueue(
    store: &Store,
    planner_id: &str,
    handler_name: &'static str,
) -> Result<()> {
    store
        .update_planner(
            planner_id,
            UpdatePlannerInput {
                next_handler: Some(NextHandler::handler(handler_name)),
                ..Default::default()
            },
        )
        .await?;

    store
        .enqueue_task(
            &crate::new_id(),
            AgentType::Planner,
            planner_id,
            handler_name,
            None,
        )
        .await?;

    tracing::debug!(%planner_id, handler = handler_name, "planner chained to next handler");
    Ok(())
}

/// Enqueue a worker's first handler. The worker row doesn't exist yet,
/// so the owning planner travels in the payload.
pub async fn queue_worker_initialisation(
    store: &Store,
    worker_id: &str,
    planner_id: &str,
) -> Result<()> {
    store
        .enqueue_task(
            &crate::new_id(),
            AgentType::Worker,
            worker_id,
            WORKER_INITIALISATION,
            Some(json!({"planner_id": planner_id})),
        )
        .await
}

/// Enqueue a worker execute handler (initial dispatch or self-retry).
pub async fn enqueue_worker_handler(
    store: &Store,
    worker_id: &str,
    handler_name: &'static str,
) -> Result<()> {
    store
        .enqueue_task(&crate::new_id(), AgentType::Worker, worker_id, handler_name, None)
        .await
}
