//! The dispatcher: a poll-batch-execute loop over the durable queue.
//!
//! Every second it fetches the pending set and races a claim for each
//! record. Winners run their handler to completion and stamp the record
//! COMPLETED or FAILED; losers drop silently. Per-planner serialism is
//! structural (each handler enqueues at most one follow-up), so the loop
//! itself needs no per-router locks.

use crate::error::Result;
use crate::handlers::{self, HandlerRegistry};
use crate::store::{TaskRecord, TaskStatus};
use crate::Deps;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

/// Queue poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the dispatcher loop. It runs until the shutdown signal flips.
pub fn spawn(
    deps: Deps,
    registry: Arc<HandlerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(deps, registry, shutdown_rx).await;
        tracing::info!("dispatcher stopped");
    })
}

async fn run(deps: Deps, registry: Arc<HandlerRegistry>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(POLL_INTERVAL);
    tracing::info!(handlers = ?registry.names(), "dispatcher started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }

        let pending = match deps.store.get_pending_tasks().await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(%error, "failed to poll task queue");
                continue;
            }
        };

        for task in pending {
            let deps = deps.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                execute_task(task, deps, registry).await;
            });
        }
    }
}

/// Claim and run one queue record.
pub async fn execute_task(task: TaskRecord, deps: Deps, registry: Arc<HandlerRegistry>) {
    let claimed = match deps.store.claim_task(&task.task_id).await {
        Ok(claimed) => claimed,
        Err(error) => {
            tracing::error!(task_id = %task.task_id, %error, "failed to claim task");
            return;
        }
    };
    if !claimed {
        // Another claimer won the race.
        return;
    }

    tracing::info!(
        task_id = %task.task_id,
        entity_id = %task.entity_id,
        handler = %task.handler_name,
        "executing task"
    );

    let Some(handler) = registry.get(&task.handler_name) else {
        let message = format!("unknown handler: {}", task.handler_name);
        tracing::error!(task_id = %task.task_id, %message, "task dropped");
        complete(&deps, &task.task_id, TaskStatus::Failed, Some(&message)).await;
        return;
    };

    match handler(task.clone(), deps.clone()).await {
        Ok(()) => {
            complete(&deps, &task.task_id, TaskStatus::Completed, None).await;
            tracing::info!(task_id = %task.task_id, "task completed");
        }
        Err(error) => {
            let message = format!("{error:#}");
            tracing::error!(task_id = %task.task_id, error = %message, "task failed");
            complete(&deps, &task.task_id, TaskStatus::Failed, Some(&message)).await;
        }
    }
}

async fn complete(deps: &Deps, task_id: &str, status: TaskStatus, error: Option<&str>) {
    if let Err(store_error) = deps.store.complete_task(task_id, status, error).await {
        tracing::error!(%task_id, %store_error, "failed to record task completion");
    }
}

/// Drain the queue serially until it is empty (or the step budget runs
/// out). Deterministic alternative to the timed loop, used by tests and
/// the startup resume path.
pub async fn run_until_idle(deps: &Deps, registry: &Arc<HandlerRegistry>, max_steps: usize) -> Result<usize> {
    let mut steps = 0;

    loop {
        let pending = deps.store.get_pending_tasks().await?;
        if pending.is_empty() {
            return Ok(steps);
        }

        for task in pending {
            execute_task(task, deps.clone(), registry.clone()).await;
            steps += 1;
            if steps >= max_steps {
                return Ok(steps);
            }
        }
    }
}

/// Startup resume: re-enqueue the recorded `next_handler` of every
/// non-terminal planner. Planners parked on `waiting_for_worker` resume
/// through synthesis, which loops back to task creation when no worker
/// output is waiting.
pub async fn resume_pending_planners(deps: &Deps) -> Result<u32> {
    let planners = deps.store.planners_needing_resume().await?;
    let mut resumed = 0;

    for planner in planners {
        let Some(next_handler) = planner.next_handler else {
            continue;
        };
        if next_handler.is_completed() {
            continue;
        }

        let handler_name = if next_handler.is_waiting_for_worker() {
            handlers::EXECUTE_SYNTHESIS
        } else {
            match next_handler.as_str() {
                handlers::EXECUTE_INITIAL_PLANNING => handlers::EXECUTE_INITIAL_PLANNING,
                handlers::EXECUTE_TASK_CREATION => handlers::EXECUTE_TASK_CREATION,
                handlers::EXECUTE_SYNTHESIS => handlers::EXECUTE_SYNTHESIS,
                other => {
                    tracing::warn!(
                        planner_id = %planner.planner_id,
                        handler = %other,
                        "planner recorded an unknown next handler, skipping resume"
                    );
                    continue;
                }
            }
        };

        handlers::update_next_and_enqueue(&deps.store, &planner.planner_id, handler_name).await?;
        tracing::info!(
            planner_id = %planner.planner_id,
            handler = handler_name,
            "planner resumed"
        );
        resumed += 1;
    }

    Ok(resumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artefacts::ArtefactStore;
    use crate::config::{Config, LlmConfig, TaskLimits};
    use crate::llm::FakeLlmClient;
    use crate::notify::Notifier;
    use crate::sandbox::FakeSandbox;
    use crate::store::Store;
    use crate::tools::ToolRegistry;
    use crate::AgentType;

    async fn test_deps(scratch: &std::path::Path) -> Deps {
        Deps {
            store: Store::connect_in_memory().await.expect("store"),
            artefacts: ArtefactStore::new(scratch),
            llm: Arc::new(FakeLlmClient::new()),
            sandbox: Arc::new(FakeSandbox::new()),
            notifier: Notifier::new(),
            tools: ToolRegistry::standard(),
            config: Arc::new(Config {
                port: 0,
                database_path: scratch.join("taskforce.db"),
                collaterals_base_path: scratch.to_path_buf(),
                llm: LlmConfig {
                    router_model: "test-router".to_string(),
                    planner_model: "test-planner".to_string(),
                    worker_model: "test-worker".to_string(),
                    openai_key: Some("test-key".to_string()),
                    gemini_key: None,
                    anthropic_key: None,
                },
                limits: TaskLimits::default(),
            }),
        }
    }

    #[tokio::test]
    async fn unknown_handler_fails_the_task_with_a_message() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let deps = test_deps(scratch.path()).await;
        let registry = handlers::HandlerRegistry::standard();

        deps.store
            .enqueue_task("t1", AgentType::Planner, "p1", "not_a_real_handler", None)
            .await
            .expect("enqueue");

        run_until_idle(&deps, &registry, 10).await.expect("drain");

        let task = deps
            .store
            .get_task("t1")
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error_message
            .expect("error recorded")
            .contains("unknown handler"));
    }

    #[tokio::test]
    async fn lost_claims_are_dropped_silently() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let deps = test_deps(scratch.path()).await;
        let registry = handlers::HandlerRegistry::standard();

        deps.store
            .enqueue_task("t1", AgentType::Planner, "p1", "execute_task_creation", None)
            .await
            .expect("enqueue");
        let task = deps
            .store
            .get_task("t1")
            .await
            .expect("fetch")
            .expect("exists");

        // Another dispatcher instance wins the claim first.
        assert!(deps.store.claim_task("t1").await.expect("claim"));

        execute_task(task, deps.clone(), registry).await;

        // The loser left the record alone: still in progress, no error.
        let task = deps
            .store
            .get_task("t1")
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.error_message.is_none());
    }

    #[tokio::test]
    async fn resume_scan_requeues_non_terminal_planners() {
        use crate::store::{CreatePlannerInput, NextHandler, PlannerStatus};

        let scratch = tempfile::tempdir().expect("tempdir");
        let deps = test_deps(scratch.path()).await;

        for (planner_id, status, next) in [
            ("p1", PlannerStatus::Executing, NextHandler::handler(handlers::EXECUTE_TASK_CREATION)),
            ("p2", PlannerStatus::Executing, NextHandler::waiting_for_worker()),
            ("p3", PlannerStatus::Completed, NextHandler::completed()),
        ] {
            deps.store
                .create_planner(CreatePlannerInput {
                    planner_id: planner_id.to_string(),
                    planner_name: None,
                    user_question: "q".to_string(),
                    instruction: String::new(),
                    model: "test-planner".to_string(),
                    temperature: 0.0,
                    failed_task_limit: 3,
                    status,
                    next_handler: next,
                })
                .await
                .expect("create");
        }

        let resumed = resume_pending_planners(&deps).await.expect("resume");
        assert_eq!(resumed, 2);

        let pending = deps.store.get_pending_tasks().await.expect("pending");
        let handlers_queued: Vec<(&str, &str)> = pending
            .iter()
            .map(|task| (task.entity_id.as_str(), task.handler_name.as_str()))
            .collect();
        assert!(handlers_queued.contains(&("p1", handlers::EXECUTE_TASK_CREATION)));
        // A planner parked on its worker resumes through synthesis.
        assert!(handlers_queued.contains(&("p2", handlers::EXECUTE_SYNTHESIS)));
        assert_eq!(pending.len(), 2);
    }
}
