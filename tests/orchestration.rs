//! End-to-end orchestration scenarios with a scripted LLM and sandbox.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use serde_json::json;
use taskforce::artefacts::ArtefactStore;
use taskforce::config::{Config, LlmConfig, TaskLimits};
use taskforce::dispatcher;
use taskforce::handlers::{self, HandlerRegistry};
use taskforce::llm::{FakeLlmClient, LlmClientDyn};
use taskforce::notify::{ClientEvent, Notifier};
use taskforce::router::{self, RouterAgent};
use taskforce::sandbox::{FakeSandbox, SandboxDyn, SandboxOutcome};
use taskforce::store::{Role, Store, WorkerTaskStatus};
use taskforce::tools::ToolRegistry;
use taskforce::{AgentType, Deps};

struct Harness {
    deps: Deps,
    llm: Arc<FakeLlmClient>,
    sandbox: Arc<FakeSandbox>,
    registry: Arc<HandlerRegistry>,
    _scratch: tempfile::TempDir,
}

async fn harness(limits: TaskLimits) -> Harness {
    let scratch = tempfile::tempdir().expect("tempdir");
    let store = Store::connect_in_memory().await.expect("store");

    let llm = Arc::new(FakeLlmClient::new());
    let sandbox = Arc::new(FakeSandbox::new());

    let config = Config {
        port: 0,
        database_path: scratch.path().join("taskforce.db"),
        collaterals_base_path: scratch.path().join("collaterals"),
        llm: LlmConfig {
            router_model: "test-router".to_string(),
            planner_model: "test-planner".to_string(),
            worker_model: "test-worker".to_string(),
            openai_key: Some("test-key".to_string()),
            gemini_key: None,
            anthropic_key: None,
        },
        limits,
    };

    let deps = Deps {
        store,
        artefacts: ArtefactStore::new(scratch.path().join("collaterals")),
        llm: llm.clone() as Arc<dyn LlmClientDyn>,
        sandbox: sandbox.clone() as Arc<dyn SandboxDyn>,
        notifier: Notifier::new(),
        tools: ToolRegistry::standard(),
        config: Arc::new(config),
    };

    Harness {
        deps,
        llm,
        sandbox,
        registry: HandlerRegistry::standard(),
        _scratch: scratch,
    }
}

impl Harness {
    async fn drain(&self) {
        dispatcher::run_until_idle(&self.deps, &self.registry, 200)
            .await
            .expect("queue drains");
    }

    /// The planner spawned by the router's kickoff message.
    async fn planner_id_for(&self, router_id: &str) -> String {
        let log = self
            .deps
            .store
            .get_messages(AgentType::Router, router_id)
            .await
            .expect("router log");
        let kickoff = log
            .iter()
            .find(|message| message.content.to_text() == "Agents assemble!")
            .expect("kickoff message exists");
        self.deps
            .store
            .planner_for_message(kickoff.id)
            .await
            .expect("link query")
            .expect("kickoff message links to a planner")
    }

    fn write_file(&self, name: &str, content: &str) -> String {
        let path = self._scratch.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create file");
        file.write_all(content.as_bytes()).expect("write file");
        path.to_string_lossy().to_string()
    }
}

fn single_todo_plan_script(llm: &FakeLlmClient, todo: &str, final_answer: &str) {
    llm.push_structured(
        "InitialExecutionPlan",
        json!({"objective": "Answer the question", "todos": [todo]}),
    );
    // Synthesis revision: no open todos remain after the worker.
    llm.push_structured("ExecutionPlan", json!({"objective": "", "todos": []}));
    llm.push_text(final_answer);
}

// Scenario 1: a plain greeting stays on the simple-chat path and never
// touches the planner machinery.
#[tokio::test]
async fn simple_chat_creates_no_planner() {
    let h = harness(TaskLimits::default()).await;
    let router_id = taskforce::new_id();
    let mut events = h.deps.notifier.attach(&router_id).await;

    h.llm.push_structured("RequireAgent", json!({}));
    h.llm.push_text("Hi!");

    let agent = RouterAgent::new(router_id.clone(), h.deps.clone());
    agent.activate("Hello", Vec::new()).await.expect("turn");

    assert!(matches!(events.recv().await, Some(ClientEvent::InputLock { .. })));
    match events.recv().await {
        Some(ClientEvent::Status { message, .. }) => assert_eq!(message, "Thinking"),
        other => panic!("expected status, got {other:?}"),
    }
    match events.recv().await {
        Some(ClientEvent::Response { message, .. }) => assert_eq!(message, "Hi!"),
        other => panic!("expected response, got {other:?}"),
    }
    assert!(matches!(events.recv().await, Some(ClientEvent::InputUnlock { .. })));

    // Nothing was queued and no planner exists.
    assert!(h.deps.store.get_pending_tasks().await.expect("pending").is_empty());
    assert!(h
        .deps
        .store
        .planners_needing_resume()
        .await
        .expect("scan")
        .is_empty());
}

// Scenario 2: one CSV file drives a full plan -> SQL worker -> synthesis
// -> final answer cycle.
#[tokio::test]
async fn csv_analysis_runs_to_completion() {
    let h = harness(TaskLimits::default()).await;
    let csv_path = h.write_file("sales.csv", "region,revenue\nnorth,1200\nsouth,3010\n");
    let router_id = taskforce::new_id();

    // Files-only path: the conversation is summarised first.
    h.llm.push_text("What is the total revenue?");
    single_todo_plan_script(&h.llm, "Sum the revenue column via SQL", "The total revenue is 4210.");
    h.llm.push_structured(
        "TaskSpec",
        json!({
            "context": "The table `sales` holds one row per region with a revenue column.",
            "previous_outputs": "No previous tasks have been executed.",
            "user_request": "What is the total revenue?",
            "task_description": "Sum the revenue column of the sales table",
            "acceptance_criteria": ["A single total number is produced"],
            "querying_structured_data": true,
        }),
    );
    h.llm.push_structured(
        "TaskArtefactSql",
        json!({"sql_code": "SELECT SUM(CAST(revenue AS REAL)) AS total_revenue FROM sales"}),
    );
    h.llm.push_structured(
        "TaskValidation",
        json!({
            "task_completed": true,
            "validated_result": {"result": "Summed the revenue column.", "output": "4210"},
        }),
    );

    let agent = RouterAgent::new(router_id.clone(), h.deps.clone());
    agent
        .activate("What is the total revenue?", vec![csv_path])
        .await
        .expect("turn");

    h.drain().await;
    router::pump_once(&h.deps).await.expect("pump");

    let planner_id = h.planner_id_for(&router_id).await;
    let planner = h
        .deps
        .store
        .get_planner(&planner_id)
        .await
        .expect("fetch")
        .expect("planner exists");
    assert_eq!(planner.status, taskforce::store::PlannerStatus::Completed);
    assert!(planner.execution_plan.expect("plan markdown").contains("[x]"));
    assert_eq!(
        planner.user_response.as_deref(),
        Some("The total revenue is 4210.")
    );

    let workers = h
        .deps
        .store
        .workers_for_planner(&planner_id)
        .await
        .expect("workers");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].task_status, WorkerTaskStatus::Recorded);
    assert!(workers[0].querying_structured_data);

    // The worker's context message carries the three task-context
    // sections authored at task creation.
    let worker_log = h
        .deps
        .store
        .get_messages(AgentType::Worker, &workers[0].worker_id)
        .await
        .expect("worker log");
    let context_message = worker_log
        .iter()
        .find(|message| message.content.to_text().contains("# Context"))
        .expect("context message seeded")
        .content
        .to_text();
    assert!(context_message.contains("one row per region"));
    assert!(context_message.contains("# Previous outputs"));
    assert!(context_message.contains("No previous tasks have been executed."));
    assert!(context_message.contains("# Original user request"));

    // The final answer landed on the router log.
    let log = h
        .deps
        .store
        .get_messages(AgentType::Router, &router_id)
        .await
        .expect("router log");
    let last_assistant = log
        .iter()
        .rev()
        .find(|message| message.role == Role::Assistant)
        .expect("assistant message");
    assert_eq!(last_assistant.content.to_text(), "The total revenue is 4210.");

    // Completion released the planner's artefact directory.
    assert!(!h.deps.artefacts.planner_dir(&planner_id).exists());
}

// Scenario 3: a failing first attempt retries and succeeds on the
// second, with exactly one synthesis task at the end.
#[tokio::test]
async fn worker_retries_then_succeeds() {
    let h = harness(TaskLimits::default()).await;
    let router_id = taskforce::new_id();

    h.llm.push_structured("RequireAgent", json!({"complex_question": true, "context_rich_agent_request": "Compute the value"}));
    single_todo_plan_script(&h.llm, "Compute the value with python", "The value is 42.");
    h.llm.push_structured(
        "TaskSpec",
        json!({
            "user_request": "Compute the value",
            "task_description": "Compute the value in python",
            "acceptance_criteria": ["A value is printed"],
        }),
    );
    // Attempt 1: code raises; attempt 2 succeeds.
    h.llm.push_structured(
        "TaskArtefact",
        json!({"python_code": "print(x)", "output_variables": []}),
    );
    h.llm.push_structured(
        "TaskArtefact",
        json!({"python_code": "print(42)", "output_variables": []}),
    );
    h.llm.set_structured_default("ToolMissing", json!({"tool_not_available": false}));
    h.llm.push_structured(
        "TaskValidation",
        json!({
            "task_completed": true,
            "validated_result": {"result": "Printed the value.", "output": "42"},
        }),
    );

    h.sandbox.push_outcome(SandboxOutcome {
        success: false,
        error: Some("NameError: name 'x' is not defined".to_string()),
        stack_trace: Some("Traceback (most recent call last): ...".to_string()),
        ..Default::default()
    });
    h.sandbox.push_outcome(SandboxOutcome {
        success: true,
        output: "42\n".to_string(),
        variables: HashMap::new(),
        ..Default::default()
    });

    let agent = RouterAgent::new(router_id.clone(), h.deps.clone());
    agent.activate("Compute the value", Vec::new()).await.expect("turn");
    h.drain().await;

    let planner_id = h.planner_id_for(&router_id).await;
    let workers = h
        .deps
        .store
        .workers_for_planner(&planner_id)
        .await
        .expect("workers");
    assert_eq!(workers.len(), 1);
    let worker = &workers[0];
    assert_eq!(worker.current_attempt, 2);
    assert_eq!(worker.task_status, WorkerTaskStatus::Recorded);
    assert!(!worker.validation_failed);

    let worker_tasks = h
        .deps
        .store
        .tasks_for_entity(&worker.worker_id)
        .await
        .expect("worker tasks");
    let attempts = worker_tasks
        .iter()
        .filter(|task| task.handler_name == "execute_standard_worker")
        .count();
    assert_eq!(attempts, 2);

    let planner_tasks = h
        .deps
        .store
        .tasks_for_entity(&planner_id)
        .await
        .expect("planner tasks");
    let syntheses = planner_tasks
        .iter()
        .filter(|task| task.handler_name == "execute_synthesis")
        .count();
    assert_eq!(syntheses, 1);
}

// Scenario 4: every attempt fails; the retry budget runs out, synthesis
// is queued exactly once, and the final answer owns up to the failure.
#[tokio::test]
async fn retry_exhaustion_finalises_with_acknowledged_failure() {
    let limits = TaskLimits {
        failed_task_limit: 1,
        max_retry_tasks: 2,
    };
    let h = harness(limits).await;
    let router_id = taskforce::new_id();

    h.llm.push_structured(
        "RequireAgent",
        json!({"complex_question": true, "context_rich_agent_request": "Do the impossible"}),
    );
    h.llm.push_structured(
        "InitialExecutionPlan",
        json!({"objective": "Do the impossible", "todos": ["Attempt the impossible computation"]}),
    );
    h.llm.push_structured(
        "TaskSpec",
        json!({
            "user_request": "Do the impossible",
            "task_description": "Attempt the impossible computation",
            "acceptance_criteria": ["The computation succeeds"],
        }),
    );
    h.llm.set_structured_default(
        "TaskArtefact",
        json!({"python_code": "explode()", "output_variables": []}),
    );
    h.llm.set_structured_default("ToolMissing", json!({"tool_not_available": false}));
    h.llm.set_text_default(
        "Parts of the request could not be completed: the computation task failed after \
         multiple tries.",
    );

    for _ in 0..limits.max_retry_tasks {
        h.sandbox.push_outcome(SandboxOutcome {
            success: false,
            error: Some("RuntimeError: boom".to_string()),
            stack_trace: Some("Traceback ...".to_string()),
            ..Default::default()
        });
    }

    let agent = RouterAgent::new(router_id.clone(), h.deps.clone());
    agent.activate("Do the impossible", Vec::new()).await.expect("turn");
    h.drain().await;

    let planner_id = h.planner_id_for(&router_id).await;
    let planner = h
        .deps
        .store
        .get_planner(&planner_id)
        .await
        .expect("fetch")
        .expect("planner exists");
    assert_eq!(planner.status, taskforce::store::PlannerStatus::Completed);
    assert!(planner
        .user_response
        .expect("user response")
        .contains("failed"));

    let workers = h
        .deps
        .store
        .workers_for_planner(&planner_id)
        .await
        .expect("workers");
    assert_eq!(workers.len(), 1);
    let worker = &workers[0];
    assert_eq!(worker.current_attempt, limits.max_retry_tasks);
    assert!(worker.validation_failed);
    assert_eq!(worker.task_result, "Task failed after multiple tries.");

    let planner_tasks = h
        .deps
        .store
        .tasks_for_entity(&planner_id)
        .await
        .expect("planner tasks");
    let syntheses = planner_tasks
        .iter()
        .filter(|task| task.handler_name == "execute_synthesis")
        .count();
    assert_eq!(syntheses, 1);
}

// Scenario 5: flagged-malicious code never reaches the sandbox.
#[tokio::test]
async fn malicious_code_is_rejected_without_execution() {
    let h = harness(TaskLimits::default()).await;
    let router_id = taskforce::new_id();

    h.llm.push_structured(
        "RequireAgent",
        json!({"complex_question": true, "context_rich_agent_request": "Clean up my files"}),
    );
    single_todo_plan_script(&h.llm, "Perform the requested action", "Done, without the dangerous part.");
    h.llm.push_structured(
        "TaskSpec",
        json!({
            "user_request": "Clean up my files",
            "task_description": "Perform the requested action",
            "acceptance_criteria": ["The action is performed safely"],
        }),
    );
    // First attempt is flagged malicious; the retry answers without code.
    h.llm.push_structured(
        "TaskArtefact",
        json!({
            "python_code": "import os; os.system('rm -rf /')",
            "is_malicious": true,
            "output_variables": [],
        }),
    );
    h.llm.push_structured(
        "TaskArtefact",
        json!({"result": "Refused the dangerous action and summarised safe alternatives."}),
    );
    h.llm.push_structured(
        "TaskValidation",
        json!({
            "task_completed": true,
            "validated_result": {"result": "Handled safely.", "output": "safe summary"},
        }),
    );

    let agent = RouterAgent::new(router_id.clone(), h.deps.clone());
    agent.activate("Clean up my files", Vec::new()).await.expect("turn");
    h.drain().await;

    // The sandbox never ran.
    assert!(h.sandbox.executions().is_empty());

    let planner_id = h.planner_id_for(&router_id).await;
    let workers = h
        .deps
        .store
        .workers_for_planner(&planner_id)
        .await
        .expect("workers");
    let worker = &workers[0];
    assert_eq!(worker.current_attempt, 2);

    let log = h
        .deps
        .store
        .get_messages(AgentType::Worker, &worker.worker_id)
        .await
        .expect("worker log");
    assert!(log
        .iter()
        .any(|message| message.content.to_text().contains("considered malicious")));
}

// Scenario 6: after a simulated crash between task creation and the
// worker run, re-enqueueing worker_initialisation is idempotent.
#[tokio::test]
async fn crash_recovery_reinitialisation_is_idempotent() {
    let h = harness(TaskLimits::default()).await;
    let router_id = taskforce::new_id();

    h.llm.push_structured(
        "RequireAgent",
        json!({"complex_question": true, "context_rich_agent_request": "Compute the value"}),
    );
    h.llm.push_structured(
        "InitialExecutionPlan",
        json!({"objective": "Compute", "todos": ["Compute the value"]}),
    );
    h.llm.push_structured(
        "TaskSpec",
        json!({
            "user_request": "Compute the value",
            "task_description": "Compute the value in python",
            "acceptance_criteria": ["A value is printed"],
        }),
    );

    let agent = RouterAgent::new(router_id.clone(), h.deps.clone());
    agent.activate("Compute the value", Vec::new()).await.expect("turn");

    // Run initial planning and task creation, stopping before the worker
    // initialisation task executes.
    dispatcher::run_until_idle(&h.deps, &h.registry, 2)
        .await
        .expect("partial drain");

    let planner_id = h.planner_id_for(&router_id).await;
    let task = h
        .deps
        .artefacts
        .load_current_task(&planner_id)
        .expect("read")
        .expect("current task persisted");
    let worker_id = task.task_id.clone();

    // Hard crash: the queue is wiped at next start.
    h.deps.store.clear_task_queue().await.expect("wipe");
    assert!(h.deps.store.get_worker(&worker_id).await.expect("fetch").is_none());

    // External resume re-enqueues worker initialisation; run it once.
    handlers::queue_worker_initialisation(&h.deps.store, &worker_id, &planner_id)
        .await
        .expect("requeue");
    dispatcher::run_until_idle(&h.deps, &h.registry, 1)
        .await
        .expect("init runs");

    let worker = h
        .deps
        .store
        .get_worker(&worker_id)
        .await
        .expect("fetch")
        .expect("worker row created");
    assert_eq!(worker.task_status, WorkerTaskStatus::Pending);
    let seeded_messages = h
        .deps
        .store
        .get_messages(AgentType::Worker, &worker_id)
        .await
        .expect("log")
        .len();

    // Crash again before the execute handler runs, then re-initialise.
    // The second initialisation observes the existing row: no duplicate
    // rows, no duplicate seeding, exactly one fresh execute task.
    h.deps.store.clear_task_queue().await.expect("second wipe");
    handlers::queue_worker_initialisation(&h.deps.store, &worker_id, &planner_id)
        .await
        .expect("requeue again");
    dispatcher::run_until_idle(&h.deps, &h.registry, 1)
        .await
        .expect("resume runs");

    let workers = h
        .deps
        .store
        .workers_for_planner(&planner_id)
        .await
        .expect("workers");
    assert_eq!(workers.len(), 1);

    let messages_after = h
        .deps
        .store
        .get_messages(AgentType::Worker, &worker_id)
        .await
        .expect("log")
        .len();
    assert_eq!(messages_after, seeded_messages);

    let pending = h.deps.store.get_pending_tasks().await.expect("pending");
    let execute_tasks = pending
        .iter()
        .filter(|task| task.handler_name == "execute_standard_worker")
        .count();
    assert_eq!(execute_tasks, 1);
}

// Re-running execute_initial_planning for an existing planner is a
// no-op apart from chaining into task creation.
#[tokio::test]
async fn initial_planning_is_idempotent_for_existing_planner() {
    let h = harness(TaskLimits::default()).await;
    let router_id = taskforce::new_id();

    h.llm.push_structured(
        "RequireAgent",
        json!({"complex_question": true, "context_rich_agent_request": "Compute"}),
    );
    h.llm.push_structured(
        "InitialExecutionPlan",
        json!({"objective": "Compute", "todos": ["Only step"]}),
    );

    let agent = RouterAgent::new(router_id.clone(), h.deps.clone());
    agent.activate("Compute", Vec::new()).await.expect("turn");

    // Only initial planning runs.
    dispatcher::run_until_idle(&h.deps, &h.registry, 1)
        .await
        .expect("initial planning");

    let planner_id = h.planner_id_for(&router_id).await;
    let messages_before = h
        .deps
        .store
        .get_messages(AgentType::Planner, &planner_id)
        .await
        .expect("log")
        .len();

    // Crash: the queued task_creation is wiped; resume re-enqueues the
    // same handler for the same planner id, with no payload at all.
    h.deps.store.clear_task_queue().await.expect("wipe");
    h.deps
        .store
        .enqueue_task(
            &taskforce::new_id(),
            AgentType::Planner,
            &planner_id,
            "execute_initial_planning",
            None,
        )
        .await
        .expect("requeue");
    dispatcher::run_until_idle(&h.deps, &h.registry, 1)
        .await
        .expect("resume");

    let messages_after = h
        .deps
        .store
        .get_messages(AgentType::Planner, &planner_id)
        .await
        .expect("log")
        .len();
    assert_eq!(messages_after, messages_before);

    let planner = h
        .deps
        .store
        .get_planner(&planner_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(
        planner.next_handler.expect("next handler").as_str(),
        "execute_task_creation"
    );

    // The resume chained task creation back onto the queue.
    let pending = h.deps.store.get_pending_tasks().await.expect("pending");
    assert!(pending
        .iter()
        .any(|task| task.handler_name == "execute_task_creation"));
}
