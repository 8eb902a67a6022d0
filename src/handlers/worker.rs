//! Worker state-machine handlers: initialise, run one attempt (code or
//! SQL), validate, and always hand control back to the owning planner.

use crate::artefacts::CollisionPolicy;
use crate::config::EXECUTION_TIMEOUT_SECS;
use crate::error::{AgentError, Result};
use crate::handlers::{
    self, EXECUTE_SQL_WORKER, EXECUTE_STANDARD_WORKER, EXECUTE_SYNTHESIS,
};
use crate::llm::{self, ChatMessage, CompletionRequest};
use crate::sandbox::{self, SandboxDyn as _, SandboxRequest};
use crate::schemas::{
    RepeatFail, TaskArtefact, TaskArtefactSql, TaskValidation, ToolMissing,
};
use crate::store::{
    Content, CreateWorkerInput, Part, Role, TaskRecord, UpdateWorkerInput, WorkerRecord,
    WorkerTaskStatus,
};
use crate::tables;
use crate::{AgentType, Deps};
use anyhow::Context as _;
use serde_json::Value;
use std::collections::HashMap;

/// How much of a variable's string form lands in the worker's log.
const VARIABLE_PREVIEW_CHARS: usize = 10_000;

/// Attempts before the repeated-failure classifier is consulted.
const REPEAT_CHECK_MIN_ATTEMPTS: u32 = 3;

fn worker_kind_handler(querying_structured_data: bool) -> &'static str {
    if querying_structured_data {
        EXECUTE_SQL_WORKER
    } else {
        EXECUTE_STANDARD_WORKER
    }
}

/// Create the worker row from the planner's current task and seed its
/// message log.
pub async fn worker_initialisation(record: TaskRecord, deps: Deps) -> Result<()> {
    let worker_id = record.entity_id.clone();
    let planner_id: String = record
        .payload
        .as_ref()
        .and_then(|payload| payload.get("planner_id"))
        .and_then(Value::as_str)
        .context("worker initialisation payload carried no planner_id")?
        .to_string();

    // Resume: the worker already exists, go straight to execution.
    if let Some(worker) = deps.store.get_worker(&worker_id).await? {
        tracing::info!(%worker_id, "worker already exists, resuming execution");
        return handlers::enqueue_worker_handler(
            &deps.store,
            &worker_id,
            worker_kind_handler(worker.querying_structured_data),
        )
        .await;
    }

    match initialise(&worker_id, &planner_id, &deps).await {
        Ok(()) => Ok(()),
        Err(error) => {
            // The planner must still get its synthesis turn to adapt.
            mark_worker_failed(&deps, &worker_id, "Worker initialisation failed").await;
            let _ =
                handlers::update_next_and_enqueue(&deps.store, &planner_id, EXECUTE_SYNTHESIS)
                    .await;
            Err(error)
        }
    }
}

async fn initialise(worker_id: &str, planner_id: &str, deps: &Deps) -> Result<()> {
    let task = deps
        .artefacts
        .load_current_task(planner_id)?
        .with_context(|| format!("no current task on disk for planner {planner_id}"))?;

    if task.task_id != worker_id {
        return Err(AgentError::TaskMismatch {
            worker_id: worker_id.to_string(),
            task_id: task.task_id,
        }
        .into());
    }

    let planner = deps
        .store
        .get_planner(planner_id)
        .await?
        .ok_or_else(|| AgentError::PlannerNotFound {
            id: planner_id.to_string(),
        })?;

    let input_variable_paths: HashMap<String, String> = task
        .spec
        .variable_keys
        .iter()
        .filter_map(|key| {
            planner
                .variable_paths
                .get(key)
                .map(|path| (key.clone(), path.clone()))
        })
        .collect();
    let input_image_paths: HashMap<String, String> = task
        .spec
        .image_keys
        .iter()
        .filter_map(|key| {
            planner
                .image_paths
                .get(key)
                .map(|path| (key.clone(), path.clone()))
        })
        .collect();

    // Without tables there is nothing to query.
    let querying_structured_data = task.spec.querying_structured_data && !planner.tables.is_empty();

    deps.store
        .create_worker(CreateWorkerInput {
            worker_id: worker_id.to_string(),
            planner_id: planner_id.to_string(),
            worker_name: None,
            task_description: task.spec.task_description.clone(),
            acceptance_criteria: task.spec.acceptance_criteria.clone(),
            user_request: task.spec.user_request.clone(),
            querying_structured_data,
            image_keys: task.spec.image_keys.clone(),
            variable_keys: task.spec.variable_keys.clone(),
            tools: task.spec.tools.clone(),
            input_variable_paths: input_variable_paths.clone(),
            input_image_paths: input_image_paths.clone(),
            tables: planner.tables.clone(),
            document_paths: planner.document_paths.clone(),
            max_retry: deps.config.limits.max_retry_tasks,
        })
        .await?;

    seed_worker_messages(
        worker_id,
        deps,
        &task.spec,
        &input_variable_paths,
        &input_image_paths,
        &planner.document_paths,
    )
    .await?;

    handlers::enqueue_worker_handler(
        &deps.store,
        worker_id,
        worker_kind_handler(querying_structured_data),
    )
    .await?;

    tracing::info!(%worker_id, %planner_id, querying_structured_data, "worker initialised");
    Ok(())
}

async fn seed_worker_messages(
    worker_id: &str,
    deps: &Deps,
    spec: &crate::schemas::TaskSpec,
    input_variable_paths: &HashMap<String, String>,
    input_image_paths: &HashMap<String, String>,
    document_paths: &[String],
) -> Result<()> {
    deps.store
        .add_message(
            AgentType::Worker,
            worker_id,
            Role::User,
            format!("Perform the following task:\n{}", spec.task_description).into(),
        )
        .await?;

    deps.store
        .add_message(
            AgentType::Worker,
            worker_id,
            Role::Developer,
            format!(
                "# Context\n{}\n\n\
                 # Previous outputs\n{}\n\n\
                 # Original user request\n{}\n\n\
                 Unless the original user request is necessary to perform the task at hand, \
                 DO NOT change the actions to be performed based on the knowledge of the \
                 original request.",
                spec.context, spec.previous_outputs, spec.user_request,
            )
            .into(),
        )
        .await?;

    for key in &spec.image_keys {
        let Some(path) = input_image_paths.get(key) else {
            continue;
        };
        let Some(encoded) = deps.artefacts.load_image(std::path::Path::new(path))? else {
            continue;
        };

        deps.store
            .add_message(
                AgentType::Worker,
                worker_id,
                Role::User,
                Content::Multipart(vec![
                    Part::Image {
                        data: encoded,
                    },
                    Part::Text {
                        text: format!(
                            "The above image can be accessed via python using the following \
                             code to convert it into a PIL.Image object:\n\
                             ```python\nimport io\nimport base64\nfrom PIL import Image\n\
                             Image.open(io.BytesIO(base64.b64decode({key})))\n```\n\
                             Note 1: Do not assign the {key} variable, assume it already \
                             exists in the environment.\n\
                             Note 2: You must import io and base64 as part of the code.",
                        ),
                    },
                ]),
            )
            .await?;
    }

    if !spec.variable_keys.is_empty() && !input_variable_paths.is_empty() {
        deps.store
            .add_message(
                AgentType::Worker,
                worker_id,
                Role::Developer,
                format!(
                    "The following variables are available for use, they already exist in the \
                     environment, you do not need to declare or create them: {}",
                    spec.variable_keys.join(", ")
                )
                .into(),
            )
            .await?;

        for key in &spec.variable_keys {
            let Some(path) = input_variable_paths.get(key) else {
                continue;
            };
            let Some(value) = deps.artefacts.load_variable(std::path::Path::new(path))? else {
                continue;
            };

            let rendered = value.to_string();
            let preview: String = rendered.chars().take(VARIABLE_PREVIEW_CHARS).collect();
            deps.store
                .add_message(
                    AgentType::Worker,
                    worker_id,
                    Role::Developer,
                    format!(
                        "# {key}\nType: {}\n\nLength of variable: {}\n\n\
                         Variable content (first {VARIABLE_PREVIEW_CHARS} characters)\n\
                         ```\n{preview}\n```",
                        json_type_name(&value),
                        rendered.chars().count(),
                    )
                    .into(),
                )
                .await?;
        }
    }

    if !document_paths.is_empty() {
        deps.store
            .add_message(
                AgentType::Worker,
                worker_id,
                Role::Developer,
                format!(
                    "The following document files are available for use: {}",
                    document_paths.join(", ")
                )
                .into(),
            )
            .await?;
    }

    if !spec.tools.is_empty() {
        deps.store
            .add_message(
                AgentType::Worker,
                worker_id,
                Role::Developer,
                format!(
                    "You may use the following function(s):\n\n{}\n\n\
                     When using the function(s) you can assume that they already exist in the \
                     environment; to use one, simply call it with the required parameters. \
                     You must use the function(s) where possible, do not ever try to perform \
                     the same action with other code.",
                    deps.tools.subset_markdown(&spec.tools)
                )
                .into(),
            )
            .await?;
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// One standard-worker attempt: generate an artefact, run the sandbox,
/// validate, then retry or hand over to synthesis.
pub async fn execute_standard_worker(record: TaskRecord, deps: Deps) -> Result<()> {
    let worker_id = record.entity_id.clone();

    match standard_attempt(&worker_id, &deps).await {
        Ok(()) => Ok(()),
        Err(error) => {
            unexpected_failure(&deps, &worker_id).await;
            Err(error)
        }
    }
}

async fn standard_attempt(worker_id: &str, deps: &Deps) -> Result<()> {
    let worker = require_worker(deps, worker_id).await?;
    let attempt = worker.current_attempt + 1;
    deps.store
        .update_worker(
            worker_id,
            UpdateWorkerInput {
                current_attempt: Some(attempt),
                ..Default::default()
            },
        )
        .await?;

    tracing::info!(%worker_id, attempt, max = worker.max_retry, "standard worker attempt");

    let artefact: TaskArtefact = llm::structured(
        &deps.llm,
        worker_request(deps, worker_id).await?,
    )
    .await?;

    if artefact.is_malicious {
        let rejection = "The code is either making changes to the database or creating \
                         executable files - this is considered malicious and not permitted.\n\
                         Rewrite the python code to fix the error.";
        add_worker_message(deps, worker_id, Role::Assistant, rejection).await?;
        return retry_or_fail(
            deps,
            &worker,
            attempt,
            EXECUTE_STANDARD_WORKER,
            "Task failed: malicious code detected after multiple attempts.",
        )
        .await;
    }

    if !artefact.python_code.is_empty() {
        add_worker_message(
            deps,
            worker_id,
            Role::Assistant,
            &format!(
                "The python code to execute:\n```python\n{}\n```",
                artefact.python_code
            ),
        )
        .await?;

        let request = sandbox_request(deps, &worker, &artefact).await?;
        let outcome = deps.sandbox.execute(request).await?;

        if outcome.success {
            add_worker_message(
                deps,
                worker_id,
                Role::Assistant,
                "Below outputs are generated on executing python code.",
            )
            .await?;
            if !outcome.output.is_empty() {
                add_worker_message(deps, worker_id, Role::Assistant, &outcome.output).await?;
            }

            if let Err(shape_error) =
                capture_outputs(deps, &worker, &artefact, &outcome.variables).await?
            {
                add_worker_message(
                    deps,
                    worker_id,
                    Role::Assistant,
                    &format!("{shape_error}\nRewrite the python code to fix the error."),
                )
                .await?;
                return retry_or_fail(
                    deps,
                    &worker,
                    attempt,
                    EXECUTE_STANDARD_WORKER,
                    &shape_error,
                )
                .await;
            }

            if validate_worker_result(deps, &worker).await? {
                return handlers::update_next_and_enqueue(
                    &deps.store,
                    &worker.planner_id,
                    EXECUTE_SYNTHESIS,
                )
                .await;
            }
        } else {
            let error_text = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            let stack_trace = outcome.stack_trace.unwrap_or_default();

            // A missing tool can't be fixed by rewriting code; surface it
            // to the planner immediately.
            let tool_check: ToolMissing = llm::structured(
                &deps.llm,
                CompletionRequest {
                    caller: "worker",
                    model: deps.config.llm.worker_model.clone(),
                    temperature: 0.0,
                    messages: vec![ChatMessage::new(Role::User, format!("Error: {error_text}"))],
                },
            )
            .await?;

            if tool_check.tool_not_available {
                let failure_message = "Task failed: required tool was not provided";
                deps.store
                    .update_worker(
                        &worker.worker_id,
                        UpdateWorkerInput {
                            task_status: Some(WorkerTaskStatus::FailedValidation),
                            task_result: Some(failure_message.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                add_worker_message(
                    deps,
                    worker_id,
                    Role::Assistant,
                    &format!(
                        "{failure_message}\n\n{stack_trace}\n\nThe required tool is not \
                         available, please supply the task with the required tool and try again."
                    ),
                )
                .await?;
                return handlers::update_next_and_enqueue(
                    &deps.store,
                    &worker.planner_id,
                    EXECUTE_SYNTHESIS,
                )
                .await;
            }

            add_worker_message(
                deps,
                worker_id,
                Role::Assistant,
                &format!(
                    "Error executing code: {error_text}\n\n{stack_trace}\n\n\
                     Rewrite the python code to fix the error."
                ),
            )
            .await?;

            if attempt >= REPEAT_CHECK_MIN_ATTEMPTS {
                let repeat_check: RepeatFail = llm::structured(
                    &deps.llm,
                    worker_request(deps, worker_id).await?,
                )
                .await?;

                if repeat_check.repeated_failure {
                    let failure_message = format!(
                        "Error executing code: {error_text}\n\nRepeated failure: {}",
                        repeat_check.failure_summary
                    );
                    deps.store
                        .update_worker(
                            &worker.worker_id,
                            UpdateWorkerInput {
                                task_status: Some(WorkerTaskStatus::FailedValidation),
                                task_result: Some(failure_message),
                                ..Default::default()
                            },
                        )
                        .await?;
                    return handlers::update_next_and_enqueue(
                        &deps.store,
                        &worker.planner_id,
                        EXECUTE_SYNTHESIS,
                    )
                    .await;
                }
            }
        }
    } else {
        // No code needed; the artefact's result is the outcome.
        add_worker_message(deps, worker_id, Role::Assistant, &artefact.result).await?;

        if validate_worker_result(deps, &worker).await? {
            return handlers::update_next_and_enqueue(
                &deps.store,
                &worker.planner_id,
                EXECUTE_SYNTHESIS,
            )
            .await;
        }
    }

    retry_or_fail(
        deps,
        &worker,
        attempt,
        EXECUTE_STANDARD_WORKER,
        "Task failed after multiple tries.",
    )
    .await
}

/// One SQL-worker attempt against the planner's database file.
pub async fn execute_sql_worker(record: TaskRecord, deps: Deps) -> Result<()> {
    let worker_id = record.entity_id.clone();

    match sql_attempt(&worker_id, &deps).await {
        Ok(()) => Ok(()),
        Err(error) => {
            unexpected_failure(&deps, &worker_id).await;
            Err(error)
        }
    }
}

async fn sql_attempt(worker_id: &str, deps: &Deps) -> Result<()> {
    let worker = require_worker(deps, worker_id).await?;
    let attempt = worker.current_attempt + 1;
    deps.store
        .update_worker(
            worker_id,
            UpdateWorkerInput {
                current_attempt: Some(attempt),
                ..Default::default()
            },
        )
        .await?;

    tracing::info!(%worker_id, attempt, max = worker.max_retry, "sql worker attempt");

    let artefact: TaskArtefactSql = llm::structured(
        &deps.llm,
        worker_request(deps, worker_id).await?,
    )
    .await?;

    if artefact.sql_code.is_empty() {
        let error_message = format!(
            "SQL code cannot be generated. {}",
            artefact.reason_code_not_created
        );
        deps.store
            .update_worker(
                worker_id,
                UpdateWorkerInput {
                    task_status: Some(WorkerTaskStatus::FailedValidation),
                    task_result: Some(error_message.clone()),
                    ..Default::default()
                },
            )
            .await?;
        add_worker_message(deps, worker_id, Role::Assistant, &error_message).await?;
        return handlers::update_next_and_enqueue(
            &deps.store,
            &worker.planner_id,
            EXECUTE_SYNTHESIS,
        )
        .await;
    }

    match run_sql(deps, &worker.planner_id, &artefact.sql_code).await {
        Ok(rendered) => {
            add_worker_message(
                deps,
                worker_id,
                Role::Assistant,
                &format!(
                    "The following code was executed:\n\n```sql\n{}\n```\n\n\
                     The output is:\n\n{rendered}",
                    artefact.sql_code
                ),
            )
            .await?;

            if validate_worker_result(deps, &worker).await? {
                return handlers::update_next_and_enqueue(
                    &deps.store,
                    &worker.planner_id,
                    EXECUTE_SYNTHESIS,
                )
                .await;
            }
        }
        Err(error) => {
            add_worker_message(
                deps,
                worker_id,
                Role::Assistant,
                &format!("Error executing SQL code: {error}\n\nRewrite the SQL code to fix the error."),
            )
            .await?;
        }
    }

    retry_or_fail(
        deps,
        &worker,
        attempt,
        EXECUTE_SQL_WORKER,
        "SQL task failed after multiple tries.",
    )
    .await
}

/// Execute a query read-only against the planner's database, bounded by
/// the shared execution timeout.
async fn run_sql(deps: &Deps, planner_id: &str, sql: &str) -> std::result::Result<String, String> {
    let db_path = deps.artefacts.database_path(planner_id);
    if !db_path.exists() {
        return Err("no database file exists for this planner".to_string());
    }

    let pool = tables::open_planner_db_readonly(&db_path)
        .await
        .map_err(|error| error.to_string())?;

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(EXECUTION_TIMEOUT_SECS),
        tables::query_to_markdown(&pool, sql),
    )
    .await;
    pool.close().await;

    match result {
        Ok(Ok(rendered)) => Ok(rendered),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err(format!("query timed out after {EXECUTION_TIMEOUT_SECS}s")),
    }
}

/// Build the sandbox request for one attempt: inputs loaded from the
/// artefact store, tools by name, declared outputs to collect.
async fn sandbox_request(
    deps: &Deps,
    worker: &WorkerRecord,
    artefact: &TaskArtefact,
) -> Result<SandboxRequest> {
    let mut variables = HashMap::new();
    for (key, path) in &worker.input_variable_paths {
        if let Some(value) = deps.artefacts.load_variable(std::path::Path::new(path))? {
            variables.insert(key.clone(), value);
        }
    }

    let mut images = HashMap::new();
    for (key, path) in &worker.input_image_paths {
        if let Some(encoded) = deps.artefacts.load_image(std::path::Path::new(path))? {
            images.insert(key.clone(), encoded);
        }
    }

    Ok(SandboxRequest {
        code: artefact.python_code.clone(),
        variables,
        images,
        tools: worker.tools.clone(),
        output_variables: artefact
            .output_variables
            .iter()
            .map(|output| output.name.clone())
            .collect(),
    })
}

/// Persist declared outputs. Returns `Ok(Err(message))` for a shape
/// problem the LLM should fix by rewriting the code.
async fn capture_outputs(
    deps: &Deps,
    worker: &WorkerRecord,
    artefact: &TaskArtefact,
    produced: &HashMap<String, Value>,
) -> Result<std::result::Result<(), String>> {
    for output in &artefact.output_variables {
        let Some(value) = produced.get(&output.name) else {
            return Ok(Err(format!(
                "Incorrect output: the declared output variable {} was not produced by the code.",
                output.name
            )));
        };

        if output.is_image {
            let images = match image_payloads(&output.name, value) {
                Ok(images) => images,
                Err(message) => return Ok(Err(message)),
            };
            for (name, encoded) in images {
                save_output_image(deps, worker, &name, &encoded).await?;
            }
        } else {
            save_output_variable(deps, worker, &output.name, value).await?;
        }
    }

    Ok(Ok(()))
}

/// Accept an image, a list of images, or a map of images; anything else
/// is a shape error.
fn image_payloads(
    name: &str,
    value: &Value,
) -> std::result::Result<Vec<(String, String)>, String> {
    let shape_error = format!(
        "Incorrect output: if {name} is an image, it must be a PIL.Image object or a \
         list[Image] or dict[str, Image] object, no other choices are allowed."
    );

    if let Some(encoded) = sandbox::image_b64(value) {
        return Ok(vec![(name.to_string(), encoded.to_string())]);
    }

    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                sandbox::image_b64(item)
                    .map(|encoded| (format!("{name}_{index}"), encoded.to_string()))
                    .ok_or_else(|| shape_error.clone())
            })
            .collect(),
        Value::Object(entries) => entries
            .iter()
            .map(|(key, item)| {
                sandbox::image_b64(item)
                    .map(|encoded| (format!("{name}_{key}"), encoded.to_string()))
                    .ok_or_else(|| shape_error.clone())
            })
            .collect(),
        _ => Err(shape_error),
    }
}

async fn save_output_image(
    deps: &Deps,
    worker: &WorkerRecord,
    name: &str,
    encoded: &str,
) -> Result<()> {
    let (path, final_key) = deps.artefacts.save_image(
        &worker.planner_id,
        name,
        &std::collections::HashSet::new(),
        encoded,
        CollisionPolicy::Avoid,
    )?;
    deps.store
        .merge_worker_output_image_path(&worker.worker_id, &final_key, &path.to_string_lossy())
        .await?;

    deps.store
        .add_message(
            AgentType::Worker,
            &worker.worker_id,
            Role::User,
            Content::Multipart(vec![
                Part::Text {
                    text: format!("Image: {final_key}"),
                },
                Part::Image {
                    data: encoded.to_string(),
                },
            ]),
        )
        .await?;

    Ok(())
}

async fn save_output_variable(
    deps: &Deps,
    worker: &WorkerRecord,
    name: &str,
    value: &Value,
) -> Result<()> {
    // Values without a faithful JSON form are only echoed into the log;
    // saving them would break the saved-means-readable contract.
    if let Some(repr) = sandbox::repr_string(value) {
        add_worker_message(
            deps,
            &worker.worker_id,
            Role::Assistant,
            &format!(
                "```python\n{name}\n```\n\nOutput:\n```\n{repr}\n```\n\n\
                 Note: the output is not serialisable and will not be included as an output \
                 variable."
            ),
        )
        .await?;
        return Ok(());
    }

    let (path, final_key) =
        deps.artefacts
            .save_variable(&worker.planner_id, name, value, CollisionPolicy::Avoid)?;
    deps.store
        .merge_worker_output_variable_path(&worker.worker_id, &final_key, &path.to_string_lossy())
        .await?;

    let rendered = value.to_string();
    let preview: String = rendered.chars().take(VARIABLE_PREVIEW_CHARS).collect();
    add_worker_message(
        deps,
        &worker.worker_id,
        Role::Assistant,
        &format!("```python\n{final_key}\n```\n\nOutput:\n```\n{preview}\n```"),
    )
    .await?;

    Ok(())
}

/// Check the attempt against the acceptance criteria. On success the
/// worker is completed with the rendered result; on failure the
/// diagnostic lands in the log and false comes back.
async fn validate_worker_result(deps: &Deps, worker: &WorkerRecord) -> Result<bool> {
    add_worker_message(
        deps,
        &worker.worker_id,
        Role::Developer,
        &format!(
            "Determine if the task is successfully completed based on the acceptance \
             criteria:\n{}",
            worker.acceptance_criteria.join("\n")
        ),
    )
    .await?;

    let validation: TaskValidation = llm::structured(
        &deps.llm,
        worker_request(deps, &worker.worker_id).await?,
    )
    .await?;

    if validation.task_completed {
        deps.store
            .update_worker(
                &worker.worker_id,
                UpdateWorkerInput {
                    task_status: Some(WorkerTaskStatus::Completed),
                    task_result: Some(validation.validated_result.render()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(worker_id = %worker.worker_id, "worker task validated as complete");
        return Ok(true);
    }

    let task_result = format!(
        "{}\n\nFailed criteria: {}",
        validation.validated_result.result, validation.failed_criteria
    );
    deps.store
        .update_worker(
            &worker.worker_id,
            UpdateWorkerInput {
                task_result: Some(task_result.clone()),
                ..Default::default()
            },
        )
        .await?;
    add_worker_message(deps, &worker.worker_id, Role::Assistant, &task_result).await?;

    Ok(false)
}

/// Retry with the same handler while budget remains, otherwise mark the
/// worker failed-validation and hand over to synthesis.
async fn retry_or_fail(
    deps: &Deps,
    worker: &WorkerRecord,
    attempt: u32,
    handler: &'static str,
    fail_result: &str,
) -> Result<()> {
    if attempt < worker.max_retry {
        tracing::info!(
            worker_id = %worker.worker_id,
            attempt,
            max = worker.max_retry,
            "attempt failed, queueing retry"
        );
        return handlers::enqueue_worker_handler(&deps.store, &worker.worker_id, handler).await;
    }

    tracing::info!(worker_id = %worker.worker_id, "retry budget exhausted");
    deps.store
        .update_worker(
            &worker.worker_id,
            UpdateWorkerInput {
                task_status: Some(WorkerTaskStatus::FailedValidation),
                task_result: Some(fail_result.to_string()),
                ..Default::default()
            },
        )
        .await?;

    handlers::update_next_and_enqueue(&deps.store, &worker.planner_id, EXECUTE_SYNTHESIS).await
}

/// Unexpected-error path: mark the worker failed and still give the
/// planner its synthesis turn before the error propagates.
async fn unexpected_failure(deps: &Deps, worker_id: &str) {
    mark_worker_failed(deps, worker_id, "Worker execution failed unexpectedly").await;

    match deps.store.get_worker(worker_id).await {
        Ok(Some(worker)) => {
            if let Err(error) =
                handlers::update_next_and_enqueue(&deps.store, &worker.planner_id, EXECUTE_SYNTHESIS)
                    .await
            {
                tracing::error!(%worker_id, %error, "failed to queue synthesis after worker error");
            }
        }
        Ok(None) => {}
        Err(error) => {
            tracing::error!(%worker_id, %error, "failed to load worker after unexpected error");
        }
    }
}

async fn mark_worker_failed(deps: &Deps, worker_id: &str, reason: &str) {
    let update = UpdateWorkerInput {
        task_status: Some(WorkerTaskStatus::Failed),
        task_result: Some(reason.to_string()),
        ..Default::default()
    };
    if let Err(error) = deps.store.update_worker(worker_id, update).await {
        tracing::debug!(%worker_id, %error, "could not mark worker as failed");
    }
}

async fn require_worker(deps: &Deps, worker_id: &str) -> Result<WorkerRecord> {
    deps.store
        .get_worker(worker_id)
        .await?
        .ok_or_else(|| {
            AgentError::WorkerNotFound {
                id: worker_id.to_string(),
            }
            .into()
        })
}

async fn worker_request(deps: &Deps, worker_id: &str) -> Result<CompletionRequest> {
    let log = deps.store.get_messages(AgentType::Worker, worker_id).await?;
    Ok(CompletionRequest {
        caller: "worker",
        model: deps.config.llm.worker_model.clone(),
        temperature: 0.0,
        messages: llm::from_log(&log),
    })
}

async fn add_worker_message(
    deps: &Deps,
    worker_id: &str,
    role: Role,
    text: &str,
) -> Result<()> {
    deps.store
        .add_message(AgentType::Worker, worker_id, role, text.into())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn worker_kind_picks_the_execute_handler() {
        assert_eq!(worker_kind_handler(true), EXECUTE_SQL_WORKER);
        assert_eq!(worker_kind_handler(false), EXECUTE_STANDARD_WORKER);
    }

    #[test]
    fn image_payloads_accept_the_three_shapes() {
        let single = json!({"__image_b64__": "aaa"});
        assert_eq!(
            image_payloads("chart", &single).expect("single"),
            vec![("chart".to_string(), "aaa".to_string())]
        );

        let list = json!([{"__image_b64__": "aaa"}, {"__image_b64__": "bbb"}]);
        let names: Vec<String> = image_payloads("chart", &list)
            .expect("list")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["chart_0", "chart_1"]);

        let map = json!({"north": {"__image_b64__": "aaa"}});
        let names: Vec<String> = image_payloads("chart", &map)
            .expect("map")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["chart_north"]);
    }

    #[test]
    fn image_payloads_reject_other_shapes() {
        assert!(image_payloads("chart", &json!(42)).is_err());
        assert!(image_payloads("chart", &json!([{"__image_b64__": "a"}, 7])).is_err());
        assert!(image_payloads("chart", &json!({"k": "not an image"})).is_err());
    }
}
