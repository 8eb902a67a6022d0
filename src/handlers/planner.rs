//! Planner state-machine handlers: initialise, emit the next task, and
//! synthesise worker results back into the plan.

use crate::artefacts::CollisionPolicy;
use crate::error::{AgentError, Result};
use crate::files::{FileKind, InputFile};
use crate::handlers::{
    self, EXECUTE_SYNTHESIS, EXECUTE_TASK_CREATION,
};
use crate::llm::{self, ChatMessage, CompletionRequest, LlmClientDyn as _};
use crate::plan::{ExecutionPlan, InitialExecutionPlan};
use crate::schemas::{CurrentTask, TaskSpec};
use crate::store::{
    CreatePlannerInput, NextHandler, PlannerRecord, PlannerStatus, Role, TaskRecord,
    UpdatePlannerInput, UpdateWorkerInput, WorkerRecord, WorkerTaskStatus,
};
use crate::tables;
use crate::{AgentType, Deps};
use anyhow::Context as _;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const PLANNER_SYSTEM_PROMPT: &str =
    "You are an expert planner. Your objective is to break down the user's instruction into a \
     list of tasks that can be individually executed.";

/// Payload of an `execute_initial_planning` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialPlanningPayload {
    pub user_question: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub planner_name: Option<String>,
    pub message_id: i64,
    pub router_id: String,
}

/// Create the planner, ingest its files, and produce the initial
/// execution plan.
pub async fn execute_initial_planning(record: TaskRecord, deps: Deps) -> Result<()> {
    let planner_id = record.entity_id.clone();

    // Resume: the planner already exists, skip straight to task creation.
    if deps.store.get_planner(&planner_id).await?.is_some() {
        tracing::info!(%planner_id, "planner already exists, resuming at task creation");
        return handlers::update_next_and_enqueue(&deps.store, &planner_id, EXECUTE_TASK_CREATION)
            .await;
    }

    let payload: InitialPlanningPayload = serde_json::from_value(
        record
            .payload
            .clone()
            .context("initial planning task carried no payload")?,
    )
    .context("invalid initial planning payload")?;

    match initial_planning(&planner_id, payload, &deps).await {
        Ok(()) => Ok(()),
        Err(error) => {
            mark_planner_failed(&deps, &planner_id).await;
            Err(error)
        }
    }
}

async fn initial_planning(
    planner_id: &str,
    payload: InitialPlanningPayload,
    deps: &Deps,
) -> Result<()> {
    let model = deps.config.llm.planner_model.clone();
    let temperature = 0.0;

    deps.store
        .link_message_planner(&payload.router_id, payload.message_id, planner_id, "initiated")
        .await?;

    deps.store
        .create_planner(CreatePlannerInput {
            planner_id: planner_id.to_string(),
            planner_name: payload.planner_name.clone(),
            user_question: payload.user_question.clone(),
            instruction: payload.instruction.clone(),
            model: model.clone(),
            temperature,
            failed_task_limit: deps.config.limits.failed_task_limit,
            status: PlannerStatus::Planning,
            next_handler: NextHandler::handler(EXECUTE_TASK_CREATION),
        })
        .await?;

    deps.store
        .add_message(
            AgentType::Planner,
            planner_id,
            Role::System,
            PLANNER_SYSTEM_PROMPT.into(),
        )
        .await?;

    ingest_files(planner_id, &payload.files, deps).await?;

    let plan_prompt = format!(
        "**Available tools for execution:**\n{}\n\n\
         **Instructions:**\n{}\n\n\
         Please create a detailed execution plan with an overall objective and a list of \
         specific tasks. The objective should describe what the tasks are aiming to achieve. \
         Each task should be specific enough to be executed independently. \
         The instructions will no longer be visible when creating tasks later on, so make sure \
         that the tasks are detailed enough. If required, create placeholder tasks that align \
         to requirements in the instructions so they don't get lost even if you can't determine \
         the precise downstream tasks yet.",
        deps.tools.catalogue_markdown(),
        payload.instruction,
    );

    let log = deps
        .store
        .get_messages(AgentType::Planner, planner_id)
        .await?;
    let mut messages = llm::from_log(&log);
    messages.push(ChatMessage::new(Role::User, plan_prompt));

    let initial_plan: InitialExecutionPlan = llm::structured(
        &deps.llm,
        CompletionRequest {
            caller: "planner",
            model: model.clone(),
            temperature,
            messages,
        },
    )
    .await?;

    let plan = ExecutionPlan::from_initial(initial_plan);
    deps.artefacts.save_execution_plan(planner_id, &plan)?;
    deps.store
        .update_planner(
            planner_id,
            UpdatePlannerInput {
                status: Some(PlannerStatus::Executing),
                execution_plan: Some(plan.to_markdown()),
                ..Default::default()
            },
        )
        .await?;

    tracing::info!(%planner_id, todos = plan.todos.len(), "initial planning complete");
    handlers::update_next_and_enqueue(&deps.store, planner_id, EXECUTE_TASK_CREATION).await
}

/// Ingest input files: images become artefacts, CSVs become tables in
/// the per-planner database, documents pass through as paths.
async fn ingest_files(planner_id: &str, files: &[InputFile], deps: &Deps) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }

    let mut tables_meta = Vec::new();
    let mut document_paths = Vec::new();
    let mut image_names: HashSet<String> = HashSet::new();
    let mut planner_db = None;

    for file in files {
        match &file.kind {
            FileKind::Image { subtypes } => {
                let bytes = std::fs::read(&file.path).with_context(|| {
                    format!("failed to read image file {}", file.path.display())
                })?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

                let (path, image_name) = deps.artefacts.save_image(
                    planner_id,
                    &file.stem(),
                    &image_names,
                    &encoded,
                    CollisionPolicy::Avoid,
                )?;
                image_names.insert(image_name.clone());
                deps.store
                    .merge_planner_image_path(planner_id, &image_name, &path.to_string_lossy())
                    .await?;

                let mut message = format!(
                    "Image file `{}` is available under the image key `{image_name}`.",
                    file.path.display()
                );
                if !subtypes.is_empty() {
                    let elements: Vec<&str> =
                        subtypes.iter().map(|subtype| subtype.as_str()).collect();
                    message.push_str(&format!(
                        " The image contains the following element types: {}.",
                        elements.join(", ")
                    ));
                }

                deps.store
                    .add_message(AgentType::Planner, planner_id, Role::User, message.into())
                    .await?;
            }
            FileKind::Csv => {
                if planner_db.is_none() {
                    let db_path = deps.artefacts.database_path(planner_id);
                    std::fs::create_dir_all(deps.artefacts.planner_dir(planner_id))
                        .context("failed to create planner dir")?;
                    planner_db = Some(tables::open_planner_db(&db_path).await?);
                }
                let Some(pool) = planner_db.as_ref() else {
                    continue;
                };

                let table_name = tables::clean_table_name(pool, &file.stem()).await;
                let meta = tables::ingest_csv(pool, &file.path, &table_name).await?;

                deps.store
                    .add_message(
                        AgentType::Planner,
                        planner_id,
                        Role::User,
                        format!(
                            "Data file `{}` converted to table `{table_name}` in database. \
                             Below is table metadata:\n\n{}",
                            file.path.display(),
                            serde_json::to_string_pretty(&meta)
                                .context("failed to serialise table metadata")?
                        )
                        .into(),
                    )
                    .await?;

                tables_meta.push(meta);
            }
            FileKind::Pdf | FileKind::Text { .. } => {
                document_paths.push(file.path.to_string_lossy().to_string());
            }
        }
    }

    if let Some(pool) = planner_db {
        pool.close().await;
    }

    deps.store
        .set_planner_context(planner_id, &tables_meta, &document_paths)
        .await?;

    Ok(())
}

/// Turn the plan's next todo into a concrete worker task, or hand over
/// to synthesis when no open todo remains.
pub async fn execute_task_creation(record: TaskRecord, deps: Deps) -> Result<()> {
    let planner_id = record.entity_id.clone();

    match task_creation(&planner_id, &deps).await {
        Ok(()) => Ok(()),
        Err(error) => {
            mark_planner_failed(&deps, &planner_id).await;
            Err(error)
        }
    }
}

async fn task_creation(planner_id: &str, deps: &Deps) -> Result<()> {
    let planner = require_planner(deps, planner_id).await?;

    let plan = deps
        .artefacts
        .load_execution_plan(planner_id)?
        .with_context(|| format!("no execution plan on disk for planner {planner_id}"))?;

    if !plan.has_open_todos() {
        tracing::info!(%planner_id, "no open todos, moving to synthesis");
        return handlers::update_next_and_enqueue(&deps.store, planner_id, EXECUTE_SYNTHESIS).await;
    }

    let next_todo = plan
        .next_action_todo()
        .context("plan has open todos but none is marked as the next action")?
        .clone();

    let log = deps
        .store
        .get_messages(AgentType::Planner, planner_id)
        .await?;
    let mut messages = llm::from_log(&log);

    messages.push(ChatMessage::new(
        Role::Developer,
        format!(
            "You can use the following tools:\n\n{}",
            deps.tools.catalogue_markdown()
        ),
    ));
    if !planner.image_paths.is_empty() {
        let mut keys: Vec<&String> = planner.image_paths.keys().collect();
        keys.sort();
        messages.push(ChatMessage::new(
            Role::Developer,
            format!("The following image keys are available for use: {keys:?}"),
        ));
    }
    if !planner.variable_paths.is_empty() {
        let mut keys: Vec<&String> = planner.variable_paths.keys().collect();
        keys.sort();
        messages.push(ChatMessage::new(
            Role::Developer,
            format!("The following variable keys are available for use: {keys:?}"),
        ));
    }
    messages.push(ChatMessage::new(
        Role::Developer,
        format!("Today's date is {}.", chrono::Utc::now().format("%d %b %Y")),
    ));
    messages.push(ChatMessage::new(
        Role::Developer,
        format!(
            "For context, your complete execution plan is:\n{}\n\n\
             The next todo item to be converted to a task is: {}",
            planner.execution_plan.as_deref().unwrap_or_default(),
            next_todo.description,
        ),
    ));

    let mut spec: TaskSpec = llm::structured(
        &deps.llm,
        CompletionRequest {
            caller: "planner",
            model: planner_model(&planner, deps),
            temperature: planner.temperature.unwrap_or(0.0),
            messages,
        },
    )
    .await?;

    // A task can only query structured data when tables actually exist.
    if planner.tables.is_empty() {
        spec.querying_structured_data = false;
    }

    let task_id = crate::new_id();
    deps.artefacts.save_current_task(
        planner_id,
        &CurrentTask {
            task_id: task_id.clone(),
            spec,
        },
    )?;

    // Park the planner; the worker chain re-enters through synthesis.
    deps.store
        .update_planner(
            planner_id,
            UpdatePlannerInput {
                next_handler: Some(NextHandler::waiting_for_worker()),
                ..Default::default()
            },
        )
        .await?;

    handlers::queue_worker_initialisation(&deps.store, &task_id, planner_id).await?;
    tracing::info!(%planner_id, %task_id, "worker task created and queued");
    Ok(())
}

/// Fold finished workers back into the plan; loop, retry, or finalise.
pub async fn execute_synthesis(record: TaskRecord, deps: Deps) -> Result<()> {
    let planner_id = record.entity_id.clone();

    match synthesis(&planner_id, &deps).await {
        Ok(()) => Ok(()),
        Err(error) => {
            mark_planner_failed(&deps, &planner_id).await;
            Err(error)
        }
    }
}

async fn synthesis(planner_id: &str, deps: &Deps) -> Result<()> {
    let planner = require_planner(deps, planner_id).await?;

    let workers = deps.store.workers_for_planner(planner_id).await?;
    let finished: Vec<WorkerRecord> = workers
        .into_iter()
        .filter(|worker| {
            matches!(
                worker.task_status,
                WorkerTaskStatus::Completed | WorkerTaskStatus::FailedValidation
            )
        })
        .collect();

    if finished.is_empty() {
        // The worker is not done yet; loop back through task creation.
        tracing::debug!(%planner_id, "no finished workers to synthesise");
        return handlers::update_next_and_enqueue(&deps.store, planner_id, EXECUTE_TASK_CREATION)
            .await;
    }

    for worker in finished {
        record_worker_summary(planner_id, &worker, deps).await?;

        let mut plan = deps
            .artefacts
            .load_execution_plan(planner_id)?
            .with_context(|| format!("no execution plan on disk for planner {planner_id}"))?;

        if worker.task_status == WorkerTaskStatus::Completed {
            plan.complete_next_action();
        } else {
            tracing::info!(
                worker_id = %worker.worker_id,
                "worker failed validation, todo stays open for retry"
            );
        }

        // A planner that has burned its failure budget answers with what
        // it has rather than looping forever.
        let failed_count = deps.store.count_failed_tasks(planner_id).await?;
        if failed_count >= planner.failed_task_limit {
            tracing::warn!(%planner_id, failed_count, "failed task limit reached, finalising");
            deps.artefacts.save_execution_plan(planner_id, &plan)?;
            finalise_planner(planner_id, &planner, &plan, &worker, deps, true).await?;
            return Ok(());
        }

        let merged = revise_plan(planner_id, &planner, &plan, &worker, deps).await?;

        if !merged.has_open_todos() {
            deps.artefacts.save_execution_plan(planner_id, &merged)?;
            finalise_planner(planner_id, &planner, &merged, &worker, deps, false).await?;
            return Ok(());
        }

        if worker.task_status == WorkerTaskStatus::Completed {
            merge_worker_outputs(planner_id, &worker, deps).await?;
        }

        deps.store
            .update_worker(
                &worker.worker_id,
                UpdateWorkerInput {
                    task_status: Some(WorkerTaskStatus::Recorded),
                    ..Default::default()
                },
            )
            .await?;

        deps.artefacts.save_execution_plan(planner_id, &merged)?;
        deps.store
            .update_planner(
                planner_id,
                UpdatePlannerInput {
                    execution_plan: Some(merged.to_markdown()),
                    ..Default::default()
                },
            )
            .await?;
    }

    handlers::update_next_and_enqueue(&deps.store, planner_id, EXECUTE_TASK_CREATION).await
}

/// Append a condensed transcript of the worker's assistant messages to
/// the planner's log.
async fn record_worker_summary(
    planner_id: &str,
    worker: &WorkerRecord,
    deps: &Deps,
) -> Result<()> {
    let worker_log = deps
        .store
        .get_messages(AgentType::Worker, &worker.worker_id)
        .await?;

    let combined = worker_log
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .map(|message| message.content.to_text())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    deps.store
        .add_message(
            AgentType::Planner,
            planner_id,
            Role::Assistant,
            format!(
                "# Responses from worker\n\n\
                 **Task ID**: {}\n\n\
                 **Task Description**: {}\n\n\
                 **Task Status**: {}\n\n\
                 **Worker Responses**:\n\n{combined}",
                worker.worker_id, worker.task_description, worker.task_status,
            )
            .into(),
        )
        .await?;

    Ok(())
}

/// Ask the LLM to revise the open todos given the worker's outcome, and
/// merge the revision back into the full plan.
async fn revise_plan(
    planner_id: &str,
    planner: &PlannerRecord,
    plan: &ExecutionPlan,
    worker: &WorkerRecord,
    deps: &Deps,
) -> Result<ExecutionPlan> {
    let log = deps
        .store
        .get_messages(AgentType::Planner, planner_id)
        .await?;
    let mut messages = llm::from_log(&log);

    messages.push(ChatMessage::new(
        Role::Developer,
        format!(
            "**Current open tasks from execution plan:**\n\n{}",
            serde_json::to_string_pretty(&plan.open_view())
                .context("failed to serialise open todos")?
        ),
    ));
    messages.push(ChatMessage::new(
        Role::Developer,
        format!(
            "Based on the completed task execution details above for task `{}`, please update \
             the execution plan. Instructions for reference:\n\n{}\n\n\
             Follow these rules:\n\
             1. Update existing task descriptions using the updated_description field if needed\n\
             2. Add new tasks if required, marking them with '(new)' in the description field\n\
             3. Leave next_action as false; separate logic determines the next action\n\
             4. Mark unnecessary tasks as obsolete\n\
             Return the updated plan with open tasks only.",
            worker.task_description, planner.instruction,
        ),
    ));

    let revised: ExecutionPlan = llm::structured(
        &deps.llm,
        CompletionRequest {
            caller: "planner",
            model: planner_model(planner, deps),
            temperature: planner.temperature.unwrap_or(0.0),
            messages,
        },
    )
    .await?;

    Ok(plan.merge_revision(revised))
}

/// Generate the final user answer, complete the planner, and release its
/// artefacts.
async fn finalise_planner(
    planner_id: &str,
    planner: &PlannerRecord,
    plan: &ExecutionPlan,
    worker: &WorkerRecord,
    deps: &Deps,
    acknowledge_failures: bool,
) -> Result<()> {
    let log = deps
        .store
        .get_messages(AgentType::Planner, planner_id)
        .await?;
    // Skip the system message; the planner answers from its working log.
    let mut messages = llm::from_log(&log[1.min(log.len())..]);

    let mut prompt = String::from(
        "Using the above information only without creating any information, either copy or \
         create the response/answer to the user's original question/request and format the \
         result in markdown.\n\n\
         Return only the markdown answer and nothing else, do not use the user's question as a \
         title. Do not wrap the response in a ```markdown ... ``` block. \
         Aggressively use inline citations such that the citing references (if provided) are \
         used individually whenever possible as opposed to making multiple citations at the \
         end. Remember the user will only see the next response with zero visibility over the \
         message history, so make sure the finalised response is repeated in full here.",
    );
    if acknowledge_failures {
        prompt.push_str(
            "\n\nSome tasks failed repeatedly and the failure budget is exhausted. You must \
             explicitly acknowledge in the answer that parts of the request could not be \
             completed, and answer with the best information available.",
        );
    }
    messages.push(ChatMessage::new(Role::Developer, prompt));

    let response = deps
        .llm
        .complete(CompletionRequest {
            caller: "planner",
            model: planner_model(planner, deps),
            temperature: planner.temperature.unwrap_or(0.0),
            messages,
        })
        .await?;
    let user_response = response.trim().to_string();

    deps.store
        .update_planner(
            planner_id,
            UpdatePlannerInput {
                status: Some(PlannerStatus::Completed),
                next_handler: Some(NextHandler::completed()),
                execution_plan: Some(plan.to_markdown()),
                user_response: Some(user_response),
            },
        )
        .await?;

    deps.store
        .update_worker(
            &worker.worker_id,
            UpdateWorkerInput {
                task_status: Some(WorkerTaskStatus::Recorded),
                ..Default::default()
            },
        )
        .await?;

    deps.artefacts.cleanup(planner_id)?;
    tracing::info!(%planner_id, "planner completed");
    Ok(())
}

/// Copy the worker's output artefacts into the planner's key space,
/// suffixing keys that clash.
async fn merge_worker_outputs(planner_id: &str, worker: &WorkerRecord, deps: &Deps) -> Result<()> {
    for (key, path) in &worker.output_variable_paths {
        let Some(value) = deps.artefacts.load_variable(std::path::Path::new(path))? else {
            tracing::warn!(%key, %path, "worker output variable missing on disk");
            continue;
        };
        let (new_path, final_key) =
            deps.artefacts
                .save_variable(planner_id, key, &value, CollisionPolicy::Avoid)?;
        deps.store
            .merge_planner_variable_path(planner_id, &final_key, &new_path.to_string_lossy())
            .await?;
    }

    let planner = require_planner(deps, planner_id).await?;
    let mut existing_names: HashSet<String> = planner.image_paths.keys().cloned().collect();

    for (key, path) in &worker.output_image_paths {
        let Some(encoded) = deps.artefacts.load_image(std::path::Path::new(path))? else {
            tracing::warn!(%key, %path, "worker output image missing on disk");
            continue;
        };
        let (new_path, final_key) = deps.artefacts.save_image(
            planner_id,
            key,
            &existing_names,
            &encoded,
            CollisionPolicy::Avoid,
        )?;
        existing_names.insert(final_key.clone());
        deps.store
            .merge_planner_image_path(planner_id, &final_key, &new_path.to_string_lossy())
            .await?;
    }

    Ok(())
}

async fn require_planner(deps: &Deps, planner_id: &str) -> Result<PlannerRecord> {
    deps.store
        .get_planner(planner_id)
        .await?
        .ok_or_else(|| {
            AgentError::PlannerNotFound {
                id: planner_id.to_string(),
            }
            .into()
        })
}

fn planner_model(planner: &PlannerRecord, deps: &Deps) -> String {
    planner
        .model
        .clone()
        .unwrap_or_else(|| deps.config.llm.planner_model.clone())
}

async fn mark_planner_failed(deps: &Deps, planner_id: &str) {
    let update = UpdatePlannerInput {
        status: Some(PlannerStatus::Failed),
        ..Default::default()
    };
    if let Err(error) = deps.store.update_planner(planner_id, update).await {
        tracing::error!(%planner_id, %error, "failed to mark planner as failed");
    }
}
