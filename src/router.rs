//! Router: the thin session coordinator in front of the agent stack.
//!
//! It ingests user messages, answers simple chat directly, and for
//! complex turns classifies input files, composes handling instructions,
//! and enqueues the initial planning task. Plan completions come back
//! through the completion pump, which relays the planner's final answer
//! into the router's log and to the client.

use crate::error::Result;
use crate::files::{self, ClassifiedFiles, FileKind, InputFile};
use crate::handlers::planner::InitialPlanningPayload;
use crate::handlers::EXECUTE_INITIAL_PLANNING;
use crate::llm::{self, ChatMessage, CompletionRequest, LlmClientDyn as _};
use crate::schemas::{FileGrouping, ImageBreakdown, RequireAgent};
use crate::store::{Content, Part, PlannerStatus, Role, RouterStatus};
use crate::{AgentType, Deps, RouterId};
use anyhow::Context as _;
use base64::Engine as _;
use tokio::sync::watch;

const ROUTER_SYSTEM_PROMPT: &str =
    "You are a conversational assistant. For simple questions, answer directly from the \
     conversation. Complex requests are delegated to a planning agent; your job is only to \
     converse and to recognise when delegation is needed.";

/// The placeholder assistant message whose id links the planner run.
const KICKOFF_MESSAGE: &str = "Agents assemble!";

/// A session front-end bound to one router id.
pub struct RouterAgent {
    pub id: RouterId,
    deps: Deps,
}

impl RouterAgent {
    pub fn new(id: impl Into<RouterId>, deps: Deps) -> Self {
        Self { id: id.into(), deps }
    }

    /// First turn of a session: create the router row, seed the system
    /// message, then handle the message like any other turn.
    pub async fn activate(&self, user_message: &str, files: Vec<String>) -> Result<()> {
        let title: String = user_message.chars().take(30).collect();
        let preview = if user_message.chars().count() > 40 {
            format!("{}...", user_message.chars().take(37).collect::<String>())
        } else {
            user_message.to_string()
        };

        self.deps
            .store
            .create_router(
                &self.id,
                RouterStatus::Active,
                &self.deps.config.llm.router_model,
                0.0,
                &title,
                &preview,
            )
            .await?;

        self.deps
            .store
            .add_message(
                AgentType::Router,
                &self.id,
                Role::System,
                ROUTER_SYSTEM_PROMPT.into(),
            )
            .await?;

        self.handle(user_message, files).await
    }

    /// Handle one user turn.
    pub async fn handle(&self, user_message: &str, files: Vec<String>) -> Result<()> {
        self.deps.notifier.input_lock(&self.id).await;
        self.deps
            .store
            .update_router_status(&self.id, RouterStatus::Processing)
            .await?;

        self.deps
            .store
            .add_message(AgentType::Router, &self.id, Role::User, user_message.into())
            .await?;

        let outcome = self.dispatch_turn(files).await;

        match outcome {
            Ok(planner_enqueued) => {
                // With a planner in flight, the unlock happens when the
                // plan completes.
                if !planner_enqueued {
                    self.finish_turn().await?;
                }
                Ok(())
            }
            Err(error) => {
                tracing::error!(router_id = %self.id, %error, "turn failed");
                self.deps
                    .notifier
                    .error(&self.id, format!("Error: {error:#}"))
                    .await;
                self.finish_turn().await?;
                Err(error)
            }
        }
    }

    async fn finish_turn(&self) -> Result<()> {
        self.deps.notifier.input_unlock(&self.id).await;
        self.deps
            .store
            .update_router_status(&self.id, RouterStatus::Active)
            .await
    }

    /// Pick the simple-chat or complex path. Returns whether a planner
    /// run was enqueued.
    async fn dispatch_turn(&self, files: Vec<String>) -> Result<bool> {
        self.deps.notifier.status(&self.id, "Thinking").await;

        if !files.is_empty() {
            return self.handle_complex(files, None).await;
        }

        let requirements = self.assess_agent_requirements().await?;
        if requirements.agent_required() {
            tracing::info!(router_id = %self.id, "turn classified as agent-required");
            return self.handle_complex(Vec::new(), Some(requirements)).await;
        }

        let response = self.simple_chat().await?;
        self.deps
            .store
            .add_message(
                AgentType::Router,
                &self.id,
                Role::Assistant,
                response.clone().into(),
            )
            .await?;
        self.deps.notifier.response(&self.id, response, None).await;
        Ok(false)
    }

    async fn simple_chat(&self) -> Result<String> {
        let log = self
            .deps
            .store
            .get_messages(AgentType::Router, &self.id)
            .await?;

        self.deps
            .llm
            .complete(CompletionRequest {
                caller: "router",
                model: self.model(),
                temperature: 0.0,
                messages: llm::from_log(&log),
            })
            .await
    }

    async fn assess_agent_requirements(&self) -> Result<RequireAgent> {
        let log = self
            .deps
            .store
            .get_messages(AgentType::Router, &self.id)
            .await?;
        let mut messages = llm::from_log(&log);
        messages.push(ChatMessage::new(
            Role::User,
            "Based on the conversation, are there any indicators that the user request \
             requires agent assistance?",
        ));

        llm::structured(
            &self.deps.llm,
            CompletionRequest {
                caller: "router",
                model: self.model(),
                temperature: 0.0,
                messages,
            },
        )
        .await
    }

    /// Complex path: resolve the context-rich question, group the files,
    /// and enqueue one planner run per group.
    async fn handle_complex(
        &self,
        files: Vec<String>,
        requirements: Option<RequireAgent>,
    ) -> Result<bool> {
        let mut instructions: Vec<String> = Vec::new();

        let user_question = match &requirements {
            Some(requirements) => {
                if requirements.web_search_required {
                    instructions.push(files::web_search_instruction());
                }
                requirements.context_rich_agent_request.clone()
            }
            None => self.summarise_request().await?,
        };

        if files.is_empty() {
            let enqueued = self
                .invoke_single(Vec::new(), &user_question, &instructions)
                .await?;
            return Ok(enqueued);
        }

        let file_groups = self.determine_file_groups(&user_question, &files).await?;
        let total = file_groups.len();
        let mut any_enqueued = false;

        for (index, group) in file_groups.into_iter().enumerate() {
            if total > 1 {
                self.deps
                    .notifier
                    .status(
                        &self.id,
                        format!(
                            "Processing file group {}/{total}: {}",
                            index + 1,
                            group.join(", ")
                        ),
                    )
                    .await;
            }

            if self.invoke_single(group, &user_question, &instructions).await? {
                any_enqueued = true;
            }
        }

        Ok(any_enqueued)
    }

    /// Summarise the conversation into a context-rich request for the
    /// downstream agent (files-only path).
    async fn summarise_request(&self) -> Result<String> {
        let log = self
            .deps
            .store
            .get_messages(AgentType::Router, &self.id)
            .await?;

        let mut messages = vec![ChatMessage::new(
            Role::System,
            "Your sole job is to summarise the conversation into a context-rich request for \
             the downstream agent. Use the latest message from the user as the basis and \
             enrich the context directly associated with the question using the conversation \
             history. Return only the context-rich request for the agent, do not include any \
             other information such as prefixes or suffixes, do not ask for more information \
             from the user.",
        )];
        messages.extend(
            llm::from_log(&log)
                .into_iter()
                .filter(|message| message.role != Role::System),
        );

        self.deps
            .llm
            .complete(CompletionRequest {
                caller: "router",
                model: self.model(),
                temperature: 0.0,
                messages,
            })
            .await
    }

    /// One group per planner run. A single group with all files by
    /// default; the LLM may split when the user wants per-file answers.
    async fn determine_file_groups(
        &self,
        user_question: &str,
        files: &[String],
    ) -> Result<Vec<Vec<String>>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        if files.len() == 1 {
            return Ok(vec![files.to_vec()]);
        }

        let grouping: FileGrouping = llm::structured(
            &self.deps.llm,
            CompletionRequest {
                caller: "router",
                model: self.model(),
                temperature: 0.0,
                messages: vec![
                    ChatMessage::new(
                        Role::User,
                        format!(
                            "User question/request:\n\n{user_question}\n\nFiles: {}",
                            files.join(", ")
                        ),
                    ),
                    ChatMessage::new(
                        Role::Developer,
                        "Restructure the files into a list of groups of files that need to be \
                         processed one by one. By default, in case of doubt, there should only \
                         be one group with all the files in it. If the user's question \
                         indicates that they want to process files independently from each \
                         other, looking for one response per file, then each group should \
                         contain only one file unless there is evidence to suggest otherwise. \
                         If the user specifically instructs to repeatedly use a particular \
                         file when processing others one by one, the groups should reflect \
                         that and have the file repeat across groups.",
                    ),
                ],
            },
        )
        .await?;

        if grouping.file_groups.is_empty() {
            Ok(vec![files.to_vec()])
        } else {
            Ok(grouping.file_groups)
        }
    }

    /// Classify one group's files, break down its images, and enqueue
    /// its planner run. Returns false when nothing could be processed.
    async fn invoke_single(
        &self,
        files: Vec<String>,
        user_question: &str,
        base_instructions: &[String],
    ) -> Result<bool> {
        let ClassifiedFiles {
            files: processed,
            mut errors,
        } = files::classify_files(&files);
        let processed = self.breakdown_images(processed, &mut errors).await?;

        if !files.is_empty() && processed.is_empty() {
            let message = format!(
                "Unable to process any files. Errors encountered:\n{}",
                errors
                    .iter()
                    .map(|error| format!("- {error}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            self.deps
                .store
                .add_message(AgentType::Router, &self.id, Role::Assistant, message.clone().into())
                .await?;
            self.deps.notifier.response(&self.id, message, None).await;
            return Ok(false);
        }

        let mut all_instructions = base_instructions.to_vec();
        all_instructions.extend(files::instructions_for_files(&processed));

        let kickoff_message_id = self
            .deps
            .store
            .add_message(
                AgentType::Router,
                &self.id,
                Role::Assistant,
                KICKOFF_MESSAGE.into(),
            )
            .await?;
        self.deps
            .notifier
            .response(&self.id, KICKOFF_MESSAGE, Some(kickoff_message_id))
            .await;

        let planner_id = crate::new_id();
        let payload = InitialPlanningPayload {
            user_question: user_question.to_string(),
            instruction: all_instructions.join("\n\n---\n\n"),
            files: processed,
            planner_name: None,
            message_id: kickoff_message_id,
            router_id: self.id.clone(),
        };

        self.deps
            .store
            .enqueue_task(
                &crate::new_id(),
                AgentType::Planner,
                &planner_id,
                EXECUTE_INITIAL_PLANNING,
                Some(serde_json::to_value(&payload).context("failed to serialise planning payload")?),
            )
            .await?;

        tracing::info!(router_id = %self.id, %planner_id, "initial planning queued");
        Ok(true)
    }

    /// Content-classify each image file: an LLM pass breaks the image
    /// into elements (chart, table, diagram, text) whose types key the
    /// instruction library. Unreadable images are dropped with an error.
    async fn breakdown_images(
        &self,
        files: Vec<InputFile>,
        errors: &mut Vec<String>,
    ) -> Result<Vec<InputFile>> {
        let mut kept = Vec::with_capacity(files.len());

        for mut file in files {
            if !matches!(file.kind, FileKind::Image { .. }) {
                kept.push(file);
                continue;
            }

            let name = file
                .path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| file.path.to_string_lossy().to_string());

            let bytes = match std::fs::read(&file.path) {
                Ok(bytes) => bytes,
                Err(error) => {
                    errors.push(format!("Error processing image '{name}': {error}"));
                    continue;
                }
            };
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

            let breakdown: ImageBreakdown = llm::structured(
                &self.deps.llm,
                CompletionRequest {
                    caller: "router",
                    model: self.model(),
                    temperature: 0.0,
                    messages: vec![ChatMessage::new(
                        Role::User,
                        Content::Multipart(vec![
                            Part::Text {
                                text: "What type of image is this?".to_string(),
                            },
                            Part::Image { data: encoded },
                        ]),
                    )],
                },
            )
            .await?;

            if breakdown.unreadable {
                errors.push(format!(
                    "Error processing image '{name}': the image cannot be read. {}",
                    breakdown.image_quality
                ));
                continue;
            }

            file.kind = FileKind::Image {
                subtypes: breakdown
                    .elements
                    .iter()
                    .map(|element| element.element_type)
                    .collect(),
            };
            kept.push(file);
        }

        Ok(kept)
    }

    /// Relay a finished planner's answer into the router log and to the
    /// client, then unlock input.
    pub async fn on_planner_completed(&self, planner_id: &str) -> Result<()> {
        let planner = self
            .deps
            .store
            .get_planner(planner_id)
            .await?
            .with_context(|| format!("planner {planner_id} not found"))?;

        match planner.status {
            PlannerStatus::Completed => {
                let user_response = planner
                    .user_response
                    .unwrap_or_else(|| "The agent completed without a response.".to_string());

                self.deps
                    .store
                    .add_message(
                        AgentType::Router,
                        &self.id,
                        Role::Assistant,
                        user_response.clone().into(),
                    )
                    .await?;
                self.deps
                    .notifier
                    .response(&self.id, user_response, None)
                    .await;
            }
            PlannerStatus::Failed => {
                self.deps
                    .notifier
                    .error(&self.id, "The agent run failed; please try again.")
                    .await;
            }
            other => {
                tracing::warn!(%planner_id, status = %other, "completion relay for non-terminal planner");
            }
        }

        self.finish_turn().await
    }

    /// Replay the session's message log (minus system prompts) to the
    /// client.
    pub async fn send_message_history(&self) -> Result<()> {
        let log = self
            .deps
            .store
            .get_messages(AgentType::Router, &self.id)
            .await?;
        let visible = log
            .into_iter()
            .filter(|message| message.role != Role::System)
            .collect();
        self.deps.notifier.message_history(&self.id, visible).await;
        Ok(())
    }

    /// Generate a short LLM title when the first user message is long.
    pub async fn generate_and_update_title(&self) -> Result<()> {
        let log = self
            .deps
            .store
            .get_messages(AgentType::Router, &self.id)
            .await?;

        let needs_title = log
            .iter()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.to_text().chars().count() > 30)
            .unwrap_or(false);
        if !needs_title {
            return Ok(());
        }

        let mut messages = llm::from_log(&log);
        messages.push(ChatMessage::new(
            Role::User,
            "Create a succinct title for this conversation. In the response, only provide the \
             title and nothing else. Keep the title under 30 characters.",
        ));

        let title = self
            .deps
            .llm
            .complete(CompletionRequest {
                caller: "router",
                model: self.model(),
                temperature: 0.0,
                messages,
            })
            .await?;

        self.deps
            .store
            .update_router_title(&self.id, title.trim())
            .await?;
        tracing::info!(router_id = %self.id, title = %title.trim(), "router title updated");
        Ok(())
    }

    fn model(&self) -> String {
        self.deps.config.llm.router_model.clone()
    }
}

/// Completion pump: watch for terminal planners whose outcome has not
/// been relayed, and hand each to its owning router.
pub fn spawn_completion_pump(
    deps: Deps,
    shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_completion_pump(deps, shutdown_rx).await;
        tracing::info!("completion pump stopped");
    })
}

async fn run_completion_pump(deps: Deps, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }

        if let Err(error) = pump_once(&deps).await {
            tracing::error!(%error, "completion pump iteration failed");
        }
    }
}

/// One pump pass. Public so tests and the startup path can drain
/// completions deterministically.
pub async fn pump_once(deps: &Deps) -> Result<u32> {
    let planners = deps.store.planners_awaiting_relay().await?;
    let mut relayed = 0;

    for planner in planners {
        let Some(router_id) = deps.store.router_for_planner(&planner.planner_id).await? else {
            // Nothing to relay to; mark it so the pump doesn't spin on it.
            deps.store.mark_planner_relayed(&planner.planner_id).await?;
            continue;
        };

        let router = RouterAgent::new(router_id, deps.clone());
        router.on_planner_completed(&planner.planner_id).await?;
        deps.store.mark_planner_relayed(&planner.planner_id).await?;
        relayed += 1;
    }

    Ok(relayed)
}
