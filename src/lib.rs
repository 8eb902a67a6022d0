//! Taskforce: a durable, function-chained orchestration engine for
//! hierarchical agents (router → planner → workers).

pub mod api;
pub mod artefacts;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod files;
pub mod handlers;
pub mod llm;
pub mod notify;
pub mod plan;
pub mod router;
pub mod sandbox;
pub mod schemas;
pub mod store;
pub mod tables;
pub mod tools;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Router (conversation session) identifier: 32-char hex uuid.
pub type RouterId = String;

/// Planner identifier: 32-char hex uuid.
pub type PlannerId = String;

/// Worker identifier. Always equal to the logical task id the planner
/// generated for it.
pub type WorkerId = String;

/// Queue record identifier.
pub type TaskId = String;

/// Mint a fresh opaque id (hex uuid, no hyphens).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The three agent tiers that own message logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Router,
    Planner,
    Worker,
}

impl AgentType {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Router => "router",
            AgentType::Planner => "planner",
            AgentType::Worker => "worker",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "router" => Some(AgentType::Router),
            "planner" => Some(AgentType::Planner),
            "worker" => Some(AgentType::Worker),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared dependency bundle handed to every task handler.
///
/// Handlers are free functions of `(TaskRecord, Deps)`. Everything they
/// touch comes through here so tests can substitute scripted fakes for
/// the LLM and the sandbox.
#[derive(Clone)]
pub struct Deps {
    pub store: store::Store,
    pub artefacts: artefacts::ArtefactStore,
    pub llm: Arc<dyn llm::LlmClientDyn>,
    pub sandbox: Arc<dyn sandbox::SandboxDyn>,
    pub notifier: Arc<notify::Notifier>,
    pub tools: Arc<tools::ToolRegistry>,
    pub config: Arc<config::Config>,
}
