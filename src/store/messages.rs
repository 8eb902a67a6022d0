//! Append-only per-agent message logs.

use crate::error::Result;
use crate::store::Store;
use crate::AgentType;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

/// Message author role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Developer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Developer => "developer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "developer" => Some(Role::Developer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One block inside a multipart message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    /// Base64-encoded PNG payload.
    Image { data: String },
}

/// Message content: a plain string or a list of structured parts.
///
/// Provider-specific conversions (merging consecutive same-role messages,
/// hoisting the system text) happen at the LLM adapter boundary, never here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Multipart(Vec<Part>),
}

impl Content {
    pub fn text(value: impl Into<String>) -> Self {
        Content::Text(value.into())
    }

    /// Flatten to displayable text; image parts render as a placeholder.
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Multipart(parts) => parts
                .iter()
                .map(|part| match part {
                    Part::Text { text } => text.clone(),
                    Part::Image { .. } => "[image]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_string())
    }
}

/// A stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub agent_type: AgentType,
    pub agent_id: String,
    pub role: Role,
    pub content: Content,
    pub created_at: String,
}

impl Store {
    /// Append a message to an agent's log and return its id.
    pub async fn add_message(
        &self,
        agent_type: AgentType,
        agent_id: &str,
        role: Role,
        content: Content,
    ) -> Result<i64> {
        let content_json =
            serde_json::to_string(&content).context("failed to serialise message content")?;

        let result = sqlx::query(
            "INSERT INTO messages (agent_type, agent_id, role, content) VALUES (?, ?, ?, ?)",
        )
        .bind(agent_type.as_str())
        .bind(agent_id)
        .bind(role.as_str())
        .bind(&content_json)
        .execute(self.pool())
        .await
        .context("failed to append message")?;

        Ok(result.last_insert_rowid())
    }

    /// Full message log for one agent, in append order.
    pub async fn get_messages(
        &self,
        agent_type: AgentType,
        agent_id: &str,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, agent_type, agent_id, role, content, created_at \
             FROM messages WHERE agent_type = ? AND agent_id = ? ORDER BY id ASC",
        )
        .bind(agent_type.as_str())
        .bind(agent_id)
        .fetch_all(self.pool())
        .await
        .context("failed to fetch messages")?;

        rows.into_iter().map(message_from_row).collect()
    }

    /// Fetch one message by id.
    pub async fn get_message(&self, message_id: i64) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT id, agent_type, agent_id, role, content, created_at \
             FROM messages WHERE id = ?",
        )
        .bind(message_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch message")?;

        row.map(message_from_row).transpose()
    }
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
    let agent_type_value: String = row
        .try_get("agent_type")
        .context("failed to read message agent_type")?;
    let role_value: String = row.try_get("role").context("failed to read message role")?;
    let content_value: String = row
        .try_get("content")
        .context("failed to read message content")?;

    let agent_type = AgentType::parse(&agent_type_value)
        .with_context(|| format!("invalid agent_type in database: {agent_type_value}"))?;
    let role = Role::parse(&role_value)
        .with_context(|| format!("invalid message role in database: {role_value}"))?;
    let content: Content = serde_json::from_str(&content_value)
        .context("failed to deserialise message content")?;

    Ok(MessageRecord {
        id: row.try_get("id").context("failed to read message id")?,
        agent_type,
        agent_id: row
            .try_get("agent_id")
            .context("failed to read message agent_id")?,
        role,
        content,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read message created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_keep_append_order_per_agent() {
        let store = Store::connect_in_memory().await.expect("store");

        let first = store
            .add_message(AgentType::Planner, "p1", Role::System, "you plan".into())
            .await
            .expect("append");
        let second = store
            .add_message(AgentType::Planner, "p1", Role::User, "question".into())
            .await
            .expect("append");
        store
            .add_message(AgentType::Worker, "w1", Role::User, "other log".into())
            .await
            .expect("append");

        assert!(second > first);

        let log = store
            .get_messages(AgentType::Planner, "p1")
            .await
            .expect("fetch");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::System);
        assert_eq!(log[1].content, Content::text("question"));
    }

    #[tokio::test]
    async fn multipart_content_round_trips() {
        let store = Store::connect_in_memory().await.expect("store");

        let content = Content::Multipart(vec![
            Part::Text {
                text: "Image: chart".into(),
            },
            Part::Image {
                data: "aGVsbG8=".into(),
            },
        ]);

        let id = store
            .add_message(AgentType::Worker, "w1", Role::User, content.clone())
            .await
            .expect("append");

        let stored = store.get_message(id).await.expect("fetch").expect("exists");
        assert_eq!(stored.content, content);
        assert_eq!(stored.content.to_text(), "Image: chart\n[image]");
    }
}
