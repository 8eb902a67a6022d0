//! Session-scoped push channel to connected clients.
//!
//! One client may attach per router session. Events sent while no client
//! is attached are dropped silently; the final response is always
//! retrievable from the store regardless.

use crate::store::MessageRecord;
use crate::RouterId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Typed events delivered to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Status {
        router_id: RouterId,
        message: String,
    },
    Response {
        router_id: RouterId,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
    },
    MessageHistory {
        router_id: RouterId,
        messages: Vec<MessageRecord>,
    },
    InputLock {
        router_id: RouterId,
    },
    InputUnlock {
        router_id: RouterId,
    },
    Error {
        router_id: RouterId,
        message: String,
    },
}

impl ClientEvent {
    fn router_id(&self) -> &str {
        match self {
            ClientEvent::Status { router_id, .. }
            | ClientEvent::Response { router_id, .. }
            | ClientEvent::MessageHistory { router_id, .. }
            | ClientEvent::InputLock { router_id }
            | ClientEvent::InputUnlock { router_id }
            | ClientEvent::Error { router_id, .. } => router_id,
        }
    }
}

/// Per-router client channel registry.
#[derive(Default)]
pub struct Notifier {
    sessions: RwLock<HashMap<RouterId, mpsc::Sender<ClientEvent>>>,
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a client to a router session, replacing any previous one.
    pub async fn attach(&self, router_id: &str) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.sessions
            .write()
            .await
            .insert(router_id.to_string(), tx);
        tracing::debug!(%router_id, "client attached");
        rx
    }

    pub async fn detach(&self, router_id: &str) {
        self.sessions.write().await.remove(router_id);
        tracing::debug!(%router_id, "client detached");
    }

    /// Best-effort single-hop delivery; no client means the event drops.
    pub async fn send(&self, event: ClientEvent) {
        let sessions = self.sessions.read().await;
        let Some(tx) = sessions.get(event.router_id()) else {
            tracing::debug!(router_id = %event.router_id(), "no client attached, event dropped");
            return;
        };
        let _ = tx.send(event).await;
    }

    pub async fn status(&self, router_id: &str, message: impl Into<String>) {
        self.send(ClientEvent::Status {
            router_id: router_id.to_string(),
            message: message.into(),
        })
        .await;
    }

    pub async fn response(
        &self,
        router_id: &str,
        message: impl Into<String>,
        message_id: Option<i64>,
    ) {
        self.send(ClientEvent::Response {
            router_id: router_id.to_string(),
            message: message.into(),
            message_id,
        })
        .await;
    }

    pub async fn message_history(&self, router_id: &str, messages: Vec<MessageRecord>) {
        self.send(ClientEvent::MessageHistory {
            router_id: router_id.to_string(),
            messages,
        })
        .await;
    }

    pub async fn input_lock(&self, router_id: &str) {
        self.send(ClientEvent::InputLock {
            router_id: router_id.to_string(),
        })
        .await;
    }

    pub async fn input_unlock(&self, router_id: &str) {
        self.send(ClientEvent::InputUnlock {
            router_id: router_id.to_string(),
        })
        .await;
    }

    pub async fn error(&self, router_id: &str, message: impl Into<String>) {
        self.send(ClientEvent::Error {
            router_id: router_id.to_string(),
            message: message.into(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_the_attached_client_in_order() {
        let notifier = Notifier::new();
        let mut rx = notifier.attach("r1").await;

        notifier.input_lock("r1").await;
        notifier.status("r1", "Thinking").await;
        notifier.response("r1", "Hi!", None).await;
        notifier.input_unlock("r1").await;

        assert!(matches!(rx.recv().await, Some(ClientEvent::InputLock { .. })));
        assert!(matches!(rx.recv().await, Some(ClientEvent::Status { .. })));
        match rx.recv().await {
            Some(ClientEvent::Response { message, message_id, .. }) => {
                assert_eq!(message, "Hi!");
                assert!(message_id.is_none());
            }
            other => panic!("expected response event, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ClientEvent::InputUnlock { .. })));
    }

    #[tokio::test]
    async fn events_without_a_client_drop_silently() {
        let notifier = Notifier::new();
        notifier.status("ghost", "nobody listening").await;

        // Attaching later starts a fresh stream.
        let mut rx = notifier.attach("ghost").await;
        notifier.status("ghost", "now someone is").await;
        match rx.recv().await {
            Some(ClientEvent::Status { message, .. }) => assert_eq!(message, "now someone is"),
            other => panic!("expected status event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_router() {
        let notifier = Notifier::new();
        let mut rx_a = notifier.attach("a").await;
        let _rx_b = notifier.attach("b").await;

        notifier.status("a", "only a").await;
        match rx_a.recv().await {
            Some(ClientEvent::Status { router_id, .. }) => assert_eq!(router_id, "a"),
            other => panic!("expected status event, got {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
    }
}
