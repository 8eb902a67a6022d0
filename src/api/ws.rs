//! The bidirectional client channel.
//!
//! Inbound messages:
//!   {"type": "load_router", "router_id"} — attach and replay history.
//!   {"type": "message", "router_id"?, "message", "files"?} — user turn;
//!   a missing router_id starts a new session.
//!
//! Outbound messages are the typed notifier events, serialised as JSON.

use crate::notify::ClientEvent;
use crate::router::RouterAgent;
use crate::Deps;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    LoadRouter {
        router_id: String,
    },
    Message {
        #[serde(default)]
        router_id: Option<String>,
        message: String,
        #[serde(default)]
        files: Vec<String>,
    },
}

pub async fn chat_socket(ws: WebSocketUpgrade, State(deps): State<Deps>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, deps))
}

async fn handle_socket(mut socket: WebSocket, deps: Deps) {
    // Events from whichever router this client is currently attached to.
    let mut events: Option<mpsc::Receiver<ClientEvent>> = None;
    let mut attached_router: Option<String> = None;

    loop {
        tokio::select! {
            event = recv_event(&mut events) => {
                let Some(event) = event else {
                    // Channel replaced or closed; keep serving the socket.
                    events = None;
                    continue;
                };
                let Ok(payload) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else {
                    break;
                };
                let Message::Text(text) = message else {
                    continue;
                };

                match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(inbound) => {
                        handle_inbound(inbound, &deps, &mut events, &mut attached_router).await;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "unparseable client message");
                    }
                }
            }
        }
    }

    if let Some(router_id) = attached_router {
        deps.notifier.detach(&router_id).await;
    }
    tracing::debug!("client socket closed");
}

async fn recv_event(events: &mut Option<mpsc::Receiver<ClientEvent>>) -> Option<ClientEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_inbound(
    inbound: InboundMessage,
    deps: &Deps,
    events: &mut Option<mpsc::Receiver<ClientEvent>>,
    attached_router: &mut Option<String>,
) {
    match inbound {
        InboundMessage::LoadRouter { router_id } => {
            *events = Some(deps.notifier.attach(&router_id).await);
            *attached_router = Some(router_id.clone());

            let agent = RouterAgent::new(router_id.clone(), deps.clone());
            if let Err(error) = agent.send_message_history().await {
                tracing::error!(%router_id, %error, "failed to replay message history");
            }
        }
        InboundMessage::Message {
            router_id,
            message,
            files,
        } => {
            let (router_id, is_new) = match router_id {
                Some(router_id) => (router_id, false),
                None => (crate::new_id(), true),
            };

            // Attach before the turn starts so the lock event is seen.
            if attached_router.as_deref() != Some(router_id.as_str()) {
                *events = Some(deps.notifier.attach(&router_id).await);
                *attached_router = Some(router_id.clone());
            }

            let deps = deps.clone();
            tokio::spawn(async move {
                let agent = RouterAgent::new(router_id.clone(), deps);
                let result = if is_new {
                    agent.activate(&message, files).await
                } else {
                    agent.handle(&message, files).await
                };
                if let Err(error) = result {
                    tracing::error!(%router_id, %error, "turn ended with error");
                }
            });
        }
    }
}
