//! Router-facing REST endpoints.

use crate::router::RouterAgent;
use crate::store::Role;
use crate::{AgentType, Deps};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// List routers, newest first.
pub async fn list_routers(State(deps): State<Deps>) -> impl IntoResponse {
    match deps.store.list_routers().await {
        Ok(routers) => Json(routers).into_response(),
        Err(error) => internal_error(error).into_response(),
    }
}

/// Fetch a router's visible message log.
pub async fn get_router_messages(
    State(deps): State<Deps>,
    Path(router_id): Path<String>,
) -> impl IntoResponse {
    match deps.store.get_router(&router_id).await {
        Ok(Some(router)) => {
            let messages = match deps.store.get_messages(AgentType::Router, &router_id).await {
                Ok(messages) => messages,
                Err(error) => return internal_error(error).into_response(),
            };
            let visible: Vec<_> = messages
                .into_iter()
                .filter(|message| message.role != Role::System)
                .collect();
            Json(json!({"router": router, "messages": visible})).into_response()
        }
        Ok(None) => not_found("router", &router_id).into_response(),
        Err(error) => internal_error(error).into_response(),
    }
}

/// Run one turn on a router. For simple chat the assistant response is
/// already in the log when this returns; for complex turns this is an
/// acknowledgement that a planner run is in flight.
pub async fn activate_router(
    State(deps): State<Deps>,
    Path(router_id): Path<String>,
    Json(request): Json<ActivateRequest>,
) -> impl IntoResponse {
    let agent = RouterAgent::new(router_id.clone(), deps.clone());

    let exists = match deps.store.get_router(&router_id).await {
        Ok(router) => router.is_some(),
        Err(error) => return internal_error(error).into_response(),
    };

    let outcome = if exists {
        agent.handle(&request.message, request.files).await
    } else {
        agent.activate(&request.message, request.files).await
    };

    if let Err(error) = outcome {
        return internal_error(error).into_response();
    }

    // The latest assistant message is either the chat answer or the
    // planner kickoff acknowledgement.
    match deps.store.get_messages(AgentType::Router, &router_id).await {
        Ok(messages) => {
            let latest_assistant = messages
                .iter()
                .rev()
                .find(|message| message.role == Role::Assistant)
                .map(|message| message.content.to_text());
            Json(json!({"router_id": router_id, "response": latest_assistant})).into_response()
        }
        Err(error) => internal_error(error).into_response(),
    }
}

/// Kick off asynchronous title generation.
pub async fn update_title(
    State(deps): State<Deps>,
    Path(router_id): Path<String>,
) -> impl IntoResponse {
    tokio::spawn(async move {
        let agent = RouterAgent::new(router_id.clone(), deps);
        if let Err(error) = agent.generate_and_update_title().await {
            tracing::error!(%router_id, %error, "title generation failed");
        }
    });

    StatusCode::ACCEPTED
}

/// If a message is backed by a planner, its current plan and status.
pub async fn planner_info(
    State(deps): State<Deps>,
    Path(message_id): Path<i64>,
) -> impl IntoResponse {
    let planner_id = match deps.store.planner_for_message(message_id).await {
        Ok(Some(planner_id)) => planner_id,
        Ok(None) => return not_found("planner for message", &message_id.to_string()).into_response(),
        Err(error) => return internal_error(error).into_response(),
    };

    match deps.store.get_planner(&planner_id).await {
        Ok(Some(planner)) => Json(json!({
            "planner_id": planner.planner_id,
            "status": planner.status,
            "execution_plan": planner.execution_plan,
            "user_response": planner.user_response,
        }))
        .into_response(),
        Ok(None) => not_found("planner", &planner_id).into_response(),
        Err(error) => internal_error(error).into_response(),
    }
}

fn internal_error(error: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!(%error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": error.to_string()})),
    )
}

fn not_found(entity: &str, id: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{entity} not found: {id}")})),
    )
}
