//! HTTP server setup: router and API route wiring.

use crate::api::{routers, system, ws};
use crate::Deps;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};

/// Start the HTTP server on the given address.
pub async fn start_http_server(
    bind: SocketAddr,
    deps: Deps,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(system::health))
        .route("/usage", get(system::usage))
        .route("/routers", get(routers::list_routers))
        .route("/routers/{id}", get(routers::get_router_messages))
        .route("/routers/{id}/activate", post(routers::activate_router))
        .route("/routers/{id}/update-title", post(routers::update_title))
        .route("/messages/{id}/planner-info", get(routers::planner_info))
        .route("/chat", get(ws::chat_socket))
        .layer(cors)
        .with_state(deps);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}
