//! Taskforce server entry point.

use std::sync::Arc;

use taskforce::artefacts::ArtefactStore;
use taskforce::config::Config;
use taskforce::handlers::HandlerRegistry;
use taskforce::llm::{LlmClientDyn, OpenAiClient};
use taskforce::notify::Notifier;
use taskforce::sandbox::PythonSandbox;
use taskforce::store::Store;
use taskforce::tools::ToolRegistry;
use taskforce::{api, dispatcher, router, Deps};

use anyhow::Context as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    let config = Arc::new(Config::load()?);
    tracing::info!(port = config.port, "starting taskforce");

    let store = Store::connect(&config.sqlite_url()).await?;

    // Tasks left IN_PROGRESS by a hard crash must not be replayed
    // blindly; resume goes through the planners' next_handler pointers.
    let cleared = store.clear_task_queue().await?;
    if cleared > 0 {
        tracing::info!(cleared, "stale task queue wiped");
    }

    let llm = build_llm_client(&config, store.clone())?;
    let deps = Deps {
        store,
        artefacts: ArtefactStore::new(&config.collaterals_base_path),
        llm,
        sandbox: Arc::new(PythonSandbox::default()),
        notifier: Notifier::new(),
        tools: ToolRegistry::standard(),
        config: config.clone(),
    };

    let resumed = dispatcher::resume_pending_planners(&deps).await?;
    if resumed > 0 {
        tracing::info!(resumed, "non-terminal planners re-enqueued");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let registry = HandlerRegistry::standard();

    let dispatcher_handle = dispatcher::spawn(deps.clone(), registry, shutdown_rx.clone());
    let pump_handle = router::spawn_completion_pump(deps.clone(), shutdown_rx.clone());

    let bind = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let server_handle = api::start_http_server(bind, deps, shutdown_rx).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(dispatcher_handle, pump_handle, server_handle);
    tracing::info!("taskforce stopped");
    Ok(())
}

fn init_tracing() -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all("./logs").context("failed to create log directory")?;
    let file_appender = tracing_appender::rolling::daily("./logs", "taskforce.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taskforce=info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .context("failed to initialise tracing")?;

    Ok(guard)
}

/// Resolve the first configured provider key into a chat-completions
/// client. Non-OpenAI providers are reached through their
/// OpenAI-compatible endpoints.
fn build_llm_client(config: &Config, store: Store) -> anyhow::Result<Arc<dyn LlmClientDyn>> {
    if let Some(key) = &config.llm.openai_key {
        let client = OpenAiClient::new(key.clone(), store)?;
        return Ok(Arc::new(client));
    }
    if let Some(key) = &config.llm.anthropic_key {
        let client =
            OpenAiClient::with_base_url("https://api.anthropic.com/v1", key.clone(), store)?;
        return Ok(Arc::new(client));
    }
    if let Some(key) = &config.llm.gemini_key {
        let client = OpenAiClient::with_base_url(
            "https://generativelanguage.googleapis.com/v1beta/openai",
            key.clone(),
            store,
        )?;
        return Ok(Arc::new(client));
    }

    anyhow::bail!("no LLM provider API key configured")
}
