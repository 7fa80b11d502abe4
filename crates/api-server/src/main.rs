//! Auto-run server
//!
//! Runs task documents through agent CLIs in the background. Provides the
//! REST operator surface (default port 8081) and pushes progress over
//! Socket.IO (default port 8080).

mod config;
mod routes;
mod socket;
mod state;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use agent_runner::{BatchExecutor, CliAgentSpawner, Collaborators, OrchestratorConfig};
use anyhow::Context;
use autorun_core::document::FileDocumentStore;
use autorun_core::history::JsonlHistoryStore;
use axum::Router;
use git_worktree::RunWorktreeManager;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::socket::{create_socket_layer, SocketBroadcastSink, SocketState};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "autorun_server=debug,agent_runner=debug,git_worktree=info,tower_http=debug,socketioxide=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let orchestrator_config = OrchestratorConfig::from_env();

    tracing::info!("Using data directory: {:?}", config.data_dir);
    tracing::info!("Using repository: {:?}", config.repo_path);
    tracing::info!(
        "Agent: {}, stall threshold: {}, debounce: {:?}",
        config.agent_type.as_str(),
        orchestrator_config.stall_threshold,
        orchestrator_config.broadcast_debounce
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    let mut spawner =
        CliAgentSpawner::new(config.agent_type).with_timeout(orchestrator_config.agent_timeout);
    if let Some(program) = &config.agent_program {
        spawner = spawner.with_program(program.clone());
    }

    // The executor needs the sink before the Socket.IO layer exists
    let broadcast = SocketBroadcastSink::new();
    let history = JsonlHistoryStore::new(&config.data_dir);
    let collaborators = Collaborators {
        documents: Arc::new(FileDocumentStore::new()),
        spawner: Arc::new(spawner),
        worktrees: Arc::new(RunWorktreeManager::new()),
        history: Arc::new(history.clone()),
        broadcast: Arc::new(broadcast.clone()),
    };
    let executor = Arc::new(BatchExecutor::new(orchestrator_config, collaborators));

    let (socket_layer, io) = create_socket_layer(
        SocketState {
            executor: Arc::clone(&executor),
        },
        config.allow_polling,
    );
    broadcast.attach(io);

    let app_state = AppState::new(
        Arc::clone(&executor),
        history,
        config.data_dir.clone(),
        config.repo_path.clone(),
    );

    // REST API server
    let rest_app = Router::new()
        .merge(routes::health::router())
        .merge(routes::autorun::router())
        .with_state(app_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Socket.IO server
    // Layers are applied bottom-to-top, so CorsLayer is added last to be applied first
    let socket_app = Router::new()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(socket_layer);

    // Bind to 0.0.0.0 for localhost/127.0.0.1 compatibility
    let rest_addr = SocketAddr::from(([0, 0, 0, 0], config.rest_port));
    let socket_addr = SocketAddr::from(([0, 0, 0, 0], config.socket_port));

    let rest_listener = tokio::net::TcpListener::bind(rest_addr)
        .await
        .with_context(|| format!("Failed to bind REST API to {}", rest_addr))?;
    let socket_listener = tokio::net::TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind Socket.IO to {}", socket_addr))?;

    tracing::info!("REST API listening on {}", rest_addr);
    tracing::info!("Socket.IO listening on {}", socket_addr);

    // Runs are aborted and finalized before the listeners close
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let executor = Arc::clone(&executor);
        let grace = config.shutdown_grace;
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutdown requested");
            executor.shutdown(grace).await;
            let _ = shutdown_tx.send(true);
        });
    }

    let rest_handle = tokio::spawn(
        axum::serve(rest_listener, rest_app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
            .into_future(),
    );
    let socket_handle = tokio::spawn(
        axum::serve(socket_listener, socket_app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .into_future(),
    );

    let (rest, socket) = tokio::try_join!(rest_handle, socket_handle)?;
    rest.context("REST API server failed")?;
    socket.context("Socket.IO server failed")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender gone without a shutdown: keep serving
            std::future::pending::<()>().await;
        }
    }
}
