//! chatgate: Main Entry Point
//!
//! Serves `POST /chat`, `/ws` and the inspection API on one listener, with
//! an optional dedicated WebSocket listener when `WS_PORT` is set.

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chatgate_core::config::{load_environment, load_environment_from};
use chatgate_core::Settings;
use chatgate_web::{create_router, create_ws_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "chatgate", version, about = "Streaming LLM chat gateway with tool calling")]
struct Args {
    /// Bind address for the HTTP API (overrides API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port for the HTTP API (overrides API_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Environment file to load before reading configuration
    #[arg(long, env = "CHATGATE_ENV_FILE")]
    env_file: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_file = match &args.env_file {
        Some(path) => load_environment_from(path),
        None => load_environment(),
    };

    // Initialize logging with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer().compact())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chatgate=debug")))
        .init();

    if let Some(path) = env_file {
        info!("Loaded environment from {}", path);
    }

    // Missing credentials abort startup here
    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    info!("Initializing application state...");
    let state = Arc::new(AppState::new(&settings).await?);
    info!("LLM Provider: {} ({})", state.provider_name, state.model);

    let shutdown = CancellationToken::new();
    let reaper = state.sessions.spawn_reaper(
        settings.sessions.reap_interval,
        settings.sessions.idle_timeout,
        shutdown.clone(),
    );

    let api_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("HTTP API listening on http://{}", api_addr);

    let ws_server = match &settings.server.ws_bind {
        Some((host, port)) => {
            let ws_addr = format!("{}:{}", host, port);
            let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await?;
            info!("WebSocket listening on ws://{}/ws", ws_addr);
            let app = create_ws_router(Arc::clone(&state));
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(ws_listener, app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    let app = create_router(Arc::clone(&state));
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(ws_server) = ws_server {
        ws_server.await??;
    }
    let _ = reaper.await;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
