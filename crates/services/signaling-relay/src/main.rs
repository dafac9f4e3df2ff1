//! Signaling relay binary
//!
//! ```bash
//! # Defaults: 0.0.0.0:8787, 1000 rooms, 2 participants per room
//! cargo run -p studyroom-relay
//!
//! # TOML config, overridden by flags
//! cargo run -p studyroom-relay -- --config relay.toml --port 9000 --log-format json
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use studyroom_relay::{build_router, AppState, RelayConfig};

/// StudyRoom signaling relay
///
/// Relays offers, answers and ICE candidates between the two peers of a
/// study session over HTTP polling or WebSocket push.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of live rooms
    #[arg(long)]
    max_rooms: Option<usize>,

    /// Maximum participants per room
    #[arg(long)]
    max_participants: Option<usize>,

    /// Log output format
    #[arg(long, default_value = "text", env = "RELAY_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting signaling relay...");

    let mut config = RelayConfig::load(args.config.as_ref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.http_port = port;
    }
    if let Some(max) = args.max_rooms {
        config.limits.max_rooms = max;
    }
    if let Some(max) = args.max_participants {
        config.limits.max_participants_per_room = max;
    }
    config.validate()?;

    info!(
        host = %config.server.host,
        http_port = config.server.http_port,
        max_rooms = config.limits.max_rooms,
        max_participants = config.limits.max_participants_per_room,
        "Configuration loaded"
    );

    let config = Arc::new(config);
    let state = AppState::new(config.clone());
    let router = build_router(state);

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("HTTP server listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown...");
        })
        .await?;

    info!("Signaling relay shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
