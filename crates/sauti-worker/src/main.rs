//! sauti worker — serverless text-to-speech inference endpoint.

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use sauti_core::backends;
use sauti_core::{EngineConfig, ModelLifecycle, VoiceRegistry};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sauti_worker=info,sauti_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sauti worker");

    // Missing required configuration is fatal, never a request error.
    let cfg = EngineConfig::from_env()?;
    info!("Model directory: {}", cfg.model_dir.display());
    info!("Voice registry: {}", cfg.voice_dir.display());

    // The model loads eagerly at worker start so the first job pays no cold
    // penalty beyond container boot.
    let lifecycle = Arc::new(ModelLifecycle::new());
    let loader = backends::default_loader();
    lifecycle.start(&cfg, loader.as_ref()).await?;

    let voices = Arc::new(VoiceRegistry::new(cfg.voice_dir.clone()));
    let state = AppState::new(cfg, lifecycle.clone(), voices);

    let app = api::create_router(state);

    let host = std::env::var("SAUTI_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = match std::env::var("SAUTI_PORT") {
        Ok(raw) => match raw.parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid SAUTI_PORT='{}', falling back to 8000", raw);
                8000
            }
        },
        Err(_) => 8000,
    };
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Worker listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(lifecycle))
        .await?;

    Ok(())
}

/// Wait for ctrl-c or SIGTERM, then drain the lifecycle so in-flight
/// generation finishes before the process exits.
async fn shutdown_signal(lifecycle: Arc<ModelLifecycle>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }

    lifecycle.shutdown().await;
}
