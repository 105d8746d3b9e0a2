//! # Speech Stream Server - Main Application Entry Point
//!
//! HTTP service that takes chunked 8 kHz telephony PCM, upsamples it to 16 kHz
//! and streams back the text recognized so far.
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, `config.toml`, environment variables)
//! - **state**: shared application state, stream admission and metrics
//! - **audio**: PCM helpers and the 2x resampler
//! - **recognition**: engine traits, shared model provider, per-stream sessions
//! - **stream**: the per-connection state machine
//! - **handlers**: HTTP endpoints, including `POST /speech-to-text-stream`
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics
//! - **device**: Candle device selection for the Whisper backend
//! - **error**: error types and HTTP error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod recognition;
mod state;
mod stream;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return Err(e);
    }

    info!("Starting speech-stream-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        engine = %config.model.engine,
        model_path = %config.model.path,
        device = %config.model.device,
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone());

    if config.model.preload {
        // Streams retry the load, so a failure here is not fatal.
        if let Err(e) = app_state.models.get().await {
            warn!("Model preload failed, will retry on first stream: {}", e);
        }
    }

    let bind_addr = config.bind_address();
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::configure)
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; defaults to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_stream_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
