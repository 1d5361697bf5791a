//! Sightline Engine
//!
//! Place-media recommendation service.
//!
//! # Architecture
//!
//! - **Catalog**: cities, places, media and ratings loaded from a JSON snapshot
//! - **Recommendation Engine**: ranked strategies with A/B exploration
//! - **Model Updater**: startup training and optional periodic retraining
//! - **API Server**: REST endpoints for the frontend
//!
//! # Graceful Shutdown
//!
//! SIGTERM and SIGINT stop the retrain loop and let in-flight requests finish.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sightline::api::{self, AppState};
use sightline::catalog::{CatalogProvider, InMemoryCatalog};
use sightline::config::Config;
use sightline::feedback::{FeedbackStore, InMemoryFeedbackStore};
use sightline::recommendation::engine::RecommendationEngine;
use sightline::recommendation::updater::ModelUpdater;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 Sightline Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("✅ Configuration loaded and validated");

    #[cfg(feature = "prometheus")]
    install_metrics_exporter()?;

    // Catalog and feedback log
    let catalog: Arc<dyn CatalogProvider> = match &config.catalog.snapshot_path {
        Some(path) => Arc::new(InMemoryCatalog::from_snapshot_file(path)?),
        None => {
            warn!("⚠️ CATALOG_SNAPSHOT_PATH not set, serving an empty catalog");
            Arc::new(InMemoryCatalog::new())
        }
    };
    let feedback: Arc<dyn FeedbackStore> = match &config.catalog.feedback_path {
        Some(path) => Arc::new(InMemoryFeedbackStore::with_journal(path)?),
        None => Arc::new(InMemoryFeedbackStore::new()),
    };
    info!("✅ Catalog and feedback store ready");

    let engine = Arc::new(RecommendationEngine::from_config(&config, catalog, feedback));

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let updater = ModelUpdater::new(engine.clone(), config.ml.retrain_interval);
    if config.ml.enabled && config.ml.train_on_startup {
        updater.warm_up().await;
    }

    let mut handles = Vec::new();
    if let Some(handle) = updater.spawn(shutdown_tx.subscribe()) {
        info!("📊 Model retrain loop started");
        handles.push(handle);
    }

    // Spawn API server
    info!("🌐 Starting API server on port {}...", config.api.port);
    let state = Arc::new(AppState {
        engine: engine.clone(),
    });
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_config = config.api.clone();
    handles.push(tokio::spawn(async move {
        let stop = async move {
            let _ = api_shutdown.recv().await;
        };
        if let Err(e) = api::start_server(state, api_config, stop).await {
            error!("API server error: {:?}", e);
        }
    }));

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("  📡 API: http://{}:{}", config.api.host, config.api.port);
    info!(
        "  🔗 Health: http://{}:{}/health",
        config.api.host, config.api.port
    );
    info!("═══════════════════════════════════════════════════════════════");

    // Wait for shutdown signal or service failure
    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = wait_for_any_failure(&mut handles) => {
            warn!("⚠️ A service failed, initiating shutdown");
        }
    }

    // Graceful shutdown
    info!("🛑 Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, shutdown_services(handles))
        .await
        .is_err()
    {
        warn!("⚠️ Shutdown timeout exceeded, forcing exit");
    }

    info!("👋 Sightline Engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing. `LOG_FORMAT=json` switches
/// to one JSON object per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("sightline_engine=debug,sightline=debug,tower_http=debug,info")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            )
            .init();
    }
}

/// Serve Prometheus metrics on `METRICS_PORT` (default 9100)
#[cfg(feature = "prometheus")]
fn install_metrics_exporter() -> anyhow::Result<()> {
    let port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9100);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    info!("📈 Prometheus metrics on :{}", port);
    Ok(())
}

/// Wait for any task to fail
async fn wait_for_any_failure(handles: &mut [tokio::task::JoinHandle<()>]) {
    loop {
        for handle in handles.iter_mut() {
            if handle.is_finished() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait for all services to complete shutdown
async fn shutdown_services(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
