//! Background model training.
//!
//! Training is CPU-bound, so every run goes through `spawn_blocking`;
//! strategy calls keep reading the previous snapshot until the swap.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::engine::{RecommendationEngine, TrainReport};
use crate::error::{Error, Result};

/// Run one training pass off the async runtime
pub async fn train_in_background(engine: Arc<RecommendationEngine>) -> Result<TrainReport> {
    tokio::task::spawn_blocking(move || engine.train())
        .await
        .map_err(Error::internal)?
}

/// Initial training plus an optional retrain interval
pub struct ModelUpdater {
    engine: Arc<RecommendationEngine>,
    interval: Option<Duration>,
}

impl ModelUpdater {
    pub fn new(engine: Arc<RecommendationEngine>, interval: Option<Duration>) -> Self {
        Self { engine, interval }
    }

    /// Train once now; failures are logged, the engine keeps serving
    pub async fn warm_up(&self) {
        info!("🧠 Training models on startup...");
        match train_in_background(self.engine.clone()).await {
            Ok(report) if report.trained => info!(
                "✅ Models ready ({} media ratings, {} place ratings)",
                report.media_samples, report.place_samples
            ),
            Ok(_) => warn!("⚠️ Models not ready after startup training, ML steps disabled"),
            Err(e) => error!("Startup training failed: {:?}", e),
        }
    }

    /// Spawn the retrain loop. Returns `None` when no interval is configured.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        let period = self.interval?;

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            // Skip first tick (runs immediately otherwise)
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("🔄 Running scheduled model retrain...");
                        match train_in_background(self.engine.clone()).await {
                            Ok(report) => info!(
                                "✅ Scheduled retrain done: trained={}, skipped rows={}",
                                report.trained, report.skipped_rows
                            ),
                            Err(e) => error!("Scheduled retrain failed: {:?}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Model updater shutting down");
                        break;
                    }
                }
            }
        }))
    }
}
