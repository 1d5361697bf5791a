//! Recommendation Metrics and Performance Monitoring
//!
//! Timing for strategy calls and training runs, plus counters published
//! through the `metrics` facade (exported by the binary when the
//! `prometheus` feature is on).

use std::time::Instant;

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: String,
}

impl PerformanceTimer {
    pub fn new(label: &str) -> Self {
        Self {
            start: Instant::now(),
            label: label.to_string(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "⚠️ Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        tracing::debug!("⏱️ {} completed in {}ms", self.label, elapsed);
    }
}

/// A strategy call returned `items` results to the caller
pub fn record_served(strategy: &'static str, group: &'static str, items: usize) {
    metrics::counter!("recommendations_served_total", "strategy" => strategy, "group" => group)
        .increment(1);
    metrics::histogram!("recommendation_items", "strategy" => strategy).record(items as f64);
}

/// A sub-step was skipped or replaced by its fallback
pub fn record_degraded(strategy: &'static str, step: &'static str) {
    metrics::counter!("recommendation_degraded_total", "strategy" => strategy, "step" => step)
        .increment(1);
}

/// Outcome of one model training attempt
pub fn record_training(model: &'static str, outcome: &'static str) {
    metrics::counter!("model_training_total", "model" => model, "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_measures_elapsed() {
        let timer = PerformanceTimer::new("noop");
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.elapsed_ms() >= 1);
        timer.log_if_slow(10_000);
    }

    #[test]
    fn test_counters_without_recorder_are_noops() {
        record_served("popular", "A", 3);
        record_degraded("nearest", "ml_score");
        record_training("media", "ok");
    }
}
