//! Per-source health tracking.
//!
//! A source starts unhealthy and earns health through a streak of
//! passing samples. A single failure makes it unhealthy again.

use super::{
    statistics::StatisticalTests,
    threshold::{QualityThresholds, ThresholdViolation},
};

/// Current health status of one source.
#[derive(Debug, Clone, Default)]
pub struct HealthMetrics {
    /// Most recent statistical test results.
    pub latest_stats: Option<StatisticalTests>,
    /// Whether the source is currently healthy.
    pub is_healthy: bool,
    /// Most recent violation, if any.
    pub last_violation: Option<ThresholdViolation>,
    /// Consecutive healthy samples.
    pub consecutive_healthy: u64,
    /// Consecutive unhealthy samples.
    pub consecutive_unhealthy: u64,
    /// Total samples analyzed.
    pub total_samples: u64,
}

/// Monitors the output quality of one source over time.
pub struct HealthMonitor {
    source_id: String,
    thresholds: QualityThresholds,
    metrics: HealthMetrics,
    required_healthy_streak: u64,
}

impl HealthMonitor {
    pub fn new(source_id: impl Into<String>, thresholds: QualityThresholds, streak: u64) -> Self {
        Self {
            source_id: source_id.into(),
            thresholds,
            metrics: HealthMetrics::default(),
            required_healthy_streak: streak.max(1),
        }
    }

    /// Analyzes a sample and updates health status.
    pub fn analyze(&mut self, data: &[u8]) -> &HealthMetrics {
        let stats = StatisticalTests::analyze(data);
        self.metrics.total_samples += 1;

        match self.thresholds.check(&stats) {
            Ok(()) => {
                self.metrics.consecutive_healthy += 1;
                self.metrics.consecutive_unhealthy = 0;
                self.metrics.last_violation = None;

                if self.metrics.consecutive_healthy >= self.required_healthy_streak {
                    if !self.metrics.is_healthy {
                        tracing::info!(
                            source = %self.source_id,
                            streak = self.metrics.consecutive_healthy,
                            "Source output became healthy"
                        );
                    }
                    self.metrics.is_healthy = true;
                }

                tracing::trace!(
                    source = %self.source_id,
                    bias = stats.bit_bias,
                    variance = stats.variance,
                    autocorr = stats.autocorrelation,
                    "Health check passed"
                );
            }
            Err(violation) => {
                self.metrics.consecutive_unhealthy += 1;
                self.metrics.consecutive_healthy = 0;

                if self.metrics.is_healthy || self.metrics.total_samples == 1 {
                    tracing::warn!(
                        source = %self.source_id,
                        violation = %violation,
                        "Source output failed health screen"
                    );
                }
                self.metrics.last_violation = Some(violation);
                self.metrics.is_healthy = false;
            }
        }

        self.metrics.latest_stats = Some(stats);
        &self.metrics
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.metrics
    }

    /// True if samples from this source may currently be credited.
    pub fn is_healthy(&self) -> bool {
        self.metrics.is_healthy
    }

    /// Resets the monitor to its initial, unhealthy state.
    pub fn reset(&mut self) {
        self.metrics = HealthMetrics::default();
        tracing::debug!(source = %self.source_id, "Health monitor reset");
    }
}
