//! Metrics collection and registry.

use crate::accounting::AccountingStats;
use crate::feedback::FeedbackStats;
use crate::scheduler::{SourceState, SourceStatus};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// A snapshot of scheduler state for metrics update.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Kernel estimate at the end of the last cycle.
    pub pool_estimate_bits: Option<u32>,
    pub pool_capacity_bits: Option<u32>,
    /// Cycles run so far.
    pub cycles: u64,
    pub workers_in_flight: usize,
    pub feedback: FeedbackStats,
    pub accounting: AccountingStats,
    pub sources: Vec<SourceStatus>,
}

/// Prometheus metrics registry for the feeder.
pub struct MetricsRegistry {
    registry: Registry,

    // Pool
    pool_entropy_bits: IntGauge,
    pool_capacity_bits: IntGauge,

    // Scheduler
    cycles_total: IntCounter,
    workers_in_flight: IntGauge,
    sources_active: IntGauge,
    sources_disabled: IntGauge,

    // Feedback and accounting
    accounted_bits_total: IntCounter,
    accounted_bytes_total: IntCounter,
    unaccounted_bytes_total: IntCounter,
    reseeds_total: IntCounter,
    rejections_total: IntCounter,
    overclaims_total: IntCounter,
    downgrades_total: IntCounter,

    // Per source
    source_up: IntGaugeVec,
    source_failures: IntGaugeVec,
    source_reads_total: IntCounterVec,
    source_bytes_total: IntCounterVec,
    source_errors_total: IntCounterVec,
}

/// Brings a monotonic counter up to `target`. Counters never go down.
fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

impl MetricsRegistry {
    /// Creates a registry with every feeder metric registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let pool_entropy_bits = IntGauge::new(
            "entropy_feeder_pool_entropy_bits",
            "Kernel pool entropy estimate in bits",
        )?;
        let pool_capacity_bits = IntGauge::new(
            "entropy_feeder_pool_capacity_bits",
            "Kernel pool capacity in bits",
        )?;

        let cycles_total =
            IntCounter::new("entropy_feeder_cycles_total", "Scheduling cycles run")?;
        let workers_in_flight = IntGauge::new(
            "entropy_feeder_workers_in_flight",
            "Read workers currently running",
        )?;
        let sources_active = IntGauge::new(
            "entropy_feeder_sources_active",
            "Sources that are not disabled",
        )?;
        let sources_disabled = IntGauge::new(
            "entropy_feeder_sources_disabled",
            "Sources disabled after repeated failures",
        )?;

        let accounted_bits_total = IntCounter::new(
            "entropy_feeder_accounted_bits_total",
            "Entropy bits credited to the kernel pool",
        )?;
        let accounted_bytes_total = IntCounter::new(
            "entropy_feeder_accounted_bytes_total",
            "Bytes written with entropy credit",
        )?;
        let unaccounted_bytes_total = IntCounter::new(
            "entropy_feeder_unaccounted_bytes_total",
            "Bytes mixed into the pool without credit",
        )?;
        let reseeds_total = IntCounter::new(
            "entropy_feeder_reseeds_total",
            "CSPRNG reseeds triggered",
        )?;
        let rejections_total = IntCounter::new(
            "entropy_feeder_feedback_rejections_total",
            "Submissions the kernel pool rejected",
        )?;
        let overclaims_total = IntCounter::new(
            "entropy_feeder_overclaims_total",
            "Samples rejected for claiming more entropy than their length allows",
        )?;
        let downgrades_total = IntCounter::new(
            "entropy_feeder_downgrades_total",
            "Trusted samples mixed without credit after the health screen",
        )?;

        let source_up = IntGaugeVec::new(
            Opts::new(
                "entropy_feeder_source_up",
                "1 if the source is in rotation and not backing off",
            ),
            &["source"],
        )?;
        let source_failures = IntGaugeVec::new(
            Opts::new(
                "entropy_feeder_source_failures",
                "Consecutive failures of the source",
            ),
            &["source"],
        )?;
        let source_reads_total = IntCounterVec::new(
            Opts::new("entropy_feeder_source_reads_total", "Completed reads"),
            &["source"],
        )?;
        let source_bytes_total = IntCounterVec::new(
            Opts::new("entropy_feeder_source_bytes_total", "Bytes read"),
            &["source"],
        )?;
        let source_errors_total = IntCounterVec::new(
            Opts::new("entropy_feeder_source_errors_total", "Failed drains"),
            &["source"],
        )?;

        registry.register(Box::new(pool_entropy_bits.clone()))?;
        registry.register(Box::new(pool_capacity_bits.clone()))?;
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(workers_in_flight.clone()))?;
        registry.register(Box::new(sources_active.clone()))?;
        registry.register(Box::new(sources_disabled.clone()))?;
        registry.register(Box::new(accounted_bits_total.clone()))?;
        registry.register(Box::new(accounted_bytes_total.clone()))?;
        registry.register(Box::new(unaccounted_bytes_total.clone()))?;
        registry.register(Box::new(reseeds_total.clone()))?;
        registry.register(Box::new(rejections_total.clone()))?;
        registry.register(Box::new(overclaims_total.clone()))?;
        registry.register(Box::new(downgrades_total.clone()))?;
        registry.register(Box::new(source_up.clone()))?;
        registry.register(Box::new(source_failures.clone()))?;
        registry.register(Box::new(source_reads_total.clone()))?;
        registry.register(Box::new(source_bytes_total.clone()))?;
        registry.register(Box::new(source_errors_total.clone()))?;

        Ok(Self {
            registry,
            pool_entropy_bits,
            pool_capacity_bits,
            cycles_total,
            workers_in_flight,
            sources_active,
            sources_disabled,
            accounted_bits_total,
            accounted_bytes_total,
            unaccounted_bytes_total,
            reseeds_total,
            rejections_total,
            overclaims_total,
            downgrades_total,
            source_up,
            source_failures,
            source_reads_total,
            source_bytes_total,
            source_errors_total,
        })
    }

    /// Updates all metrics from a snapshot.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        if let Some(bits) = snapshot.pool_estimate_bits {
            self.pool_entropy_bits.set(i64::from(bits));
        }
        if let Some(bits) = snapshot.pool_capacity_bits {
            self.pool_capacity_bits.set(i64::from(bits));
        }

        advance(&self.cycles_total, snapshot.cycles);
        self.workers_in_flight.set(snapshot.workers_in_flight as i64);

        let feedback = &snapshot.feedback;
        advance(&self.accounted_bits_total, feedback.accounted_bits);
        advance(&self.accounted_bytes_total, feedback.accounted_bytes);
        advance(&self.unaccounted_bytes_total, feedback.unaccounted_bytes);
        advance(&self.reseeds_total, feedback.reseeds);
        advance(&self.rejections_total, feedback.rejections);
        advance(&self.overclaims_total, snapshot.accounting.overclaims);
        advance(&self.downgrades_total, snapshot.accounting.downgrades);

        let disabled = snapshot
            .sources
            .iter()
            .filter(|s| s.state.is_disabled())
            .count() as i64;
        self.sources_disabled.set(disabled);
        self.sources_active.set(snapshot.sources.len() as i64 - disabled);

        for source in &snapshot.sources {
            let labels = [source.id.as_str()];
            let up = !source.state.is_disabled()
                && !matches!(source.state, SourceState::Faulted { .. });
            self.source_up.with_label_values(&labels).set(i64::from(up));
            self.source_failures
                .with_label_values(&labels)
                .set(i64::from(source.failures));
            advance(&self.source_reads_total.with_label_values(&labels), source.reads);
            advance(&self.source_bytes_total.with_label_values(&labels), source.bytes_read);
            advance(&self.source_errors_total.with_label_values(&labels), source.errors);
        }
    }

    /// True while at least one source is in rotation.
    pub fn any_source_active(&self) -> bool {
        self.sources_active.get() > 0
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
