//! Prometheus metrics for the feeder.
//!
//! The scheduler publishes a [`MetricsSnapshot`] into a shared
//! [`MetricsRegistry`] after every cycle. With the `metrics` feature the
//! registry is served over HTTP.
//!
//! # Metrics Exposed
//!
//! ## Pool
//! - `entropy_feeder_pool_entropy_bits` - Kernel entropy estimate
//! - `entropy_feeder_pool_capacity_bits` - Kernel pool size
//!
//! ## Scheduler
//! - `entropy_feeder_cycles_total` - Cycles run
//! - `entropy_feeder_workers_in_flight` - Running read workers
//! - `entropy_feeder_sources_active` - Sources in rotation
//! - `entropy_feeder_sources_disabled` - Sources disabled until reset
//!
//! ## Feedback and accounting
//! - `entropy_feeder_accounted_bits_total` - Bits credited to the pool
//! - `entropy_feeder_accounted_bytes_total` - Bytes written with credit
//! - `entropy_feeder_unaccounted_bytes_total` - Bytes mixed without credit
//! - `entropy_feeder_reseeds_total` - CSPRNG reseeds
//! - `entropy_feeder_feedback_rejections_total` - Rejected submissions
//! - `entropy_feeder_overclaims_total` - Overclaiming samples
//! - `entropy_feeder_downgrades_total` - Samples that failed the health screen
//!
//! ## Per source (label `source`)
//! - `entropy_feeder_source_up`
//! - `entropy_feeder_source_failures`
//! - `entropy_feeder_source_reads_total`
//! - `entropy_feeder_source_bytes_total`
//! - `entropy_feeder_source_errors_total`
//!
//! # Example
//!
//! ```no_run
//! use entropy_feeder::metrics::{MetricsRegistry, MetricsSnapshot};
//!
//! let registry = MetricsRegistry::new().expect("Failed to create registry");
//!
//! let snapshot = MetricsSnapshot {
//!     pool_estimate_bits: Some(256),
//!     pool_capacity_bits: Some(256),
//!     cycles: 10,
//!     ..Default::default()
//! };
//!
//! registry.update(&snapshot);
//! ```

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsRegistry, MetricsSnapshot};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, MetricsServerConfig, ServerError};
