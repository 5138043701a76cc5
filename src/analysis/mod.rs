//! Statistical sanity screen for sample bytes.
//!
//! These are checks for obviously broken output (stuck, biased or
//! strongly patterned bytes), not estimates of entropy. A failing screen
//! can only withhold entropy credit; passing it never adds any.

mod health;
mod statistics;
mod threshold;

pub use health::{HealthMetrics, HealthMonitor};
pub use statistics::StatisticalTests;
pub use threshold::{QualityThresholds, ThresholdViolation};

#[cfg(test)]
pub(crate) fn pseudo_random(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    blake3::Hasher::new()
        .update(seed)
        .finalize_xof()
        .fill(&mut out);
    out
}
