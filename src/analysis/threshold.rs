//! Quality thresholds for the health screen.

use super::statistics::StatisticalTests;
use serde::{Deserialize, Serialize};

/// Limits a sample must stay within to keep its entropy credit.
///
/// Bias and autocorrelation limits scale with the sample length: each is
/// `max_deviations` standard deviations of the statistic for uniform
/// bytes, so a healthy source trips the screen at the same negligible rate
/// whether it hands over 64 bytes or 64 KiB.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Allowed distance from the uniform expectation, in standard deviations.
    pub max_deviations: f64,
    /// Minimum acceptable byte variance.
    pub min_variance: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_deviations: 6.0,
            min_variance: 1500.0,
        }
    }
}

impl QualityThresholds {
    /// Largest acceptable |bit bias| for a sample of `len` bytes.
    ///
    /// The fraction of one bits over `8 × len` fair bits has standard
    /// deviation `0.5 / sqrt(8 × len)`.
    pub fn bit_bias_limit(&self, len: usize) -> f64 {
        self.max_deviations * 0.5 / ((len.max(1) * 8) as f64).sqrt()
    }

    /// Largest acceptable |lag-1 autocorrelation| for `len` bytes.
    pub fn autocorrelation_limit(&self, len: usize) -> f64 {
        self.max_deviations / (len.max(1) as f64).sqrt()
    }

    /// Checks statistics against thresholds.
    pub fn check(&self, stats: &StatisticalTests) -> Result<(), ThresholdViolation> {
        let max_bit_bias = self.bit_bias_limit(stats.sample_size);
        if stats.bit_bias.abs() > max_bit_bias {
            return Err(ThresholdViolation::BitBias {
                observed: stats.bit_bias,
                threshold: max_bit_bias,
            });
        }

        if stats.variance < self.min_variance {
            return Err(ThresholdViolation::LowVariance {
                observed: stats.variance,
                threshold: self.min_variance,
            });
        }

        let max_autocorrelation = self.autocorrelation_limit(stats.sample_size);
        if stats.autocorrelation.abs() > max_autocorrelation {
            return Err(ThresholdViolation::HighAutocorrelation {
                observed: stats.autocorrelation,
                threshold: max_autocorrelation,
            });
        }

        Ok(())
    }
}

/// Threshold violation types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdViolation {
    #[error("bit bias {observed:.4} exceeds threshold {threshold:.4}")]
    BitBias { observed: f64, threshold: f64 },

    #[error("variance {observed:.2} below threshold {threshold:.2}")]
    LowVariance { observed: f64, threshold: f64 },

    #[error("autocorrelation {observed:.4} exceeds threshold {threshold:.4}")]
    HighAutocorrelation { observed: f64, threshold: f64 },
}
