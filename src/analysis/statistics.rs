//! Statistical tests over sample bytes.
//!
//! Passing these tests is necessary but not sufficient for good entropy.

/// Statistical test results.
#[derive(Debug, Clone)]
pub struct StatisticalTests {
    /// Bit bias (fraction of one bits minus 0.5).
    pub bit_bias: f64,
    /// Byte-level variance.
    pub variance: f64,
    /// Lag-1 autocorrelation.
    pub autocorrelation: f64,
    /// Number of bytes analyzed.
    pub sample_size: usize,
}

impl StatisticalTests {
    /// Runs all statistical tests on `data`.
    pub fn analyze(data: &[u8]) -> Self {
        Self {
            bit_bias: Self::compute_bit_bias(data),
            variance: Self::compute_variance(data),
            autocorrelation: Self::compute_autocorrelation(data),
            sample_size: data.len(),
        }
    }

    fn compute_bit_bias(data: &[u8]) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let ones: u64 = data.iter().map(|b| u64::from(b.count_ones())).sum();
        ones as f64 / (data.len() as f64 * 8.0) - 0.5
    }

    fn compute_variance(data: &[u8]) -> f64 {
        if data.is_empty() {
            return 0.0;
        }

        let n = data.len() as f64;
        let mean: f64 = data.iter().map(|&b| b as f64).sum::<f64>() / n;
        data.iter().map(|&b| (b as f64 - mean).powi(2)).sum::<f64>() / n
    }

    /// Correlation between consecutive bytes. High values indicate
    /// predictable patterns.
    fn compute_autocorrelation(data: &[u8]) -> f64 {
        if data.len() < 2 {
            return 0.0;
        }

        let n = data.len() as f64;
        let mean: f64 = data.iter().map(|&b| b as f64).sum::<f64>() / n;

        let variance: f64 = data.iter().map(|&b| (b as f64 - mean).powi(2)).sum::<f64>();

        if variance == 0.0 {
            return 1.0; // constant input
        }

        let covariance: f64 = data
            .windows(2)
            .map(|w| (w[0] as f64 - mean) * (w[1] as f64 - mean))
            .sum();

        covariance / variance
    }
}
