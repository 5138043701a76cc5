//! Local view of the kernel pool's entropy estimate.

use crate::source::{KernelPoolSource, SourceError, MAX_SAMPLE_LEN};
use std::time::Instant;

/// Pool estimate refreshed once per cycle and credited locally between
/// refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntropyBudget {
    pub estimate_bits: u32,
    pub capacity_bits: u32,
    pub refreshed_at: Instant,
}

impl EntropyBudget {
    pub fn new(estimate_bits: u32, capacity_bits: u32) -> Self {
        Self {
            estimate_bits: estimate_bits.min(capacity_bits),
            capacity_bits,
            refreshed_at: Instant::now(),
        }
    }

    /// Reads the current estimate from the pool.
    pub fn refresh(pool: &mut KernelPoolSource) -> Result<Self, SourceError> {
        let capacity = pool.open()?;
        let estimate = pool.read()?;
        Ok(Self::new(estimate, capacity))
    }

    /// Adds bits the kernel has absorbed, saturating at capacity.
    pub fn credit(&mut self, bits: u32) {
        self.estimate_bits = self.estimate_bits.saturating_add(bits).min(self.capacity_bits);
    }

    pub fn below(&self, watermark: u32) -> bool {
        self.estimate_bits < watermark
    }

    /// Bytes to request from the next source:
    /// `min(ceil((high - estimate) / 8), max_read_bytes, 65535)`, at least 1.
    pub fn request_len(&self, high_watermark: u32, max_read_bytes: usize) -> usize {
        let deficit = high_watermark.saturating_sub(self.estimate_bits);
        let bytes = deficit.div_ceil(8) as usize;
        bytes.min(max_read_bytes).min(MAX_SAMPLE_LEN).max(1)
    }
}
