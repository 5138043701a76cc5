//! CPU execution-time jitter entropy source.
//!
//! Measures the wall-clock duration of a short memory-folding loop many
//! times. The low-order variation of consecutive durations comes from
//! cache state, pipeline behaviour, interrupts and scheduler activity.
//! Raw deltas are compressed with BLAKE3 into the output bytes.
//!
//! Jitter output is never credited at full rate: the claim is always
//! scaled by a derate factor strictly below 1.

use super::{EntropySample, EntropySource, SourceError, SourceKind, MAX_SAMPLE_LEN};
use crate::conditioning::{Conditioner, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Default fraction of conditioned output bits that is claimed as entropy.
pub const DEFAULT_DERATE_FACTOR: f64 = 0.5;

/// Largest accepted oversample ratio.
pub const MAX_OVERSAMPLE_RATIO: u32 = 128;

/// Samples taken by the startup self-test.
const SELF_TEST_SAMPLES: usize = 1024;

/// Share of stuck deltas above which the timer is considered unusable.
const MAX_STUCK_RATIO: f64 = 0.9;

/// Consecutive stuck deltas that fail the runtime repetition test.
const REPETITION_CUTOFF: usize = 256;

/// Words touched by each fold iteration.
const FOLD_WORDS: usize = 512;

/// Raw timing bytes hashed per conditioning update.
const RAW_BATCH_BYTES: usize = 4096;

/// Configuration for the jitter source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterConfig {
    /// Timing samples consumed per output bit.
    pub oversample_ratio: u32,
    /// Fraction of output bits claimed as entropy (0 < d < 1).
    #[serde(default = "default_derate")]
    pub derate_factor: f64,
}

fn default_derate() -> f64 {
    DEFAULT_DERATE_FACTOR
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            oversample_ratio: 3,
            derate_factor: DEFAULT_DERATE_FACTOR,
        }
    }
}

impl JitterConfig {
    /// Validates the ratio and derate factor.
    pub fn validate(&self) -> Result<(), String> {
        if self.oversample_ratio == 0 || self.oversample_ratio > MAX_OVERSAMPLE_RATIO {
            return Err(format!(
                "oversample_ratio must be 1-{}, got {}",
                MAX_OVERSAMPLE_RATIO, self.oversample_ratio
            ));
        }
        if !(self.derate_factor > 0.0 && self.derate_factor < 1.0) {
            return Err(format!(
                "derate_factor must be strictly between 0 and 1, got {}",
                self.derate_factor
            ));
        }
        Ok(())
    }

    /// Entropy claimed for `len` conditioned bytes.
    pub fn claim_for(&self, len: usize) -> u32 {
        let bits = (len as f64 * 8.0 * self.derate_factor).floor();
        bits.min(u32::MAX as f64) as u32
    }
}

/// The timing sampler behind [`JitterSource`].
pub struct JitterSampler {
    oversample_ratio: u32,
    memory: Vec<u64>,
    cursor: usize,
    last_delta: u64,
    conditioner: Conditioner,
}

impl JitterSampler {
    /// Creates a sampler and runs the startup self-test.
    pub fn new(oversample_ratio: u32) -> Result<Self, SourceError> {
        let mut sampler = Self {
            oversample_ratio: oversample_ratio.max(1),
            memory: (0..FOLD_WORDS as u64).collect(),
            cursor: 0,
            last_delta: 0,
            conditioner: Conditioner::new(HashAlgorithm::Blake3),
        };
        sampler.self_test()?;
        Ok(sampler)
    }

    /// Times one fold of the memory buffer.
    fn measure(&mut self) -> u64 {
        let start = Instant::now();
        let rounds = 1 + (self.last_delta & 0x7) as usize;
        let mut acc = self.last_delta;
        for _ in 0..rounds {
            for _ in 0..64 {
                self.cursor = (self.cursor + 67) % FOLD_WORDS;
                let word = self.memory[self.cursor];
                acc = acc.rotate_left(7) ^ word;
                self.memory[self.cursor] = word.wrapping_add(acc);
            }
        }
        std::hint::black_box(acc);
        start.elapsed().as_nanos() as u64
    }

    fn self_test(&mut self) -> Result<(), SourceError> {
        let mut zero = 0usize;
        let mut stuck = 0usize;
        let mut prev = self.measure();
        let mut prev_diff = 0i128;

        for _ in 0..SELF_TEST_SAMPLES {
            let delta = self.measure();
            if delta == 0 {
                zero += 1;
            }
            let diff = delta as i128 - prev as i128;
            if diff == 0 || diff == prev_diff {
                stuck += 1;
            }
            prev_diff = diff;
            prev = delta;
        }

        if zero == SELF_TEST_SAMPLES {
            return Err(SourceError::InitFailure(
                "timer resolution too coarse for jitter sampling".into(),
            ));
        }
        let ratio = stuck as f64 / SELF_TEST_SAMPLES as f64;
        if ratio > MAX_STUCK_RATIO {
            return Err(SourceError::InitFailure(format!(
                "jitter self-test failed: {:.0}% stuck deltas",
                ratio * 100.0
            )));
        }
        tracing::debug!(stuck_ratio = ratio, "Jitter self-test passed");
        Ok(())
    }

    /// Produces `len` conditioned bytes.
    ///
    /// Timings are hashed in fixed-size batches, so memory use does not
    /// grow with `len`.
    pub fn fill(&mut self, len: usize) -> Result<Vec<u8>, SourceError> {
        let samples = len * 8 * self.oversample_ratio as usize;
        let mut stream = self.conditioner.stream();
        let mut batch = Vec::with_capacity(RAW_BATCH_BYTES);
        let mut repeats = 0usize;

        for _ in 0..samples {
            let delta = self.measure();
            if delta == self.last_delta {
                repeats += 1;
                if repeats >= REPETITION_CUTOFF {
                    return Err(SourceError::IoFailure(format!(
                        "jitter repetition test failed after {} identical deltas",
                        repeats
                    )));
                }
            } else {
                repeats = 0;
            }
            let folded = delta ^ self.last_delta;
            batch.extend_from_slice(&(folded as u16).to_le_bytes());
            self.last_delta = delta;

            if batch.len() >= RAW_BATCH_BYTES {
                stream.update(&batch);
                batch.clear();
            }
        }
        stream.update(&batch);

        Ok(stream.finish(len))
    }
}

/// Entropy source that samples CPU execution-time jitter.
pub struct JitterSource {
    id: String,
    config: JitterConfig,
    sampler: Option<JitterSampler>,
}

impl JitterSource {
    /// Creates a jitter source after validating its configuration.
    pub fn new(id: impl Into<String>, config: JitterConfig) -> Result<Self, SourceError> {
        config.validate().map_err(SourceError::InitFailure)?;
        Ok(Self {
            id: id.into(),
            config,
            sampler: None,
        })
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }
}

impl EntropySource for JitterSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Jitter
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.sampler.is_none() {
            self.sampler = Some(JitterSampler::new(self.config.oversample_ratio)?);
            tracing::info!(
                source = %self.id,
                oversample_ratio = self.config.oversample_ratio,
                derate_factor = self.config.derate_factor,
                "Jitter sampler initialised"
            );
        }
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError> {
        let sampler = self.sampler.as_mut().ok_or(SourceError::NotOpen)?;
        let len = max_len.min(MAX_SAMPLE_LEN);
        let bytes = sampler.fill(len)?;
        let claim = self.config.claim_for(bytes.len());
        Ok(EntropySample::new(self.id.clone(), bytes, claim))
    }

    fn close(&mut self) {
        self.sampler = None;
    }

    fn is_open(&self) -> bool {
        self.sampler.is_some()
    }

    fn describe(&self) -> Vec<(String, String)> {
        vec![
            (
                "oversample_ratio".into(),
                self.config.oversample_ratio.to_string(),
            ),
            ("derate_factor".into(), self.config.derate_factor.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_derate_rejected() {
        let config = JitterConfig {
            oversample_ratio: 3,
            derate_factor: 1.0,
        };
        assert!(matches!(
            JitterSource::new("jitter", config),
            Err(SourceError::InitFailure(_))
        ));
    }

    #[test]
    fn test_zero_oversample_rejected() {
        let config = JitterConfig {
            oversample_ratio: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_claim_is_derated() {
        let config = JitterConfig::default();
        assert_eq!(config.claim_for(32), 128);
        assert!(config.claim_for(32) < 32 * 8);
    }

    #[test]
    fn test_read_returns_derated_sample() {
        let mut source = JitterSource::new("jitter", JitterConfig::default()).unwrap();
        source.open().unwrap();

        let sample = source.read(16).unwrap();
        assert_eq!(sample.len(), 16);
        assert_eq!(sample.claimed_entropy_bits, 64);
        assert!(u64::from(sample.claimed_entropy_bits) < sample.max_claim());
    }

    #[test]
    fn test_fill_spanning_several_batches() {
        let mut sampler = JitterSampler::new(4).unwrap();

        // 3200 timings at two raw bytes each span more than one batch.
        let first = sampler.fill(100).unwrap();
        let second = sampler.fill(100).unwrap();
        assert_eq!(first.len(), 100);
        assert_ne!(first, second);
    }

    #[test]
    fn test_read_before_open_fails() {
        let mut source = JitterSource::new("jitter", JitterConfig::default()).unwrap();
        assert!(matches!(source.read(8), Err(SourceError::NotOpen)));
        source.close();
        source.close();
    }
}
