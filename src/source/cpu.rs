//! CPU hardware random number generator (RDSEED / RDRAND).
//!
//! RDSEED is preferred; RDRAND is used when the CPU lacks it. Raw words
//! are compressed with SHA-256 at `input_ratio` raw bytes per output
//! byte, so a weakened generator still has to produce a lot of output to
//! influence a single byte.

use super::{EntropySample, EntropySource, SourceError, SourceKind, MAX_SAMPLE_LEN};
use crate::conditioning::{Conditioner, HashAlgorithm};
use serde::{Deserialize, Serialize};

/// Attempts per 64-bit word before giving up on an exhausted generator.
const RETRY_LIMIT: usize = 128;

/// Configuration for the CPU generator source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuRngConfig {
    /// Raw generator bytes compressed into each output byte.
    #[serde(default = "default_input_ratio")]
    pub input_ratio: u32,
}

fn default_input_ratio() -> u32 {
    16
}

impl Default for CpuRngConfig {
    fn default() -> Self {
        Self {
            input_ratio: default_input_ratio(),
        }
    }
}

/// Which instruction backs the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuInstruction {
    Rdseed,
    Rdrand,
}

#[cfg(target_arch = "x86_64")]
#[allow(unsafe_code)]
mod hw {
    use super::{CpuInstruction, RETRY_LIMIT};
    use std::arch::x86_64::{_rdrand64_step, _rdseed64_step};

    pub fn detect() -> Option<CpuInstruction> {
        if std::is_x86_feature_detected!("rdseed") {
            Some(CpuInstruction::Rdseed)
        } else if std::is_x86_feature_detected!("rdrand") {
            Some(CpuInstruction::Rdrand)
        } else {
            None
        }
    }

    #[target_feature(enable = "rdseed")]
    unsafe fn rdseed_step(out: &mut u64) -> bool {
        _rdseed64_step(out) == 1
    }

    #[target_feature(enable = "rdrand")]
    unsafe fn rdrand_step(out: &mut u64) -> bool {
        _rdrand64_step(out) == 1
    }

    pub fn next_word(instruction: CpuInstruction) -> Option<u64> {
        let mut word = 0u64;
        for _ in 0..RETRY_LIMIT {
            // SAFETY: `detect` confirmed the instruction is supported.
            let ok = unsafe {
                match instruction {
                    CpuInstruction::Rdseed => rdseed_step(&mut word),
                    CpuInstruction::Rdrand => rdrand_step(&mut word),
                }
            };
            if ok {
                return Some(word);
            }
            std::hint::spin_loop();
        }
        None
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod hw {
    use super::CpuInstruction;

    pub fn detect() -> Option<CpuInstruction> {
        None
    }

    pub fn next_word(_instruction: CpuInstruction) -> Option<u64> {
        None
    }
}

/// Entropy source reading the CPU's built-in generator.
pub struct CpuRngSource {
    id: String,
    config: CpuRngConfig,
    instruction: Option<CpuInstruction>,
    conditioner: Conditioner,
}

impl CpuRngSource {
    pub fn new(id: impl Into<String>, config: CpuRngConfig) -> Self {
        Self {
            id: id.into(),
            config,
            instruction: None,
            conditioner: Conditioner::new(HashAlgorithm::Sha256),
        }
    }

    pub fn instruction(&self) -> Option<CpuInstruction> {
        self.instruction
    }
}

impl EntropySource for CpuRngSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::CpuRng
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.instruction.is_some() {
            return Ok(());
        }
        let instruction = hw::detect().ok_or_else(|| {
            SourceError::SourceUnavailable("CPU has no RDSEED or RDRAND support".into())
        })?;
        // A generator that cannot deliver one word at open time is broken.
        hw::next_word(instruction).ok_or_else(|| {
            SourceError::InitFailure(format!("{:?} returned no data", instruction))
        })?;
        tracing::info!(source = %self.id, instruction = ?instruction, "CPU generator ready");
        self.instruction = Some(instruction);
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError> {
        let instruction = self.instruction.ok_or(SourceError::NotOpen)?;
        let len = max_len.min(MAX_SAMPLE_LEN);
        let raw_len = len * self.config.input_ratio.max(1) as usize;

        let mut raw = Vec::with_capacity(raw_len + 8);
        while raw.len() < raw_len {
            let word = hw::next_word(instruction).ok_or_else(|| {
                SourceError::IoFailure(format!("{:?} exhausted after retries", instruction))
            })?;
            raw.extend_from_slice(&word.to_le_bytes());
        }

        let bytes = self.conditioner.condition(&raw, len);
        Ok(EntropySample::full(self.id.clone(), bytes))
    }

    fn close(&mut self) {
        self.instruction = None;
    }

    fn is_open(&self) -> bool {
        self.instruction.is_some()
    }

    fn describe(&self) -> Vec<(String, String)> {
        match self.instruction {
            Some(i) => vec![("instruction".into(), format!("{:?}", i))],
            None => Vec::new(),
        }
    }
}
