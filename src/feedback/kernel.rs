//! Serialised writer for the kernel entropy pool.

use super::device::{SharedPoolDevice, MAX_ACCOUNTED_WRITE};
use crate::accounting::AcceptedSample;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned by the kernel feedback path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedbackError {
    #[error("kernel rejected submission: {reason}")]
    KernelRejected { reason: String },
}

impl FeedbackError {
    fn rejected(reason: impl Into<String>) -> Self {
        Self::KernelRejected {
            reason: reason.into(),
        }
    }
}

/// Kernel feedback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Destination pool device.
    pub device_path: PathBuf,
    /// Reseed requests closer together than this are coalesced.
    pub reseed_window_ms: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/random"),
            reseed_window_ms: 1000,
        }
    }
}

/// Cumulative counters of what reached the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackStats {
    pub accounted_bits: u64,
    pub accounted_bytes: u64,
    pub unaccounted_bytes: u64,
    pub reseeds: u64,
    pub rejections: u64,
}

#[derive(Default)]
struct Counters {
    accounted_bits: AtomicU64,
    accounted_bytes: AtomicU64,
    unaccounted_bytes: AtomicU64,
    reseeds: AtomicU64,
    rejections: AtomicU64,
}

/// Writes entropy into the kernel pool and requests reseeds.
///
/// Every operation holds the shared device lock for its whole duration,
/// so accounted writes, raw writes and reseeds never interleave.
pub struct KernelFeedback {
    device: SharedPoolDevice,
    reseed_window: Duration,
    last_reseed: Mutex<Option<Instant>>,
    counters: Counters,
}

impl KernelFeedback {
    pub fn new(device: SharedPoolDevice, config: &FeedbackConfig) -> Self {
        Self::with_reseed_window(device, Duration::from_millis(config.reseed_window_ms))
    }

    pub fn with_reseed_window(device: SharedPoolDevice, reseed_window: Duration) -> Self {
        Self {
            device,
            reseed_window,
            last_reseed: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// The shared device this writer feeds.
    pub fn device(&self) -> &SharedPoolDevice {
        &self.device
    }

    fn reject(&self, reason: impl Into<String>) -> FeedbackError {
        self.counters.rejections.fetch_add(1, Ordering::Relaxed);
        let err = FeedbackError::rejected(reason);
        tracing::warn!(error = %err, "Pool submission rejected");
        err
    }

    /// Mixes `bytes` into the pool and credits `bits` of entropy.
    ///
    /// The sample is handed to the kernel in one request: it is either
    /// absorbed whole or not at all.
    pub fn submit_accounted(&self, bits: u32, bytes: &[u8]) -> Result<(), FeedbackError> {
        if bytes.len() > MAX_ACCOUNTED_WRITE {
            return Err(self.reject(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_ACCOUNTED_WRITE
            )));
        }
        if u64::from(bits) > bytes.len() as u64 * 8 {
            return Err(self.reject(format!(
                "{} bits claimed for {} bytes",
                bits,
                bytes.len()
            )));
        }

        let mut device = self.device.lock().map_err(|e| self.reject(e.to_string()))?;
        device
            .add_entropy(bits, bytes)
            .map_err(|e| self.reject(e.to_string()))?;
        drop(device);

        self.counters
            .accounted_bits
            .fetch_add(u64::from(bits), Ordering::Relaxed);
        self.counters
            .accounted_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        tracing::debug!(bits, bytes = bytes.len(), "Accounted entropy submitted");
        Ok(())
    }

    /// Mixes `bytes` into the pool without entropy credit.
    pub fn submit_unaccounted(&self, bytes: &[u8]) -> Result<(), FeedbackError> {
        if bytes.len() > MAX_ACCOUNTED_WRITE {
            return Err(self.reject(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_ACCOUNTED_WRITE
            )));
        }

        let mut device = self.device.lock().map_err(|e| self.reject(e.to_string()))?;
        device
            .write_unaccounted(bytes)
            .map_err(|e| self.reject(e.to_string()))?;
        drop(device);

        self.counters
            .unaccounted_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        tracing::debug!(bytes = bytes.len(), "Unaccounted entropy submitted");
        Ok(())
    }

    /// Submits an accountant decision through the matching path.
    pub fn submit(&self, accepted: &AcceptedSample) -> Result<(), FeedbackError> {
        match accepted {
            AcceptedSample::Accounted { bits, bytes, .. } => self.submit_accounted(*bits, bytes),
            AcceptedSample::Unaccounted { bytes, .. } => self.submit_unaccounted(bytes),
        }
    }

    /// Forces the CSPRNG to reseed.
    ///
    /// Requests arriving within the reseed window of the last effective
    /// one succeed without touching the device.
    pub fn trigger_reseed(&self) -> Result<(), FeedbackError> {
        let mut device = self.device.lock().map_err(|e| self.reject(e.to_string()))?;
        let mut last = self
            .last_reseed
            .lock()
            .map_err(|_| self.reject("reseed state lock poisoned"))?;

        if let Some(at) = *last {
            if at.elapsed() < self.reseed_window {
                tracing::trace!("Reseed coalesced");
                return Ok(());
            }
        }

        device.reseed().map_err(|e| self.reject(e.to_string()))?;
        *last = Some(Instant::now());
        self.counters.reseeds.fetch_add(1, Ordering::Relaxed);
        tracing::info!("CSPRNG reseed triggered");
        Ok(())
    }

    /// Snapshot of the cumulative counters.
    pub fn stats(&self) -> FeedbackStats {
        FeedbackStats {
            accounted_bits: self.counters.accounted_bits.load(Ordering::Relaxed),
            accounted_bytes: self.counters.accounted_bytes.load(Ordering::Relaxed),
            unaccounted_bytes: self.counters.unaccounted_bytes.load(Ordering::Relaxed),
            reseeds: self.counters.reseeds.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
        }
    }
}
