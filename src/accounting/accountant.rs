//! Overclaim validation, trust routing and the health screen.

use crate::analysis::{HealthMonitor, QualityThresholds, ThresholdViolation};
use crate::source::EntropySample;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Whether a source's entropy claims are believed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    #[default]
    Untrusted,
}

/// Accountant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Trusted samples shorter than this skip the health screen.
    pub min_screen_bytes: usize,
    /// Passing samples needed before a trusted source earns credit.
    pub healthy_streak: u64,
    /// Screen limits.
    pub thresholds: QualityThresholds,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            min_screen_bytes: 64,
            healthy_streak: 1,
            thresholds: QualityThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountingError {
    #[error("source {source_id} claimed {claimed} bits for a sample worth at most {max}")]
    OverclaimedEntropy {
        source_id: String,
        claimed: u64,
        max: u64,
    },
}

/// Why a sample is mixed without credit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnaccountedReason {
    Untrusted,
    FailedScreen(ThresholdViolation),
    /// The screen passed but the source has not yet earned a healthy streak.
    AwaitingHealthyStreak,
}

/// Accountant decision for one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptedSample {
    /// Mix and credit `bits` of entropy.
    Accounted {
        source_id: String,
        bits: u32,
        bytes: Vec<u8>,
    },
    /// Mix without credit.
    Unaccounted {
        source_id: String,
        bytes: Vec<u8>,
        reason: UnaccountedReason,
    },
}

impl AcceptedSample {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Accounted { source_id, .. } | Self::Unaccounted { source_id, .. } => source_id,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Accounted { bytes, .. } | Self::Unaccounted { bytes, .. } => bytes,
        }
    }

    /// Bits credited to the pool; zero when unaccounted.
    pub fn accounted_bits(&self) -> u32 {
        match self {
            Self::Accounted { bits, .. } => *bits,
            Self::Unaccounted { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountingStats {
    pub accounted: u64,
    pub unaccounted: u64,
    pub overclaims: u64,
    pub downgrades: u64,
}

/// Routes samples to accounted or unaccounted submission.
pub struct EntropyAccountant {
    config: AccountingConfig,
    trust: HashMap<String, TrustLevel>,
    monitors: HashMap<String, HealthMonitor>,
    stats: AccountingStats,
}

impl EntropyAccountant {
    pub fn new(config: AccountingConfig) -> Self {
        Self {
            config,
            trust: HashMap::new(),
            monitors: HashMap::new(),
            stats: AccountingStats::default(),
        }
    }

    /// Records the trust level of a source, replacing any earlier one.
    pub fn set_trust(&mut self, source_id: impl Into<String>, trust: TrustLevel) {
        self.trust.insert(source_id.into(), trust);
    }

    pub fn with_trust(mut self, source_id: impl Into<String>, trust: TrustLevel) -> Self {
        self.set_trust(source_id, trust);
        self
    }

    /// Trust of `source_id`; unknown sources are untrusted.
    pub fn trust_of(&self, source_id: &str) -> TrustLevel {
        self.trust.get(source_id).copied().unwrap_or_default()
    }

    /// Validates a sample and decides how it is credited.
    pub fn accept(&mut self, sample: EntropySample) -> Result<AcceptedSample, AccountingError> {
        let max = sample.max_claim();
        let claimed = u64::from(sample.claimed_entropy_bits);
        if claimed > max {
            self.stats.overclaims += 1;
            tracing::warn!(
                source = %sample.source_id,
                claimed,
                max,
                "Sample overclaims entropy; rejected"
            );
            return Err(AccountingError::OverclaimedEntropy {
                source_id: sample.source_id,
                claimed,
                max,
            });
        }

        let EntropySample {
            source_id,
            bytes,
            claimed_entropy_bits: bits,
        } = sample;

        if self.trust_of(&source_id) == TrustLevel::Untrusted {
            return Ok(self.unaccounted(source_id, bytes, UnaccountedReason::Untrusted));
        }

        if bytes.len() >= self.config.min_screen_bytes {
            let monitor = self.monitors.entry(source_id.clone()).or_insert_with(|| {
                HealthMonitor::new(
                    source_id.clone(),
                    self.config.thresholds.clone(),
                    self.config.healthy_streak,
                )
            });
            let metrics = monitor.analyze(&bytes);
            if !metrics.is_healthy {
                let reason = match &metrics.last_violation {
                    Some(violation) => UnaccountedReason::FailedScreen(violation.clone()),
                    None => UnaccountedReason::AwaitingHealthyStreak,
                };
                self.stats.downgrades += 1;
                tracing::debug!(source = %source_id, reason = ?reason, "Sample downgraded");
                return Ok(self.unaccounted(source_id, bytes, reason));
            }
        }

        self.stats.accounted += 1;
        Ok(AcceptedSample::Accounted {
            source_id,
            bits,
            bytes,
        })
    }

    fn unaccounted(
        &mut self,
        source_id: String,
        bytes: Vec<u8>,
        reason: UnaccountedReason,
    ) -> AcceptedSample {
        self.stats.unaccounted += 1;
        AcceptedSample::Unaccounted {
            source_id,
            bytes,
            reason,
        }
    }

    /// Forgets the health history of a source.
    pub fn reset_source(&mut self, source_id: &str) {
        if let Some(monitor) = self.monitors.get_mut(source_id) {
            monitor.reset();
        }
    }

    /// Whether `source_id` currently passes its health screen, if it has
    /// been screened at all.
    pub fn is_healthy(&self, source_id: &str) -> Option<bool> {
        self.monitors.get(source_id).map(HealthMonitor::is_healthy)
    }

    pub fn stats(&self) -> AccountingStats {
        self.stats
    }
}
