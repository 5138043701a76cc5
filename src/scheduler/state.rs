//! Per-source lifecycle state and backoff policy.

use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of a scheduled source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// Not opened yet; opened lazily on first drain.
    Closed,
    Open,
    Authenticated,
    /// A read is in flight on a worker.
    Reading,
    /// Last read succeeded.
    Idle,
    /// Failed recently; not retried before `backoff_until`.
    Faulted { backoff_until: Instant, failures: u32 },
    /// Closed after too many failures. Only a reset revives it.
    Disabled { failures: u32, reason: String },
}

impl SourceState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Authenticated => "authenticated",
            Self::Reading => "reading",
            Self::Idle => "idle",
            Self::Faulted { .. } => "faulted",
            Self::Disabled { .. } => "disabled",
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled { .. })
    }

    /// True while a faulted source is still backing off at `now`.
    pub fn backing_off(&self, now: Instant) -> bool {
        matches!(self, Self::Faulted { backoff_until, .. } if now < *backoff_until)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Faulted { failures, .. } => write!(f, "faulted ({} failures)", failures),
            Self::Disabled { reason, .. } => write!(f, "disabled: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Exponential backoff capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay after the `failures`-th consecutive failure:
    /// `min(base * 2^(failures - 1), max)`.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}
