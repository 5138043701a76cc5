//! Entropy source abstraction.
//!
//! Every randomness producer the scheduler can drain implements
//! [`EntropySource`]. A source object owns its session state: `open`
//! creates it, `close` drops it, and anything in between fails with
//! [`SourceError::NotOpen`] once the session is gone.
//!
//! The kernel pool itself is modelled by [`KernelPoolSource`], which
//! reports the current fill estimate instead of producing samples.

mod agent;
pub mod assuan;
mod cpu;
mod device;
mod jitter;
mod kernel;
mod token;

#[cfg(feature = "pkcs11")]
mod pkcs11;

pub use agent::{AgentConfig, AgentConnector, SmartcardAgentSource};
pub use cpu::{CpuInstruction, CpuRngConfig, CpuRngSource};
pub use device::{DeviceFileConfig, DeviceFileSource};
pub use jitter::{JitterConfig, JitterSampler, JitterSource, DEFAULT_DERATE_FACTOR};
pub use kernel::KernelPoolSource;
pub use token::{
    HardwareTokenSource, ModuleLoader, SlotIdentity, SlotInfo, TokenConfig, TokenModule,
};

#[cfg(feature = "pkcs11")]
pub use pkcs11::Pkcs11Module;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Upper bound on the bytes a single sample may carry.
///
/// Matches the size ceiling of the kernel's accounted-write request.
pub const MAX_SAMPLE_LEN: usize = 65535;

/// Errors reported by entropy sources.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("source initialisation failed: {0}")]
    InitFailure(String),
    #[error("authentication required before reading")]
    AuthRequired,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("I/O failure: {0}")]
    IoFailure(String),
    #[error("read timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("source is not open")]
    NotOpen,
    #[error("operation not supported by {0} sources")]
    Unsupported(SourceKind),
}

impl SourceError {
    /// Returns true for failures that are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::IoFailure(_) | Self::Timeout(_) | Self::SourceUnavailable(_)
        )
    }

    /// Returns true for failures that call for re-authentication.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRequired | Self::AuthFailed(_))
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        Self::IoFailure(e.to_string())
    }
}

/// The family a source belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HardwareToken,
    Jitter,
    SmartcardAgent,
    KernelPool,
    CpuRng,
    DeviceFile,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::HardwareToken => "hardware_token",
            Self::Jitter => "jitter",
            Self::SmartcardAgent => "smartcard_agent",
            Self::KernelPool => "kernel_pool",
            Self::CpuRng => "cpu_rng",
            Self::DeviceFile => "device_file",
        })
    }
}

/// A chunk of randomness together with the entropy its source claims for it.
#[derive(Clone, PartialEq, Eq)]
pub struct EntropySample {
    /// Identifier of the producing source.
    pub source_id: String,
    /// Random bytes, at most [`MAX_SAMPLE_LEN`].
    pub bytes: Vec<u8>,
    /// Bits of entropy the source claims for `bytes`.
    pub claimed_entropy_bits: u32,
}

impl EntropySample {
    /// Creates a sample.
    ///
    /// No validation happens here; the accountant is responsible for
    /// rejecting claims larger than the byte count supports.
    pub fn new(source_id: impl Into<String>, bytes: Vec<u8>, claimed_entropy_bits: u32) -> Self {
        Self {
            source_id: source_id.into(),
            bytes,
            claimed_entropy_bits,
        }
    }

    /// Creates a sample claiming full entropy (8 bits per byte).
    pub fn full(source_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        let bits = max_entropy_bits(bytes.len());
        Self::new(source_id, bytes, bits)
    }

    /// Number of bytes carried.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the sample carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Largest claim the byte count can support.
    #[inline]
    pub fn max_claim(&self) -> u64 {
        self.bytes.len() as u64 * 8
    }
}

impl fmt::Debug for EntropySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntropySample")
            .field("source_id", &self.source_id)
            .field("len", &self.bytes.len())
            .field("claimed_entropy_bits", &self.claimed_entropy_bits)
            .finish_non_exhaustive()
    }
}

/// Full-entropy claim for `len` bytes, saturating at `u32::MAX`.
pub(crate) fn max_entropy_bits(len: usize) -> u32 {
    u32::try_from(len.saturating_mul(8)).unwrap_or(u32::MAX)
}

/// Login role for sources that support authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    SecurityOfficer,
}

/// Credential presented to [`EntropySource::authenticate`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub role: Role,
    pub pin: String,
}

impl Credential {
    pub fn new(role: Role, pin: impl Into<String>) -> Self {
        Self {
            role,
            pin: pin.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("role", &self.role)
            .field("pin", &"<redacted>")
            .finish()
    }
}

/// Trait for entropy source implementations.
///
/// Configuration is supplied when the source is constructed; `open`
/// establishes the session lazily so the scheduler controls when
/// hardware is touched.
pub trait EntropySource: Send {
    /// Stable identifier used for accounting and logging.
    fn id(&self) -> &str;

    /// The source family.
    fn kind(&self) -> SourceKind;

    /// Opens the underlying device or session.
    fn open(&mut self) -> Result<(), SourceError>;

    /// Whether reads require a prior successful [`authenticate`](Self::authenticate).
    fn requires_authentication(&self) -> bool {
        false
    }

    /// Authenticates an open session.
    fn authenticate(&mut self, _credential: &Credential) -> Result<(), SourceError> {
        Err(SourceError::Unsupported(self.kind()))
    }

    /// Reads at most `max_len` bytes. Fewer may be returned.
    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError>;

    /// Releases the session. Calling it on a closed source does nothing.
    fn close(&mut self);

    /// Checks if the source currently holds an open session.
    fn is_open(&self) -> bool;

    /// Key/value diagnostics about the opened device.
    fn describe(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}
