//! Entropy Feeder Library
//!
//! Drains hardware and software randomness sources into the kernel
//! entropy pool while it is running low, crediting only what each source
//! can justify.
//!
//! # Architecture
//!
//! The system follows an explicit data flow:
//!
//! ```text
//! source → scheduler → accounting → feedback → kernel pool
//!             ↑             ↓
//!        pool estimate   analysis (health screen)
//! ```
//!
//! # Design Principles
//!
//! - **Conservative credit**: only trusted, healthy samples are credited;
//!   everything else is mixed in without accounting
//! - **Never overclaim**: a sample cannot claim more than 8 bits per byte
//! - **Supplements OS entropy**: the kernel CSPRNG stays the consumer-facing
//!   generator; this crate only feeds it
//! - **Isolated sources**: a misbehaving source backs off or is disabled
//!   without stalling the others
//!
//! # Example
//!
//! ```no_run
//! use entropy_feeder::{
//!     accounting::{AccountingConfig, EntropyAccountant, TrustLevel},
//!     feedback::{KernelFeedback, MockPoolDevice, SharedPoolDevice},
//!     scheduler::{ScheduledSource, Scheduler, SchedulerConfig},
//!     source::{JitterConfig, JitterSource, KernelPoolSource},
//! };
//!
//! let device = SharedPoolDevice::new(MockPoolDevice::new(64, 256));
//! let feedback = KernelFeedback::with_reseed_window(device.clone(), Default::default());
//! let pool = KernelPoolSource::new(device);
//!
//! let jitter = JitterSource::new("jitter", JitterConfig::default()).unwrap();
//! let accountant = EntropyAccountant::new(AccountingConfig::default())
//!     .with_trust("jitter", TrustLevel::Trusted);
//!
//! let mut scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     vec![ScheduledSource::new(Box::new(jitter))],
//!     accountant,
//!     feedback,
//!     pool,
//! )
//! .unwrap();
//!
//! let report = scheduler.run_cycle();
//! println!("credited {} bits", report.accounted_bits);
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod accounting;
pub mod analysis;
pub mod conditioning;
pub mod config;
pub mod feedback;
pub mod metrics;
pub mod scheduler;
pub mod source;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use accounting::{AcceptedSample, EntropyAccountant, TrustLevel};
pub use analysis::{HealthMetrics, HealthMonitor, QualityThresholds};
pub use conditioning::{Conditioner, HashAlgorithm};
pub use config::{ConfigError, FileConfig};
pub use feedback::{KernelFeedback, LinuxPoolDevice, PoolDevice, SharedPoolDevice};
pub use scheduler::{ScheduledSource, Scheduler, SchedulerConfig, SchedulerHandle};
pub use source::{Credential, EntropySample, EntropySource, SourceError, SourceKind};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
