//! Entropy accounting.
//!
//! Decides how much entropy credit, if any, a sample earns before it is
//! written to the kernel pool.

mod accountant;

pub use accountant::{
    AcceptedSample, AccountingConfig, AccountingError, AccountingStats, EntropyAccountant,
    TrustLevel, UnaccountedReason,
};
