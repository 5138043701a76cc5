//! Entropy conditioning via cryptographic hashing.
//!
//! Raw timing measurements and CPU generator words are biased and
//! correlated. Sources that produce such material run it through a
//! [`Conditioner`] before handing bytes to the accountant.

mod hash;

pub use hash::{Conditioner, ConditioningStream, HashAlgorithm};
