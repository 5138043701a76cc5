//! Kernel pool feedback.
//!
//! This module owns the path from an accepted sample to the OS entropy
//! pool: the device abstraction and the serialised writer on top of it.

mod device;
mod kernel;

pub use device::{
    DeviceCall, LinuxPoolDevice, MockPoolDevice, PoolDevice, SharedPoolDevice,
    MAX_ACCOUNTED_WRITE,
};
pub use kernel::{FeedbackConfig, FeedbackError, FeedbackStats, KernelFeedback};
