//! Read-only view of the kernel pool's entropy estimate.

use super::SourceError;
use crate::feedback::SharedPoolDevice;

/// Reports the kernel's current entropy estimate.
///
/// Reading never consumes entropy; it only queries the counter.
pub struct KernelPoolSource {
    device: SharedPoolDevice,
    capacity: Option<u32>,
}

impl KernelPoolSource {
    pub fn new(device: SharedPoolDevice) -> Self {
        Self {
            device,
            capacity: None,
        }
    }

    /// Queries and caches the pool capacity.
    pub fn open(&mut self) -> Result<u32, SourceError> {
        if let Some(capacity) = self.capacity {
            return Ok(capacity);
        }
        let capacity = self
            .device
            .lock()
            .and_then(|mut d| d.capacity())
            .map_err(|e| SourceError::SourceUnavailable(e.to_string()))?;
        tracing::debug!(capacity, "Kernel pool capacity");
        self.capacity = Some(capacity);
        Ok(capacity)
    }

    /// Current entropy estimate in bits.
    pub fn read(&mut self) -> Result<u32, SourceError> {
        self.device
            .lock()
            .and_then(|mut d| d.entropy_count())
            .map_err(SourceError::from)
    }

    /// Pool capacity, if [`open`](Self::open) succeeded.
    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    pub fn close(&mut self) {
        self.capacity = None;
    }

    pub fn is_open(&self) -> bool {
        self.capacity.is_some()
    }
}
