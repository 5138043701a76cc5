//! Character-device entropy source such as `/dev/hwrng`.

use super::{EntropySample, EntropySource, SourceError, SourceKind, MAX_SAMPLE_LEN};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

/// Configuration for a device file source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFileConfig {
    /// Device to read from.
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Entropy claimed per byte read (0-8).
    #[serde(default)]
    pub bits_per_byte: u8,
}

fn default_path() -> PathBuf {
    PathBuf::from("/dev/hwrng")
}

impl Default for DeviceFileConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            bits_per_byte: 0,
        }
    }
}

/// Reads random bytes from a character device.
pub struct DeviceFileSource {
    id: String,
    config: DeviceFileConfig,
    file: Option<File>,
}

impl DeviceFileSource {
    pub fn new(id: impl Into<String>, config: DeviceFileConfig) -> Self {
        Self {
            id: id.into(),
            config,
            file: None,
        }
    }
}

impl EntropySource for DeviceFileSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::DeviceFile
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.file.is_some() {
            return Ok(());
        }
        if self.config.bits_per_byte > 8 {
            return Err(SourceError::InitFailure(format!(
                "bits_per_byte {} exceeds 8",
                self.config.bits_per_byte
            )));
        }
        let file = File::open(&self.config.path).map_err(|e| {
            SourceError::SourceUnavailable(format!("{}: {}", self.config.path.display(), e))
        })?;
        tracing::info!(source = %self.id, device = %self.config.path.display(), "Device opened");
        self.file = Some(file);
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError> {
        let file = self.file.as_mut().ok_or(SourceError::NotOpen)?;
        let mut buf = vec![0u8; max_len.min(MAX_SAMPLE_LEN)];
        let n = file.read(&mut buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(SourceError::IoFailure("device returned end of file".into()));
        }
        buf.truncate(n);
        let claim = (n as u64 * u64::from(self.config.bits_per_byte)).min(u64::from(u32::MAX));
        Ok(EntropySample::new(self.id.clone(), buf, claim as u32))
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn describe(&self) -> Vec<(String, String)> {
        vec![("path".into(), self.config.path.display().to_string())]
    }
}
