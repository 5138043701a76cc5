//! Configuration file loading.
//!
//! Every section has serde defaults, so a file only needs its
//! `[[sources]]` entries.

use crate::accounting::{AccountingConfig, EntropyAccountant, TrustLevel};
use crate::feedback::FeedbackConfig;
use crate::scheduler::{ScheduledSource, SchedulerConfig};
use crate::source::{
    AgentConfig, CpuRngConfig, CpuRngSource, Credential, DeviceFileConfig, DeviceFileSource,
    EntropySource, HardwareTokenSource, JitterConfig, JitterSource, Role, SmartcardAgentSource,
    SourceKind, TokenConfig, MAX_SAMPLE_LEN,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// HTTP port for `/metrics`; 0 disables the exporter.
    pub port: u16,
}

/// Where an authentication PIN comes from.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    /// Environment variable holding the PIN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_env: Option<String>,
}

impl CredentialConfig {
    /// Resolves the PIN. An inline `pin` wins over `pin_env`.
    pub fn resolve(&self) -> Result<Credential, ConfigError> {
        if let Some(pin) = &self.pin {
            return Ok(Credential::new(self.role, pin.clone()));
        }
        let var = self
            .pin_env
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("credential needs pin or pin_env".into()))?;
        let pin = std::env::var(var).map_err(|_| {
            ConfigError::Invalid(format!("environment variable {} is not set", var))
        })?;
        Ok(Credential::new(self.role, pin))
    }
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("role", &self.role)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .field("pin_env", &self.pin_env)
            .finish()
    }
}

/// Kind-specific source settings, selected by the `kind` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    HardwareToken(TokenConfig),
    Jitter(JitterConfig),
    SmartcardAgent(AgentConfig),
    CpuRng(CpuRngConfig),
    DeviceFile(DeviceFileConfig),
}

impl SourceSettings {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::HardwareToken(_) => SourceKind::HardwareToken,
            Self::Jitter(_) => SourceKind::Jitter,
            Self::SmartcardAgent(_) => SourceKind::SmartcardAgent,
            Self::CpuRng(_) => SourceKind::CpuRng,
            Self::DeviceFile(_) => SourceKind::DeviceFile,
        }
    }
}

fn default_max_read_bytes() -> usize {
    256
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub trust: TrustLevel,
    /// Lower values are drained first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,
    #[serde(flatten)]
    pub settings: SourceSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialConfig>,
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(format!("source {}: {}", self.id, msg));

        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("source id must not be empty".into()));
        }
        if self.max_read_bytes == 0 || self.max_read_bytes > MAX_SAMPLE_LEN {
            return Err(invalid(format!(
                "max_read_bytes {} outside 1..={}",
                self.max_read_bytes, MAX_SAMPLE_LEN
            )));
        }
        if let Some(credential) = &self.credential {
            if credential.pin.is_none() && credential.pin_env.is_none() {
                return Err(invalid("credential needs pin or pin_env".into()));
            }
            if !matches!(
                self.settings,
                SourceSettings::HardwareToken(_) | SourceSettings::SmartcardAgent(_)
            ) {
                return Err(invalid(format!(
                    "{} sources do not take a credential",
                    self.settings.kind()
                )));
            }
        }

        match &self.settings {
            SourceSettings::Jitter(jitter) => jitter.validate().map_err(invalid)?,
            SourceSettings::DeviceFile(device) if device.bits_per_byte > 8 => {
                return Err(invalid(format!(
                    "bits_per_byte {} exceeds 8",
                    device.bits_per_byte
                )));
            }
            SourceSettings::CpuRng(cpu) if cpu.input_ratio == 0 => {
                return Err(invalid("input_ratio must be non-zero".into()));
            }
            _ => {}
        }
        Ok(())
    }

    /// Constructs the bare source. Nothing is opened yet.
    pub fn build_source(&self) -> Result<Box<dyn EntropySource>, ConfigError> {
        let id = self.id.clone();
        let source: Box<dyn EntropySource> = match &self.settings {
            SourceSettings::HardwareToken(c) => Box::new(HardwareTokenSource::new(id, c.clone())),
            SourceSettings::Jitter(c) => Box::new(
                JitterSource::new(id, c.clone())
                    .map_err(|e| ConfigError::Invalid(format!("source {}: {}", self.id, e)))?,
            ),
            SourceSettings::SmartcardAgent(c) => {
                Box::new(SmartcardAgentSource::new(id, c.clone()))
            }
            SourceSettings::CpuRng(c) => Box::new(CpuRngSource::new(id, c.clone())),
            SourceSettings::DeviceFile(c) => Box::new(DeviceFileSource::new(id, c.clone())),
        };
        Ok(source)
    }

    /// The resolved credential, if one is configured.
    pub fn credential(&self) -> Result<Option<Credential>, ConfigError> {
        self.credential.as_ref().map(CredentialConfig::resolve).transpose()
    }

    /// Constructs the source with its scheduling parameters.
    pub fn build(&self) -> Result<ScheduledSource, ConfigError> {
        let mut scheduled = ScheduledSource::new(self.build_source()?)
            .priority(self.priority)
            .max_read_bytes(self.max_read_bytes);
        if let Some(credential) = self.credential()? {
            scheduled = scheduled.credential(credential);
        }
        Ok(scheduled)
    }
}

/// Full configuration file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl FileConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate().map_err(ConfigError::Invalid)?;
        if self.accounting.healthy_streak == 0 {
            return Err(ConfigError::Invalid("healthy_streak must be non-zero".into()));
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !ids.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id {}",
                    source.id
                )));
            }
        }
        Ok(())
    }

    /// Accountant with every configured source's trust level.
    pub fn accountant(&self) -> EntropyAccountant {
        self.sources.iter().fold(
            EntropyAccountant::new(self.accounting.clone()),
            |acc, s| acc.with_trust(s.id.clone(), s.trust),
        )
    }

    pub fn build_sources(&self) -> Result<Vec<ScheduledSource>, ConfigError> {
        self.sources.iter().map(SourceConfig::build).collect()
    }

    /// Renders the effective configuration with inline PINs masked.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut copy = self.clone();
        for source in &mut copy.sources {
            if let Some(credential) = &mut source.credential {
                if credential.pin.is_some() {
                    credential.pin = Some("<redacted>".into());
                }
            }
        }
        toml::to_string_pretty(&copy).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
