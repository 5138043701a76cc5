//! Smartcard entropy via gpg-agent's scdaemon.
//!
//! The source holds one Assuan session. It selects a card when opened and
//! then issues `SCD RANDOM <n>` for every read.
//!
//! Card selection: with a configured serial, that card must be listed
//! by `SCD GETINFO card_list`. Without one, the first listed card is
//! used. Either way an absent card makes the source unavailable.

use super::assuan::{self, AgentTransport, ProtocolError, UnixSocketTransport};
use super::{Credential, EntropySample, EntropySource, SourceError, SourceKind, MAX_SAMPLE_LEN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest request sent in a single `SCD RANDOM` command.
pub const MAX_RANDOM_REQUEST: usize = 256;

/// Configuration for the smartcard agent source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path to the gpg-agent socket.
    pub socket_path: PathBuf,
    /// Serial number of the card to use; first listed card if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
    /// Reject reads until the card PIN was verified.
    #[serde(default)]
    pub require_pin: bool,
    /// Socket read/write timeout in milliseconds (0 disables).
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_io_timeout_ms() -> u64 {
    5000
}

/// Opens a transport to the agent socket.
pub type AgentConnector =
    Box<dyn Fn(&AgentConfig) -> Result<Box<dyn AgentTransport>, SourceError> + Send>;

fn connect_unix(config: &AgentConfig) -> Result<Box<dyn AgentTransport>, SourceError> {
    let timeout = (config.io_timeout_ms > 0).then(|| Duration::from_millis(config.io_timeout_ms));
    UnixSocketTransport::connect(&config.socket_path, timeout)
        .map(|t| Box::new(t) as Box<dyn AgentTransport>)
        .map_err(|e| {
            SourceError::SourceUnavailable(format!(
                "cannot connect to {}: {}",
                config.socket_path.display(),
                e
            ))
        })
}

struct AgentSession {
    transport: Box<dyn AgentTransport>,
    serial: String,
    pin_verified: bool,
}

/// Entropy source reading the random number generator of an OpenPGP card.
pub struct SmartcardAgentSource {
    id: String,
    config: AgentConfig,
    connector: AgentConnector,
    session: Option<AgentSession>,
}

impl SmartcardAgentSource {
    pub fn new(id: impl Into<String>, config: AgentConfig) -> Self {
        Self::with_connector(id, config, Box::new(connect_unix))
    }

    /// Creates a source with a custom transport connector.
    pub fn with_connector(
        id: impl Into<String>,
        config: AgentConfig,
        connector: AgentConnector,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            connector,
            session: None,
        }
    }

    /// Serial of the selected card, if open.
    pub fn selected_card(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.serial.as_str())
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Drops the session after a failure that desynchronised the protocol.
    fn fail(&mut self, error: ProtocolError) -> SourceError {
        if error.breaks_session() {
            tracing::warn!(source = %self.id, error = %error, "Agent session lost");
            self.session = None;
        }
        SourceError::IoFailure(error.to_string())
    }
}

/// Applies the card selection policy to the listed serials.
fn choose_card(listed: &[String], wanted: Option<&str>) -> Result<String, SourceError> {
    match wanted {
        Some(serial) => listed
            .iter()
            .find(|s| s.eq_ignore_ascii_case(serial))
            .cloned()
            .ok_or_else(|| {
                SourceError::SourceUnavailable(format!("card {} is not present", serial))
            }),
        None => listed
            .first()
            .cloned()
            .ok_or_else(|| SourceError::SourceUnavailable("no smartcard present".into())),
    }
}

impl EntropySource for SmartcardAgentSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SmartcardAgent
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut transport = (self.connector)(&self.config)?;
        assuan::expect_greeting(transport.as_mut())
            .map_err(|e| SourceError::InitFailure(format!("agent greeting: {}", e)))?;

        let listing = assuan::transact(
            transport.as_mut(),
            "SCD GETINFO card_list",
            &mut assuan::no_inquire,
        )
        .map_err(|e| SourceError::SourceUnavailable(format!("card_list: {}", e)))?;

        let listed: Vec<String> = listing
            .status
            .into_iter()
            .filter(|(tag, _)| tag == "SERIALNO")
            .map(|(_, args)| args.trim().to_string())
            .filter(|serial| !serial.is_empty())
            .collect();
        tracing::debug!(source = %self.id, cards = ?listed, "Smartcards listed");

        let serial = choose_card(&listed, self.config.card.as_deref())?;

        assuan::transact(
            transport.as_mut(),
            &format!("SCD SERIALNO {}", serial),
            &mut assuan::no_inquire,
        )
        .map_err(|e| SourceError::InitFailure(format!("selecting card {}: {}", serial, e)))?;

        tracing::info!(source = %self.id, card = %serial, "Smartcard selected");
        self.session = Some(AgentSession {
            transport,
            serial,
            pin_verified: false,
        });
        Ok(())
    }

    fn requires_authentication(&self) -> bool {
        self.config.require_pin
    }

    fn authenticate(&mut self, credential: &Credential) -> Result<(), SourceError> {
        let session = self.session.as_mut().ok_or(SourceError::NotOpen)?;
        if session.pin_verified {
            return Ok(());
        }

        let pin = credential.pin.clone().into_bytes();
        let mut answer_pin =
            |keyword: &str, _args: &str| (keyword == "NEEDPIN").then(|| pin.clone());
        let command = format!("SCD CHECKPIN {}", session.serial);

        match assuan::transact(session.transport.as_mut(), &command, &mut answer_pin) {
            Ok(_) => {
                session.pin_verified = true;
                Ok(())
            }
            Err(ProtocolError::Agent { code, message }) => Err(SourceError::AuthFailed(
                format!("agent error {}: {}", code, message),
            )),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError> {
        let require_pin = self.config.require_pin;
        let session = self.session.as_mut().ok_or(SourceError::NotOpen)?;
        if require_pin && !session.pin_verified {
            return Err(SourceError::AuthRequired);
        }

        let len = max_len.min(MAX_RANDOM_REQUEST).min(MAX_SAMPLE_LEN);
        let command = format!("SCD RANDOM {}", len);
        let result =
            assuan::transact(session.transport.as_mut(), &command, &mut assuan::no_inquire);

        match result {
            Ok(tx) if tx.data.len() == len => Ok(EntropySample::full(self.id.clone(), tx.data)),
            Ok(tx) => Err(self.fail(ProtocolError::Malformed(format!(
                "requested {} random bytes, received {}",
                len,
                tx.data.len()
            )))),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            // Best effort: the agent also cleans up on disconnect.
            let _ = session.transport.send_line(b"BYE");
            tracing::info!(source = %self.id, "Agent session closed");
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn describe(&self) -> Vec<(String, String)> {
        let mut out = vec![(
            "socket".to_string(),
            self.config.socket_path.display().to_string(),
        )];
        if let Some(serial) = self.selected_card() {
            out.push(("card".into(), serial.to_string()));
        }
        out
    }
}
