//! Hardware token (PKCS#11) entropy source.
//!
//! The token library is reached through the [`TokenModule`] trait so the
//! slot-selection and login discipline can be exercised without a device.
//! The `pkcs11` feature provides a module backed by a native PKCS#11
//! engine.

use super::{Credential, EntropySample, EntropySource, Role, SourceError, SourceKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a hardware token source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Path to the PKCS#11 engine shared object.
    pub engine_module_path: PathBuf,
    /// Reject reads until a login succeeded.
    #[serde(default)]
    pub require_login: bool,
}

/// Identity strings reported by the selected slot and its token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotIdentity {
    pub manufacturer: String,
    pub description: String,
    pub token_label: String,
    pub token_manufacturer: String,
    pub token_model: String,
    pub token_serial: String,
}

/// One enumerated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Module-specific slot id.
    pub id: u64,
    /// Whether a token is inserted in the slot.
    pub token_present: bool,
    pub identity: SlotIdentity,
}

/// Operations the source needs from a token library.
pub trait TokenModule: Send {
    /// Lists slots in the module's enumeration order.
    fn enumerate_slots(&mut self) -> Result<Vec<SlotInfo>, SourceError>;

    /// Opens a session on the given slot.
    ///
    /// Security officer login needs a read-write session; PKCS#11 refuses
    /// it while any read-only session on the token is open.
    fn open_session(&mut self, slot: u64, read_write: bool) -> Result<(), SourceError>;

    fn login(&mut self, role: Role, pin: &str) -> Result<(), SourceError>;

    fn logout(&mut self) -> Result<(), SourceError>;

    /// Asks the token for `len` random bytes.
    fn generate_random(&mut self, len: usize) -> Result<Vec<u8>, SourceError>;

    /// Closes sessions and unloads the module.
    fn release(&mut self);
}

/// Loads a token module from an engine path.
pub type ModuleLoader =
    Box<dyn Fn(&Path) -> Result<Box<dyn TokenModule>, SourceError> + Send>;

struct TokenSession {
    module: Box<dyn TokenModule>,
    slot: SlotInfo,
    logged_in: bool,
}

/// Entropy source backed by a PKCS#11 hardware token.
///
/// Token output is treated as full-quality randomness: every byte is
/// claimed at 8 bits.
pub struct HardwareTokenSource {
    id: String,
    config: TokenConfig,
    loader: ModuleLoader,
    session: Option<TokenSession>,
}

impl HardwareTokenSource {
    /// Creates a source that loads the engine with the default backend.
    pub fn new(id: impl Into<String>, config: TokenConfig) -> Self {
        Self::with_loader(id, config, Box::new(default_loader))
    }

    /// Creates a source with a custom module loader.
    pub fn with_loader(id: impl Into<String>, config: TokenConfig, loader: ModuleLoader) -> Self {
        Self {
            id: id.into(),
            config,
            loader,
            session: None,
        }
    }

    /// Identity of the selected slot, if open.
    pub fn identity(&self) -> Option<&SlotIdentity> {
        self.session.as_ref().map(|s| &s.slot.identity)
    }

    fn session_mut(&mut self) -> Result<&mut TokenSession, SourceError> {
        self.session.as_mut().ok_or(SourceError::NotOpen)
    }
}

#[cfg(feature = "pkcs11")]
fn default_loader(path: &Path) -> Result<Box<dyn TokenModule>, SourceError> {
    super::pkcs11::Pkcs11Module::load(path).map(|m| Box::new(m) as Box<dyn TokenModule>)
}

#[cfg(not(feature = "pkcs11"))]
fn default_loader(path: &Path) -> Result<Box<dyn TokenModule>, SourceError> {
    Err(SourceError::SourceUnavailable(format!(
        "cannot load {}: built without the pkcs11 feature",
        path.display()
    )))
}

/// Picks the first slot, in enumeration order, that holds a token.
fn select_slot(slots: Vec<SlotInfo>) -> Option<SlotInfo> {
    slots.into_iter().find(|s| s.token_present)
}

impl EntropySource for HardwareTokenSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HardwareToken
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut module = (self.loader)(&self.config.engine_module_path)?;

        let slots = match module.enumerate_slots() {
            Ok(slots) => slots,
            Err(e) => {
                module.release();
                return Err(SourceError::InitFailure(e.to_string()));
            }
        };
        let slot_count = slots.len();

        let Some(slot) = select_slot(slots) else {
            module.release();
            return Err(SourceError::SourceUnavailable(format!(
                "no token present in {} slot(s)",
                slot_count
            )));
        };

        if let Err(e) = module.open_session(slot.id, true) {
            module.release();
            return Err(SourceError::InitFailure(e.to_string()));
        }

        let identity = &slot.identity;
        tracing::info!(
            source = %self.id,
            slot = slot.id,
            manufacturer = %identity.manufacturer,
            description = %identity.description,
            token_label = %identity.token_label,
            token_manufacturer = %identity.token_manufacturer,
            token_model = %identity.token_model,
            token_serial = %identity.token_serial,
            "Hardware token opened"
        );

        self.session = Some(TokenSession {
            module,
            slot,
            logged_in: false,
        });
        Ok(())
    }

    fn requires_authentication(&self) -> bool {
        self.config.require_login
    }

    fn authenticate(&mut self, credential: &Credential) -> Result<(), SourceError> {
        let session = self.session_mut()?;
        if session.logged_in {
            return Ok(());
        }
        session
            .module
            .login(credential.role, &credential.pin)
            .map_err(|e| match e {
                SourceError::AuthFailed(_) => e,
                other => SourceError::AuthFailed(other.to_string()),
            })?;
        session.logged_in = true;
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError> {
        let require_login = self.config.require_login;
        let id = self.id.clone();
        let session = self.session_mut()?;
        if require_login && !session.logged_in {
            return Err(SourceError::AuthRequired);
        }

        let len = max_len.min(super::MAX_SAMPLE_LEN);
        let mut bytes = session.module.generate_random(len)?;
        bytes.truncate(len);
        Ok(EntropySample::full(id, bytes))
    }

    fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.logged_in {
            if let Err(e) = session.module.logout() {
                tracing::warn!(source = %self.id, error = %e, "Token logout failed");
            }
        }
        session.module.release();
        tracing::info!(source = %self.id, "Hardware token closed");
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn describe(&self) -> Vec<(String, String)> {
        let Some(identity) = self.identity() else {
            return Vec::new();
        };
        vec![
            ("manufacturer".into(), identity.manufacturer.clone()),
            ("description".into(), identity.description.clone()),
            ("token_label".into(), identity.token_label.clone()),
            ("token_manufacturer".into(), identity.token_manufacturer.clone()),
            ("token_model".into(), identity.token_model.clone()),
            ("token_serial".into(), identity.token_serial.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTokenModule;

    fn slot(id: u64, present: bool, serial: &str) -> SlotInfo {
        SlotInfo {
            id,
            token_present: present,
            identity: SlotIdentity {
                token_serial: serial.into(),
                ..Default::default()
            },
        }
    }

    fn source_with(module: MockTokenModule, require_login: bool) -> HardwareTokenSource {
        let config = TokenConfig {
            engine_module_path: "/usr/lib/mock-pkcs11.so".into(),
            require_login,
        };
        HardwareTokenSource::with_loader(
            "token",
            config,
            Box::new(move |_| Ok(Box::new(module.clone()) as Box<dyn TokenModule>)),
        )
    }

    #[test]
    fn test_selects_first_slot_with_token() {
        let module = MockTokenModule::new(vec![
            slot(0, false, "empty"),
            slot(1, true, "first"),
            slot(2, true, "second"),
        ]);
        let mut source = source_with(module.clone(), false);

        source.open().unwrap();
        assert_eq!(source.identity().unwrap().token_serial, "first");
        assert_eq!(module.opened_slot(), Some(1));
    }

    #[test]
    fn test_no_token_is_unavailable() {
        let module = MockTokenModule::new(vec![slot(0, false, "empty")]);
        let mut source = source_with(module.clone(), false);

        assert!(matches!(
            source.open(),
            Err(SourceError::SourceUnavailable(_))
        ));
        assert!(!source.is_open());
        assert!(module.released());
    }

    #[test]
    fn test_read_claims_full_entropy() {
        let module = MockTokenModule::new(vec![slot(0, true, "tok")]);
        let mut source = source_with(module, false);
        source.open().unwrap();

        let sample = source.read(64).unwrap();
        assert_eq!(sample.len(), 64);
        assert_eq!(sample.claimed_entropy_bits, 512);
        assert_eq!(sample.source_id, "token");
    }

    #[test]
    fn test_login_required_before_read() {
        let module = MockTokenModule::new(vec![slot(0, true, "tok")]).with_pin("123456");
        let mut source = source_with(module, true);
        source.open().unwrap();

        assert!(matches!(source.read(16), Err(SourceError::AuthRequired)));

        let wrong = Credential::new(Role::User, "000000");
        assert!(matches!(
            source.authenticate(&wrong),
            Err(SourceError::AuthFailed(_))
        ));

        let right = Credential::new(Role::User, "123456");
        source.authenticate(&right).unwrap();
        assert!(source.read(16).is_ok());
    }

    #[test]
    fn test_security_officer_login_uses_read_write_session() {
        let module = MockTokenModule::new(vec![slot(0, true, "tok")]).with_pin("87654321");
        let mut source = source_with(module.clone(), true);
        source.open().unwrap();
        assert!(module.read_write());

        source
            .authenticate(&Credential::new(Role::SecurityOfficer, "87654321"))
            .unwrap();
        assert_eq!(module.login_role(), Some(Role::SecurityOfficer));
        assert!(source.read(16).is_ok());
    }

    #[test]
    fn test_optional_login_with_credential() {
        let module = MockTokenModule::new(vec![slot(0, true, "tok")]).with_pin("123456");
        let mut source = source_with(module.clone(), false);
        source.open().unwrap();
        assert!(!source.requires_authentication());

        source
            .authenticate(&Credential::new(Role::User, "123456"))
            .unwrap();
        assert_eq!(module.login_role(), Some(Role::User));
        assert!(source.read(16).is_ok());

        source.close();
        assert_eq!(module.login_role(), None);
    }

    #[test]
    fn test_optional_login_without_credential() {
        let module = MockTokenModule::new(vec![slot(0, true, "tok")]).with_pin("123456");
        let mut source = source_with(module.clone(), false);
        source.open().unwrap();

        assert_eq!(source.read(16).unwrap().len(), 16);
        assert_eq!(module.login_role(), None);
    }

    #[test]
    fn test_use_after_close_fails_and_double_close_is_noop() {
        let module = MockTokenModule::new(vec![slot(0, true, "tok")]);
        let mut source = source_with(module.clone(), false);
        source.open().unwrap();

        source.close();
        source.close();
        assert!(matches!(source.read(8), Err(SourceError::NotOpen)));
        assert_eq!(module.release_count(), 1);
    }

    #[cfg(not(feature = "pkcs11"))]
    #[test]
    fn test_default_loader_without_feature() {
        let config = TokenConfig {
            engine_module_path: "/usr/lib/opensc-pkcs11.so".into(),
            require_login: false,
        };
        let mut source = HardwareTokenSource::new("token", config);
        assert!(matches!(
            source.open(),
            Err(SourceError::SourceUnavailable(_))
        ));
    }
}
