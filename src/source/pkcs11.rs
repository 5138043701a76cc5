//! Native PKCS#11 backend for [`HardwareTokenSource`](super::HardwareTokenSource).

use super::token::{SlotIdentity, SlotInfo, TokenModule};
use super::{Role, SourceError};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use std::path::Path;

/// A loaded PKCS#11 engine with at most one session.
pub struct Pkcs11Module {
    context: Option<Pkcs11>,
    slots: Vec<Slot>,
    session: Option<Session>,
}

impl Pkcs11Module {
    /// Loads and initialises the engine at `path`.
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let context = Pkcs11::new(path)
            .map_err(|e| SourceError::InitFailure(format!("{}: {}", path.display(), e)))?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| SourceError::InitFailure(e.to_string()))?;
        Ok(Self {
            context: Some(context),
            slots: Vec::new(),
            session: None,
        })
    }

    fn context(&self) -> Result<&Pkcs11, SourceError> {
        self.context.as_ref().ok_or(SourceError::NotOpen)
    }

    fn session(&self) -> Result<&Session, SourceError> {
        self.session.as_ref().ok_or(SourceError::NotOpen)
    }
}

impl TokenModule for Pkcs11Module {
    fn enumerate_slots(&mut self) -> Result<Vec<SlotInfo>, SourceError> {
        let context = self.context()?;
        let slots = context
            .get_all_slots()
            .map_err(|e| SourceError::IoFailure(e.to_string()))?;

        let mut infos = Vec::with_capacity(slots.len());
        for slot in &slots {
            let slot_info = context
                .get_slot_info(*slot)
                .map_err(|e| SourceError::IoFailure(e.to_string()))?;
            let mut identity = SlotIdentity {
                manufacturer: slot_info.manufacturer_id().trim().to_string(),
                description: slot_info.slot_description().trim().to_string(),
                ..Default::default()
            };
            if slot_info.token_present() {
                if let Ok(token) = context.get_token_info(*slot) {
                    identity.token_label = token.label().trim().to_string();
                    identity.token_manufacturer = token.manufacturer_id().trim().to_string();
                    identity.token_model = token.model().trim().to_string();
                    identity.token_serial = token.serial_number().trim().to_string();
                }
            }
            infos.push(SlotInfo {
                id: slot.id(),
                token_present: slot_info.token_present(),
                identity,
            });
        }

        self.slots = slots;
        Ok(infos)
    }

    fn open_session(&mut self, slot_id: u64, read_write: bool) -> Result<(), SourceError> {
        let slot = self
            .slots
            .iter()
            .copied()
            .find(|s| s.id() == slot_id)
            .ok_or_else(|| SourceError::InitFailure(format!("unknown slot {}", slot_id)))?;
        let context = self.context()?;
        let session = if read_write {
            context.open_rw_session(slot)
        } else {
            context.open_ro_session(slot)
        }
        .map_err(|e| SourceError::InitFailure(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    fn login(&mut self, role: Role, pin: &str) -> Result<(), SourceError> {
        let user_type = match role {
            Role::User => UserType::User,
            Role::SecurityOfficer => UserType::So,
        };
        let pin = AuthPin::new(pin.to_string());
        self.session()?
            .login(user_type, Some(&pin))
            .map_err(|e| SourceError::AuthFailed(e.to_string()))
    }

    fn logout(&mut self) -> Result<(), SourceError> {
        self.session()?
            .logout()
            .map_err(|e| SourceError::IoFailure(e.to_string()))
    }

    fn generate_random(&mut self, len: usize) -> Result<Vec<u8>, SourceError> {
        let len = u32::try_from(len).map_err(|_| SourceError::IoFailure("length overflow".into()))?;
        self.session()?
            .generate_random_vec(len)
            .map_err(|e| SourceError::IoFailure(e.to_string()))
    }

    fn release(&mut self) {
        self.session = None;
        self.slots.clear();
        // Dropping the context finalises the library.
        self.context = None;
    }
}
