//! In-memory fakes shared by unit tests.

use crate::source::assuan::AgentTransport;
use crate::source::{
    Credential, EntropySample, EntropySource, Role, SlotInfo, SourceError, SourceKind,
    TokenModule,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic bytes that pass the health screen.
pub(crate) fn noise(counter: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    blake3::Hasher::new()
        .update(b"testing-noise")
        .update(&counter.to_le_bytes())
        .finalize_xof()
        .fill(&mut out);
    out
}

#[derive(Default)]
struct TokenState {
    pin: Option<String>,
    opened_slot: Option<u64>,
    read_write: bool,
    logged_in: bool,
    login_role: Option<Role>,
    release_count: usize,
    generated: u64,
}

/// Token module backed by a fixed slot list.
#[derive(Clone)]
pub(crate) struct MockTokenModule {
    slots: Vec<SlotInfo>,
    state: Arc<Mutex<TokenState>>,
}

impl MockTokenModule {
    pub fn new(slots: Vec<SlotInfo>) -> Self {
        Self {
            slots,
            state: Arc::new(Mutex::new(TokenState::default())),
        }
    }

    /// Only this PIN is accepted by `login`.
    pub fn with_pin(self, pin: &str) -> Self {
        self.state.lock().unwrap().pin = Some(pin.to_string());
        self
    }

    pub fn opened_slot(&self) -> Option<u64> {
        self.state.lock().unwrap().opened_slot
    }

    pub fn read_write(&self) -> bool {
        self.state.lock().unwrap().read_write
    }

    /// Role of the current login, if logged in.
    pub fn login_role(&self) -> Option<Role> {
        let state = self.state.lock().unwrap();
        state.logged_in.then_some(state.login_role).flatten()
    }

    pub fn released(&self) -> bool {
        self.release_count() > 0
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().unwrap().release_count
    }
}

impl TokenModule for MockTokenModule {
    fn enumerate_slots(&mut self) -> Result<Vec<SlotInfo>, SourceError> {
        Ok(self.slots.clone())
    }

    fn open_session(&mut self, slot: u64, read_write: bool) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        state.opened_slot = Some(slot);
        state.read_write = read_write;
        Ok(())
    }

    fn login(&mut self, role: Role, pin: &str) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        if role == Role::SecurityOfficer && !state.read_write {
            return Err(SourceError::AuthFailed(
                "CKR_SESSION_READ_ONLY_EXISTS".into(),
            ));
        }
        match &state.pin {
            Some(expected) if expected != pin => {
                Err(SourceError::AuthFailed("CKR_PIN_INCORRECT".into()))
            }
            _ => {
                state.logged_in = true;
                state.login_role = Some(role);
                Ok(())
            }
        }
    }

    fn logout(&mut self) -> Result<(), SourceError> {
        self.state.lock().unwrap().logged_in = false;
        Ok(())
    }

    fn generate_random(&mut self, len: usize) -> Result<Vec<u8>, SourceError> {
        let mut state = self.state.lock().unwrap();
        state.generated += 1;
        Ok(noise(state.generated, len))
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.release_count += 1;
        state.opened_slot = None;
    }
}

#[derive(Default)]
struct TransportState {
    script: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

/// Assuan transport replaying canned response lines.
#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ScriptedTransport {
    pub fn new(lines: Vec<Vec<u8>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                script: lines.into(),
                sent: Vec::new(),
            })),
        }
    }

    /// Lines sent so far, without terminators.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl AgentTransport for ScriptedTransport {
    fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.state.lock().unwrap().sent.push(line.to_vec());
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().unwrap().script.pop_front())
    }
}

/// One scripted outcome for [`ScriptedSource::read`].
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Return `min(max_len, n)` bytes claiming full entropy.
    Bytes(usize),
    /// Return `len` bytes with an explicit claim, ignoring `max_len`.
    Claim(usize, u32),
    Fail(SourceError),
    /// Sleep, then behave like an unscripted read.
    Stall(Duration),
}

#[derive(Default)]
struct SourceLog {
    open_results: VecDeque<Result<(), SourceError>>,
    steps: VecDeque<Step>,
    opens: usize,
    closes: usize,
    reads: Vec<usize>,
    credentials: Vec<Credential>,
    authenticated: bool,
    is_open: bool,
    counter: u64,
}

/// Source whose behaviour is scripted by the test.
///
/// Unscripted reads return healthy bytes of the requested length.
/// Clones share the same log.
#[derive(Clone)]
pub(crate) struct ScriptedSource {
    id: String,
    requires_auth: bool,
    log: Arc<Mutex<SourceLog>>,
}

impl ScriptedSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            requires_auth: false,
            log: Arc::new(Mutex::new(SourceLog::default())),
        }
    }

    pub fn requiring_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn push_open(&self, result: Result<(), SourceError>) -> &Self {
        self.log.lock().unwrap().open_results.push_back(result);
        self
    }

    pub fn push(&self, step: Step) -> &Self {
        self.log.lock().unwrap().steps.push_back(step);
        self
    }

    pub fn boxed(&self) -> Box<dyn EntropySource> {
        Box::new(self.clone())
    }

    pub fn opens(&self) -> usize {
        self.log.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.log.lock().unwrap().closes
    }

    /// Requested lengths of every read attempt.
    pub fn reads(&self) -> Vec<usize> {
        self.log.lock().unwrap().reads.clone()
    }

    pub fn credentials(&self) -> Vec<Credential> {
        self.log.lock().unwrap().credentials.clone()
    }

    /// Simulates the backend dropping the session.
    pub fn drop_session(&self) {
        let mut log = self.log.lock().unwrap();
        log.is_open = false;
        log.authenticated = false;
    }
}

impl EntropySource for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::DeviceFile
    }

    fn open(&mut self) -> Result<(), SourceError> {
        let mut log = self.log.lock().unwrap();
        log.opens += 1;
        let result = log.open_results.pop_front().unwrap_or(Ok(()));
        log.is_open = result.is_ok();
        result
    }

    fn requires_authentication(&self) -> bool {
        self.requires_auth
    }

    fn authenticate(&mut self, credential: &Credential) -> Result<(), SourceError> {
        let mut log = self.log.lock().unwrap();
        log.credentials.push(credential.clone());
        log.authenticated = true;
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError> {
        let step = {
            let mut log = self.log.lock().unwrap();
            log.reads.push(max_len);
            if !log.is_open {
                return Err(SourceError::NotOpen);
            }
            if self.requires_auth && !log.authenticated {
                return Err(SourceError::AuthRequired);
            }
            log.steps.pop_front()
        };
        if let Some(Step::Stall(delay)) = step {
            std::thread::sleep(delay);
        }

        let mut log = self.log.lock().unwrap();
        log.counter += 1;
        let counter = log.counter;
        match step {
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Claim(len, bits)) => {
                Ok(EntropySample::new(self.id.clone(), noise(counter, len), bits))
            }
            Some(Step::Bytes(n)) => Ok(EntropySample::full(
                self.id.clone(),
                noise(counter, n.min(max_len)),
            )),
            Some(Step::Stall(_)) | None => {
                Ok(EntropySample::full(self.id.clone(), noise(counter, max_len)))
            }
        }
    }

    fn close(&mut self) {
        let mut log = self.log.lock().unwrap();
        if log.is_open {
            log.closes += 1;
        }
        log.is_open = false;
        log.authenticated = false;
    }

    fn is_open(&self) -> bool {
        self.log.lock().unwrap().is_open
    }
}

/// Source that records any overlap between calls on the same handle.
#[derive(Clone)]
pub(crate) struct ExclusiveSource {
    id: String,
    read_time: Duration,
    active: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    open: bool,
}

impl ExclusiveSource {
    pub fn new(id: &str, read_time: Duration) -> Self {
        Self {
            id: id.to_string(),
            read_time,
            active: Arc::new(AtomicUsize::new(0)),
            overlaps: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
            open: false,
        }
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EntropySource for ExclusiveSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HardwareToken
    }

    fn open(&mut self) -> Result<(), SourceError> {
        self.enter();
        self.open = true;
        self.leave();
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<EntropySample, SourceError> {
        self.enter();
        std::thread::sleep(self.read_time);
        let n = self.reads.fetch_add(1, Ordering::SeqCst) as u64;
        self.leave();
        Ok(EntropySample::full(self.id.clone(), noise(n, max_len)))
    }

    fn close(&mut self) {
        self.enter();
        self.open = false;
        self.leave();
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
