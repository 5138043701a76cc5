//! Drain scheduling.
//!
//! The [`Scheduler`] keeps the kernel pool's entropy estimate between two
//! watermarks. Each cycle it refreshes the estimate and, when it is low,
//! drains sources in priority order through the accountant into the
//! kernel until the high watermark is reached.
//!
//! Reads run on bounded worker threads with a per-read timeout. Each
//! source handle sits behind its own mutex and is never given to a second
//! worker while a read is in flight.

mod budget;
mod state;
mod worker;

pub use budget::EntropyBudget;
pub use state::{BackoffPolicy, SourceState};

use crate::accounting::{AcceptedSample, AccountingError, EntropyAccountant, TrustLevel};
use crate::feedback::KernelFeedback;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::source::{
    Credential, EntropySample, EntropySource, KernelPoolSource, SourceError, SourceKind,
    MAX_SAMPLE_LEN,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use worker::{ReadJob, ReadReport, SourceHandle, Stage, WorkerPool};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Drain when the estimate falls below this many bits.
    pub low_watermark: u32,
    /// Stop draining once the estimate reaches this many bits.
    pub high_watermark: u32,
    pub poll_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failures after which a source is disabled.
    pub max_failures: u32,
    /// Upper bound on concurrently running read workers.
    pub max_workers: usize,
    /// Reseed the CSPRNG after a cycle that credited entropy.
    pub reseed_after_drain: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            low_watermark: 128,
            high_watermark: 256,
            poll_interval_ms: 5000,
            read_timeout_ms: 10_000,
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
            max_failures: 5,
            max_workers: 4,
            reseed_after_drain: true,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.high_watermark == 0 {
            return Err("high_watermark must be non-zero".into());
        }
        if self.low_watermark > self.high_watermark {
            return Err(format!(
                "low_watermark {} exceeds high_watermark {}",
                self.low_watermark, self.high_watermark
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be non-zero".into());
        }
        if self.read_timeout_ms == 0 {
            return Err("read_timeout_ms must be non-zero".into());
        }
        if self.max_failures == 0 {
            return Err("max_failures must be non-zero".into());
        }
        if self.max_workers == 0 {
            return Err("max_workers must be non-zero".into());
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(format!(
                "backoff_base_ms {} exceeds backoff_max_ms {}",
                self.backoff_base_ms, self.backoff_max_ms
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("duplicate source id: {0}")]
    DuplicateSource(String),
}

/// A source together with its scheduling parameters.
pub struct ScheduledSource {
    source: Box<dyn EntropySource>,
    priority: i32,
    max_read_bytes: usize,
    credential: Option<Credential>,
}

impl ScheduledSource {
    pub fn new(source: Box<dyn EntropySource>) -> Self {
        Self {
            source,
            priority: 0,
            max_read_bytes: 256,
            credential: None,
        }
    }

    /// Lower values are drained first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_read_bytes(mut self, max_read_bytes: usize) -> Self {
        self.max_read_bytes = max_read_bytes.clamp(1, MAX_SAMPLE_LEN);
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn id(&self) -> &str {
        self.source.id()
    }
}

/// Messages accepted by a running scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Control {
    Wake,
    Reset(String),
    Shutdown,
}

/// Cloneable remote control for a [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Control>,
}

impl SchedulerHandle {
    fn send(&self, control: Control) {
        if self.tx.send(control).is_err() {
            tracing::debug!("Scheduler already stopped");
        }
    }

    /// Starts the next cycle immediately.
    pub fn wake(&self) {
        self.send(Control::Wake);
    }

    /// Clears the failure history of a source and re-enables it.
    pub fn reset(&self, source_id: impl Into<String>) {
        self.send(Control::Reset(source_id.into()));
    }

    /// Stops the loop after in-flight reads complete.
    pub fn shutdown(&self) {
        self.send(Control::Shutdown);
    }
}

/// Outcome of one scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The pool estimate could not be read and nothing was drained.
    pub skipped: bool,
    pub estimate_before: u32,
    pub estimate_after: u32,
    /// Sources a read was completed from, in order.
    pub sources_read: Vec<String>,
    pub accounted_bits: u64,
    pub unaccounted_bytes: u64,
    pub failures: usize,
    pub reseeded: bool,
}

/// Point-in-time view of one source.
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub id: String,
    pub kind: SourceKind,
    pub priority: i32,
    pub trust: TrustLevel,
    pub state: SourceState,
    pub failures: u32,
    pub reads: u64,
    pub bytes_read: u64,
    pub accounted_bits: u64,
    pub errors: u64,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct SlotStats {
    reads: u64,
    bytes_read: u64,
    accounted_bits: u64,
    errors: u64,
    last_success: Option<DateTime<Utc>>,
}

struct SourceSlot {
    id: String,
    kind: SourceKind,
    priority: i32,
    max_read_bytes: usize,
    credential: Option<Credential>,
    handle: SourceHandle,
    busy: Arc<AtomicBool>,
    state: SourceState,
    failures: u32,
    authenticated: bool,
    close_pending: bool,
    stats: SlotStats,
}

impl SourceSlot {
    fn try_close(&mut self) {
        if self.busy.load(Ordering::SeqCst) {
            self.close_pending = true;
            return;
        }
        match self.handle.try_lock() {
            Ok(mut source) => {
                source.close();
                self.close_pending = false;
            }
            Err(_) => self.close_pending = true,
        }
        self.authenticated = false;
    }

    fn handle_is_open(&self) -> bool {
        self.handle
            .try_lock()
            .map(|source| source.is_open())
            .unwrap_or(false)
    }
}

/// Coordinates source drains against the kernel pool estimate.
pub struct Scheduler {
    config: SchedulerConfig,
    backoff: BackoffPolicy,
    slots: Vec<SourceSlot>,
    accountant: EntropyAccountant,
    feedback: KernelFeedback,
    pool: KernelPoolSource,
    workers: WorkerPool,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    stopping: bool,
    /// A wake consumed mid-cycle; the next wait returns at once.
    wake_pending: bool,
    capacity_warned: bool,
    cycles: u64,
    last_budget: Option<EntropyBudget>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Scheduler {
    /// Builds a scheduler. Sources are ordered by ascending priority;
    /// sources of equal priority keep their given order.
    pub fn new(
        config: SchedulerConfig,
        sources: Vec<ScheduledSource>,
        accountant: EntropyAccountant,
        feedback: KernelFeedback,
        pool: KernelPoolSource,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.id().to_string()) {
                return Err(SchedulerError::DuplicateSource(source.id().to_string()));
            }
            if source.credential.is_none() && source.source.requires_authentication() {
                tracing::warn!(
                    source = %source.id(),
                    "Source requires authentication but has no credential"
                );
            }
        }

        let mut sources = sources;
        sources.sort_by_key(|s| s.priority);

        let slots = sources
            .into_iter()
            .map(|s| SourceSlot {
                id: s.source.id().to_string(),
                kind: s.source.kind(),
                priority: s.priority,
                max_read_bytes: s.max_read_bytes,
                credential: s.credential,
                handle: Arc::new(Mutex::new(s.source)),
                busy: Arc::new(AtomicBool::new(false)),
                state: SourceState::Closed,
                failures: 0,
                authenticated: false,
                close_pending: false,
                stats: SlotStats::default(),
            })
            .collect();

        let (control_tx, control_rx) = mpsc::channel();
        Ok(Self {
            backoff: config.backoff(),
            workers: WorkerPool::new(config.max_workers),
            config,
            slots,
            accountant,
            feedback,
            pool,
            control_tx,
            control_rx,
            stopping: false,
            wake_pending: false,
            capacity_warned: false,
            cycles: 0,
            last_budget: None,
            metrics: None,
        })
    }

    /// Publishes a metrics snapshot after every cycle.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Budget as of the end of the last cycle.
    pub fn budget(&self) -> Option<EntropyBudget> {
        self.last_budget
    }

    pub fn feedback(&self) -> &KernelFeedback {
        &self.feedback
    }

    pub fn accountant(&self) -> &EntropyAccountant {
        &self.accountant
    }

    pub fn status(&self) -> Vec<SourceStatus> {
        self.slots
            .iter()
            .map(|slot| SourceStatus {
                id: slot.id.clone(),
                kind: slot.kind,
                priority: slot.priority,
                trust: self.accountant.trust_of(&slot.id),
                state: slot.state.clone(),
                failures: slot.failures,
                reads: slot.stats.reads,
                bytes_read: slot.stats.bytes_read,
                accounted_bits: slot.stats.accounted_bits,
                errors: slot.stats.errors,
                last_success: slot.stats.last_success,
            })
            .collect()
    }

    /// Clears the failure history of a source and returns it to rotation.
    pub fn reset_source(&mut self, source_id: &str) -> Result<(), SchedulerError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or_else(|| SchedulerError::UnknownSource(source_id.to_string()))?;

        let was = slot.state.clone();
        slot.failures = 0;
        slot.state = if slot.handle_is_open() {
            SourceState::Open
        } else {
            SourceState::Closed
        };
        self.accountant.reset_source(source_id);
        tracing::info!(source = %source_id, previous = %was, "Source reset");
        Ok(())
    }

    /// Runs cycles until [`SchedulerHandle::shutdown`] is called, then
    /// waits for in-flight reads and closes every source.
    pub fn run(&mut self) {
        tracing::info!(
            sources = self.slots.len(),
            low = self.config.low_watermark,
            high = self.config.high_watermark,
            "Scheduler started"
        );

        while !self.stopping {
            self.run_cycle();
            if !self.stopping {
                self.wait_for_control();
            }
        }

        self.shutdown();
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Wake => self.wake_pending = true,
            Control::Reset(id) => {
                if let Err(e) = self.reset_source(&id) {
                    tracing::warn!(error = %e, "Reset ignored");
                }
            }
            Control::Shutdown => {
                tracing::info!("Shutdown requested");
                self.stopping = true;
            }
        }
    }

    /// Sleeps for the poll interval, returning early on wake or shutdown.
    fn wait_for_control(&mut self) {
        if std::mem::take(&mut self.wake_pending) {
            tracing::debug!("Wake arrived during the last cycle");
            return;
        }
        let deadline = Instant::now() + self.config.poll_interval();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.control_rx.recv_timeout(remaining) {
                Ok(Control::Wake) => {
                    tracing::debug!("Woken early");
                    return;
                }
                Ok(control) => {
                    self.apply(control);
                    if self.stopping {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Applies queued control messages without blocking.
    fn poll_control(&mut self) {
        loop {
            match self.control_rx.try_recv() {
                Ok(control) => self.apply(control),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Runs one refresh/drain/reseed cycle.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let mut report = CycleReport::default();

        for slot in self.slots.iter_mut().filter(|s| s.close_pending) {
            slot.try_close();
        }

        let mut budget = match EntropyBudget::refresh(&mut self.pool) {
            Ok(budget) => budget,
            Err(e) => {
                tracing::warn!(error = %e, "Pool estimate unavailable; cycle skipped");
                report.skipped = true;
                self.publish_metrics();
                return report;
            }
        };
        report.estimate_before = budget.estimate_bits;

        let (low, high) = self.watermarks(budget.capacity_bits);
        if budget.below(low) {
            tracing::debug!(
                estimate = budget.estimate_bits,
                low,
                "Pool below low watermark; draining"
            );
            for index in 0..self.slots.len() {
                if !budget.below(high) {
                    break;
                }
                self.poll_control();
                if self.stopping {
                    break;
                }
                self.drain(index, high, &mut budget, &mut report);
            }
        }

        if report.accounted_bits > 0 && self.config.reseed_after_drain {
            match self.feedback.trigger_reseed() {
                Ok(()) => report.reseeded = true,
                Err(e) => tracing::warn!(error = %e, "Reseed failed"),
            }
        }

        report.estimate_after = budget.estimate_bits;
        self.last_budget = Some(budget);

        if !report.sources_read.is_empty() || report.failures > 0 {
            tracing::info!(
                before = report.estimate_before,
                after = report.estimate_after,
                accounted_bits = report.accounted_bits,
                unaccounted_bytes = report.unaccounted_bytes,
                failures = report.failures,
                "Cycle complete"
            );
        }
        self.publish_metrics();
        report
    }

    /// Configured watermarks, clamped to what the pool can hold.
    fn watermarks(&mut self, capacity: u32) -> (u32, u32) {
        let high = self.config.high_watermark.min(capacity);
        let low = self.config.low_watermark.min(high);
        if high < self.config.high_watermark && !self.capacity_warned {
            tracing::warn!(
                high_watermark = self.config.high_watermark,
                capacity,
                "High watermark exceeds pool capacity; clamped"
            );
            self.capacity_warned = true;
        }
        (low, high)
    }

    fn drain(
        &mut self,
        index: usize,
        high: u32,
        budget: &mut EntropyBudget,
        report: &mut CycleReport,
    ) {
        let now = Instant::now();
        let slot = &mut self.slots[index];

        if slot.state.is_disabled() {
            return;
        }
        if slot.state.backing_off(now) {
            tracing::trace!(source = %slot.id, "Backing off; skipped");
            return;
        }
        if slot.busy.load(Ordering::SeqCst) {
            tracing::debug!(source = %slot.id, "Earlier read still in flight; skipped");
            return;
        }
        if let SourceState::Faulted { .. } = slot.state {
            slot.state = if slot.handle_is_open() {
                SourceState::Open
            } else {
                SourceState::Closed
            };
        }

        let max_len = budget.request_len(high, slot.max_read_bytes);
        let job = ReadJob {
            handle: Arc::clone(&slot.handle),
            busy: Arc::clone(&slot.busy),
            credential: slot.credential.clone(),
            authenticated: slot.authenticated,
            max_len,
        };
        let Some(rx) = self.workers.dispatch(&slot.id, job) else {
            tracing::debug!(source = %slot.id, "No read worker available; skipped");
            return;
        };
        slot.state = SourceState::Reading;
        tracing::trace!(source = %slot.id, max_len, "Read dispatched");

        let timeout = self.config.read_timeout();
        let outcome = match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                slot.authenticated = false;
                self.record_failure(index, Stage::Read, SourceError::Timeout(timeout), report);
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                let err = SourceError::IoFailure("read worker exited without a result".into());
                self.record_failure(index, Stage::Read, err, report);
                return;
            }
        };

        let ReadReport {
            opened,
            authenticated,
            result,
        } = outcome;
        if opened {
            tracing::info!(source = %slot.id, kind = %slot.kind, "Source opened");
            slot.state = SourceState::Open;
        }
        if authenticated && !slot.authenticated {
            tracing::info!(source = %slot.id, "Source authenticated");
            slot.state = SourceState::Authenticated;
        }
        slot.authenticated = authenticated;

        match result {
            Ok(sample) => self.absorb(index, sample, budget, report),
            Err((stage, err)) => self.record_failure(index, stage, err, report),
        }
    }

    fn absorb(
        &mut self,
        index: usize,
        sample: EntropySample,
        budget: &mut EntropyBudget,
        report: &mut CycleReport,
    ) {
        let slot = &mut self.slots[index];
        slot.failures = 0;
        slot.state = SourceState::Idle;
        slot.stats.reads += 1;
        slot.stats.bytes_read += sample.len() as u64;
        slot.stats.last_success = Some(Utc::now());
        report.sources_read.push(slot.id.clone());

        let accepted = match self.accountant.accept(sample) {
            Ok(accepted) => accepted,
            Err(AccountingError::OverclaimedEntropy { .. }) => return,
        };

        if let Err(e) = self.feedback.submit(&accepted) {
            tracing::warn!(source = %slot.id, error = %e, "Sample not absorbed");
            return;
        }

        match accepted {
            AcceptedSample::Accounted { bits, .. } => {
                budget.credit(bits);
                slot.stats.accounted_bits += u64::from(bits);
                report.accounted_bits += u64::from(bits);
                tracing::debug!(
                    source = %slot.id,
                    bits,
                    estimate = budget.estimate_bits,
                    "Accounted"
                );
            }
            AcceptedSample::Unaccounted { bytes, .. } => {
                report.unaccounted_bytes += bytes.len() as u64;
            }
        }
    }

    fn record_failure(
        &mut self,
        index: usize,
        stage: Stage,
        err: SourceError,
        report: &mut CycleReport,
    ) {
        let max_failures = self.config.max_failures;
        let slot = &mut self.slots[index];
        report.failures += 1;
        slot.stats.errors += 1;

        if stage == Stage::Open && matches!(err, SourceError::InitFailure(_)) {
            slot.failures += 1;
            self.disable(index, err);
            return;
        }

        slot.failures += 1;
        if err.is_auth() || stage == Stage::Authenticate {
            slot.authenticated = false;
        }
        if slot.failures >= max_failures {
            self.disable(index, err);
            return;
        }

        let delay = self.backoff.delay(slot.failures);
        slot.state = SourceState::Faulted {
            backoff_until: Instant::now() + delay,
            failures: slot.failures,
        };
        tracing::warn!(
            source = %slot.id,
            stage = ?stage,
            error = %err,
            failures = slot.failures,
            backoff_ms = delay.as_millis() as u64,
            "Source faulted"
        );
    }

    fn disable(&mut self, index: usize, err: SourceError) {
        let slot = &mut self.slots[index];
        slot.try_close();
        slot.state = SourceState::Disabled {
            failures: slot.failures,
            reason: err.to_string(),
        };
        tracing::error!(
            source = %slot.id,
            failures = slot.failures,
            error = %err,
            "Source disabled until reset"
        );
    }

    fn shutdown(&mut self) {
        self.workers.join_all();
        for slot in &mut self.slots {
            match slot.handle.lock() {
                Ok(mut source) => source.close(),
                Err(_) => tracing::warn!(source = %slot.id, "Handle poisoned; not closed"),
            }
            slot.authenticated = false;
            slot.close_pending = false;
            if !slot.state.is_disabled() {
                slot.state = SourceState::Closed;
            }
        }
        self.pool.close();
        tracing::info!(cycles = self.cycles, "Scheduler stopped");
    }

    fn publish_metrics(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.update(&MetricsSnapshot {
            pool_estimate_bits: self.last_budget.map(|b| b.estimate_bits),
            pool_capacity_bits: self.last_budget.map(|b| b.capacity_bits),
            cycles: self.cycles,
            workers_in_flight: self.workers.in_flight(),
            feedback: self.feedback.stats(),
            accounting: self.accountant.stats(),
            sources: self.status(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::AccountingConfig;
    use crate::feedback::{DeviceCall, MockPoolDevice, SharedPoolDevice};
    use crate::source::assuan::AgentTransport;
    use crate::source::{AgentConfig, Role, SmartcardAgentSource};
    use crate::testing::{ExclusiveSource, ScriptedSource, ScriptedTransport, Step};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            low_watermark: 100,
            high_watermark: 200,
            poll_interval_ms: 10,
            read_timeout_ms: 2000,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            max_failures: 5,
            max_workers: 4,
            reseed_after_drain: true,
        }
    }

    fn trusting(ids: &[&str]) -> EntropyAccountant {
        ids.iter().fold(
            EntropyAccountant::new(AccountingConfig::default()),
            |acc, id| acc.with_trust(*id, TrustLevel::Trusted),
        )
    }

    fn scheduler(
        config: SchedulerConfig,
        sources: Vec<ScheduledSource>,
        accountant: EntropyAccountant,
        mock: &MockPoolDevice,
    ) -> Scheduler {
        let device = SharedPoolDevice::new(mock.clone());
        let feedback = KernelFeedback::with_reseed_window(device.clone(), Duration::ZERO);
        Scheduler::new(
            config,
            sources,
            accountant,
            feedback,
            KernelPoolSource::new(device),
        )
        .unwrap()
    }

    #[test]
    fn test_drains_in_priority_order_until_high_watermark() {
        let first = ScriptedSource::new("first");
        let second = ScriptedSource::new("second");
        first.push(Step::Bytes(100));
        second.push(Step::Bytes(100));
        let mock = MockPoolDevice::new(50, 4096);

        // Given out of order; priority decides.
        let mut scheduler = scheduler(
            config(),
            vec![
                ScheduledSource::new(second.boxed()).priority(2),
                ScheduledSource::new(first.boxed()).priority(1),
            ],
            trusting(&["first", "second"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.sources_read, vec!["first".to_string()]);
        assert_eq!(first.reads(), vec![19]);
        assert!(second.reads().is_empty());
        assert_eq!(report.estimate_before, 50);
        assert!(report.estimate_after >= 200);
        assert!(mock.count() >= 200);
        assert!(report.reseeded);
        assert_eq!(mock.reseed_count(), 1);
    }

    #[test]
    fn test_short_sample_moves_to_next_source() {
        let first = ScriptedSource::new("first");
        let second = ScriptedSource::new("second");
        first.push(Step::Bytes(10));
        let mock = MockPoolDevice::new(50, 4096);

        let mut scheduler = scheduler(
            config(),
            vec![
                ScheduledSource::new(first.boxed()).priority(1),
                ScheduledSource::new(second.boxed()).priority(2),
            ],
            trusting(&["first", "second"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.sources_read, vec!["first", "second"]);
        // 50 + 80 leaves 70 bits to the high watermark.
        assert_eq!(second.reads(), vec![9]);
        assert_eq!(report.accounted_bits, 80 + 72);
    }

    #[test]
    fn test_no_drain_above_low_watermark() {
        let source = ScriptedSource::new("s");
        let mock = MockPoolDevice::new(150, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert!(report.sources_read.is_empty());
        assert_eq!(source.opens(), 0);
        assert!(!report.reseeded);
        assert!(mock.write_calls().is_empty());
    }

    #[test]
    fn test_untrusted_source_mixed_without_credit() {
        let source = ScriptedSource::new("jitter");
        let mock = MockPoolDevice::new(0, 4096);
        let mut config = config();
        config.max_workers = 1;
        let mut scheduler = scheduler(
            config,
            vec![ScheduledSource::new(source.boxed()).max_read_bytes(16)],
            trusting(&[]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.accounted_bits, 0);
        assert_eq!(report.unaccounted_bytes, 16);
        assert!(!report.reseeded);
        assert_eq!(
            mock.write_calls(),
            vec![DeviceCall::WriteUnaccounted { len: 16 }]
        );
    }

    #[test]
    fn test_lazy_open_and_authentication() {
        let source = ScriptedSource::new("token").requiring_auth();
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())
                .credential(Credential::new(Role::User, "1234"))],
            trusting(&["token"]),
            &mock,
        );
        assert_eq!(source.opens(), 0);
        assert_eq!(scheduler.status()[0].state, SourceState::Closed);

        scheduler.run_cycle();
        assert_eq!(source.opens(), 1);
        assert_eq!(source.credentials().len(), 1);
        assert_eq!(scheduler.status()[0].state, SourceState::Idle);

        // Stays open and authenticated across cycles.
        mock.set_count(0);
        scheduler.run_cycle();
        assert_eq!(source.opens(), 1);
        assert_eq!(source.credentials().len(), 1);

        // A dropped session is reopened and re-authenticated.
        source.drop_session();
        mock.set_count(0);
        scheduler.run_cycle();
        assert_eq!(source.opens(), 2);
        assert_eq!(source.credentials().len(), 2);
    }

    #[test]
    fn test_configured_credential_applied_without_login_requirement() {
        let source = ScriptedSource::new("token");
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())
                .credential(Credential::new(Role::SecurityOfficer, "1234"))],
            trusting(&["token"]),
            &mock,
        );

        scheduler.run_cycle();
        let credentials = source.credentials();
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].role, Role::SecurityOfficer);
        assert_eq!(source.reads().len(), 1);
    }

    #[test]
    fn test_missing_credential_faults_source() {
        let source = ScriptedSource::new("token").requiring_auth();
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["token"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.failures, 1);
        assert!(matches!(
            scheduler.status()[0].state,
            SourceState::Faulted { failures: 1, .. }
        ));
    }

    #[test]
    fn test_disabled_after_max_failures_until_reset() {
        let source = ScriptedSource::new("flaky");
        for _ in 0..5 {
            source.push(Step::Fail(SourceError::IoFailure("gone".into())));
        }
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["flaky"]),
            &mock,
        );

        for _ in 0..5 {
            scheduler.run_cycle();
        }
        let status = &scheduler.status()[0];
        assert!(status.state.is_disabled());
        assert_eq!(status.failures, 5);
        assert_eq!(source.closes(), 1);

        // Excluded from later cycles.
        scheduler.run_cycle();
        assert_eq!(source.reads().len(), 5);

        scheduler.reset_source("flaky").unwrap();
        assert_eq!(scheduler.status()[0].state, SourceState::Closed);
        let report = scheduler.run_cycle();
        assert_eq!(report.sources_read, vec!["flaky"]);
        assert_eq!(source.opens(), 2);
        assert_eq!(scheduler.status()[0].failures, 0);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let source = ScriptedSource::new("s");
        source.push(Step::Fail(SourceError::IoFailure("blip".into())));
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );

        scheduler.run_cycle();
        assert_eq!(scheduler.status()[0].failures, 1);
        scheduler.run_cycle();
        assert_eq!(scheduler.status()[0].failures, 0);
        assert_eq!(scheduler.status()[0].state, SourceState::Idle);
    }

    #[test]
    fn test_backoff_skips_source() {
        let source = ScriptedSource::new("s");
        source.push(Step::Fail(SourceError::IoFailure("blip".into())));
        let mock = MockPoolDevice::new(0, 4096);
        let mut config = config();
        config.backoff_base_ms = 60_000;
        config.backoff_max_ms = 60_000;
        let mut scheduler = scheduler(
            config,
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );

        scheduler.run_cycle();
        scheduler.run_cycle();
        assert_eq!(source.reads().len(), 1);
    }

    #[test]
    fn test_init_failure_disables_immediately() {
        let source = ScriptedSource::new("s");
        source.push_open(Err(SourceError::InitFailure("self-test".into())));
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );

        scheduler.run_cycle();
        assert!(scheduler.status()[0].state.is_disabled());
    }

    #[test]
    fn test_unavailable_at_open_is_transient() {
        let source = ScriptedSource::new("s");
        source.push_open(Err(SourceError::SourceUnavailable("unplugged".into())));
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );

        scheduler.run_cycle();
        assert!(matches!(
            scheduler.status()[0].state,
            SourceState::Faulted { .. }
        ));
        scheduler.run_cycle();
        assert_eq!(scheduler.status()[0].state, SourceState::Idle);
    }

    #[test]
    fn test_overclaim_rejected_source_stays_idle() {
        let source = ScriptedSource::new("liar");
        source.push(Step::Claim(4, 64));
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["liar"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.accounted_bits, 0);
        assert!(mock.write_calls().is_empty());
        assert_eq!(scheduler.status()[0].state, SourceState::Idle);
        assert_eq!(scheduler.accountant().stats().overclaims, 1);
    }

    #[test]
    fn test_timeout_faults_without_blocking_other_sources() {
        let slow = ScriptedSource::new("slow");
        slow.push(Step::Stall(Duration::from_millis(500)));
        let fast = ScriptedSource::new("fast");
        let mock = MockPoolDevice::new(0, 4096);
        let mut config = config();
        config.read_timeout_ms = 50;
        config.backoff_base_ms = 60_000;
        config.backoff_max_ms = 60_000;

        let mut scheduler = scheduler(
            config,
            vec![
                ScheduledSource::new(slow.boxed()).priority(1),
                ScheduledSource::new(fast.boxed()).priority(2),
            ],
            trusting(&["slow", "fast"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.failures, 1);
        assert_eq!(report.sources_read, vec!["fast"]);
        assert!(matches!(
            scheduler.status()[0].state,
            SourceState::Faulted { .. }
        ));

        let handle = scheduler.handle();
        handle.shutdown();
        scheduler.run();
        // The late read finished before shutdown returned; its sample was dropped.
        assert_eq!(slow.closes(), 1);
        assert_eq!(scheduler.status()[0].bytes_read, 0);
    }

    #[test]
    fn test_busy_handle_never_read_concurrently() {
        let source = ExclusiveSource::new("hsm", Duration::from_millis(60));
        let mock = MockPoolDevice::new(0, 1 << 20);
        let mut config = config();
        config.read_timeout_ms = 10;
        config.backoff_base_ms = 0;
        config.backoff_max_ms = 0;
        config.max_failures = 1000;
        config.high_watermark = 1 << 20;
        config.low_watermark = 1 << 20;

        let mut scheduler = scheduler(
            config,
            vec![ScheduledSource::new(Box::new(source.clone()))],
            trusting(&["hsm"]),
            &mock,
        );

        for _ in 0..20 {
            scheduler.run_cycle();
            std::thread::sleep(Duration::from_millis(5));
        }
        scheduler.handle().shutdown();
        scheduler.run();

        assert!(source.reads() >= 1);
        assert_eq!(source.overlaps(), 0);
    }

    #[test]
    fn test_feedback_failure_not_credited() {
        let source = ScriptedSource::new("s");
        let mock = MockPoolDevice::new(0, 4096);
        mock.set_fail_writes(true);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.accounted_bits, 0);
        assert_eq!(report.estimate_after, 0);
        assert!(!report.reseeded);
        assert_eq!(scheduler.status()[0].failures, 0);
        assert_eq!(scheduler.feedback().stats().rejections, 1);
    }

    #[test]
    fn test_truncated_agent_response_never_reaches_accountant() {
        let transport = ScriptedTransport::new(vec![
            b"OK Pleased to meet you".to_vec(),
            b"S SERIALNO D2760001240102010006".to_vec(),
            b"OK".to_vec(),
            b"OK".to_vec(),
            // SCD RANDOM 19 answered with 3 bytes, then the socket closes.
            b"D abc".to_vec(),
        ]);
        let agent = SmartcardAgentSource::with_connector(
            "agent",
            AgentConfig {
                socket_path: "/run/gnupg/S.gpg-agent".into(),
                card: None,
                require_pin: false,
                io_timeout_ms: 0,
            },
            Box::new(move |_| Ok(Box::new(transport.clone()) as Box<dyn AgentTransport>)),
        );
        let mock = MockPoolDevice::new(50, 4096);
        let mut scheduler = scheduler(
            config(),
            vec![ScheduledSource::new(Box::new(agent))],
            trusting(&["agent"]),
            &mock,
        );

        let report = scheduler.run_cycle();

        assert_eq!(report.failures, 1);
        assert!(report.sources_read.is_empty());
        let stats = scheduler.accountant().stats();
        assert_eq!(stats.accounted + stats.unaccounted + stats.overclaims, 0);
        assert!(mock.write_calls().is_empty());
    }

    #[test]
    fn test_pool_failure_skips_cycle() {
        struct BrokenPool;
        impl crate::feedback::PoolDevice for BrokenPool {
            fn entropy_count(&mut self) -> std::io::Result<u32> {
                Err(std::io::Error::other("no pool"))
            }
            fn capacity(&mut self) -> std::io::Result<u32> {
                Err(std::io::Error::other("no pool"))
            }
            fn add_entropy(&mut self, _: u32, _: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
            fn write_unaccounted(&mut self, _: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
            fn reseed(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let source = ScriptedSource::new("s");
        let device = SharedPoolDevice::new(BrokenPool);
        let mut scheduler = Scheduler::new(
            config(),
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            KernelFeedback::with_reseed_window(device.clone(), Duration::ZERO),
            KernelPoolSource::new(device),
        )
        .unwrap();

        let report = scheduler.run_cycle();
        assert!(report.skipped);
        assert!(source.reads().is_empty());
    }

    #[test]
    fn test_duplicate_and_invalid_config_rejected() {
        let mock = MockPoolDevice::new(0, 4096);
        let device = SharedPoolDevice::new(mock);
        let build = |config, sources| {
            Scheduler::new(
                config,
                sources,
                trusting(&[]),
                KernelFeedback::with_reseed_window(device.clone(), Duration::ZERO),
                KernelPoolSource::new(device.clone()),
            )
        };

        let a = ScriptedSource::new("a");
        let result = build(
            config(),
            vec![
                ScheduledSource::new(a.boxed()),
                ScheduledSource::new(a.boxed()),
            ],
        );
        assert!(matches!(result, Err(SchedulerError::DuplicateSource(id)) if id == "a"));

        let mut inverted = config();
        inverted.low_watermark = 300;
        assert!(matches!(
            build(inverted, Vec::new()),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_handle_controls_running_loop() {
        let source = ScriptedSource::new("s");
        source.push(Step::Fail(SourceError::IoFailure("x".into())));
        let mock = MockPoolDevice::new(0, 4096);
        let mut config = config();
        config.max_failures = 1;
        config.poll_interval_ms = 60_000;
        let mut scheduler = scheduler(
            config,
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );
        let handle = scheduler.handle();

        let runner = std::thread::spawn(move || {
            scheduler.run();
            scheduler
        });

        std::thread::sleep(Duration::from_millis(100));
        handle.reset("s");
        handle.wake();
        std::thread::sleep(Duration::from_millis(100));
        handle.shutdown();
        let scheduler = runner.join().unwrap();

        assert_eq!(source.reads().len(), 2);
        assert_eq!(scheduler.status()[0].state, SourceState::Closed);
    }

    #[test]
    fn test_wake_during_drain_starts_next_cycle_immediately() {
        let source = ScriptedSource::new("s");
        let mock = MockPoolDevice::new(0, 4096);
        let mut config = config();
        config.poll_interval_ms = 60_000;
        let mut scheduler = scheduler(
            config,
            vec![ScheduledSource::new(source.boxed())],
            trusting(&["s"]),
            &mock,
        );

        // Picked up by the control poll between drains.
        scheduler.handle().wake();
        scheduler.run_cycle();
        assert_eq!(source.reads().len(), 1);

        let started = Instant::now();
        scheduler.wait_for_control();
        assert!(started.elapsed() < Duration::from_secs(5));

        // The latch is single-use.
        scheduler.handle().shutdown();
        scheduler.wait_for_control();
        assert!(scheduler.stopping);
    }

    #[test]
    fn test_high_watermark_clamped_to_capacity() {
        let first = ScriptedSource::new("a");
        let second = ScriptedSource::new("b");
        let mock = MockPoolDevice::new(0, 256);
        let mut config = config();
        config.low_watermark = 1000;
        config.high_watermark = 4000;
        let mut scheduler = scheduler(
            config,
            vec![
                ScheduledSource::new(first.boxed()).priority(0),
                ScheduledSource::new(second.boxed()).priority(1),
            ],
            trusting(&["a", "b"]),
            &mock,
        );

        // 32 bytes fill the 256-bit pool; the second source is left alone.
        let report = scheduler.run_cycle();
        assert_eq!(first.reads(), vec![32]);
        assert!(second.reads().is_empty());
        assert_eq!(report.accounted_bits, 256);

        // A full pool sits above the clamped low watermark.
        scheduler.run_cycle();
        assert_eq!(first.reads().len(), 1);
    }

    #[test]
    fn test_unknown_reset() {
        let mock = MockPoolDevice::new(0, 4096);
        let mut scheduler = scheduler(config(), Vec::new(), trusting(&[]), &mock);
        assert_eq!(
            scheduler.reset_source("nope"),
            Err(SchedulerError::UnknownSource("nope".into()))
        );
    }
}
