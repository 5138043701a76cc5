//! Bounded read workers.
//!
//! Each read runs on its own short-lived thread so the coordinating loop
//! can give up on it after the per-read timeout. A worker that outlives
//! its timeout keeps the source lock until the library call returns; its
//! result is then dropped.

use crate::source::{Credential, EntropySample, EntropySource, SourceError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub(crate) type SourceHandle = Arc<Mutex<Box<dyn EntropySource>>>;

/// Step of a drain that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Open,
    Authenticate,
    Read,
}

pub(crate) struct ReadJob {
    pub handle: SourceHandle,
    pub busy: Arc<AtomicBool>,
    pub credential: Option<Credential>,
    pub authenticated: bool,
    pub max_len: usize,
}

#[derive(Debug)]
pub(crate) struct ReadReport {
    /// The worker had to open the session first.
    pub opened: bool,
    /// The session is authenticated after this job.
    pub authenticated: bool,
    pub result: Result<EntropySample, (Stage, SourceError)>,
}

impl ReadJob {
    fn run(self) -> ReadReport {
        let mut source = match self.handle.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return ReadReport {
                    opened: false,
                    authenticated: false,
                    result: Err((
                        Stage::Read,
                        SourceError::IoFailure("source handle poisoned by an earlier panic".into()),
                    )),
                }
            }
        };

        let mut report = ReadReport {
            opened: false,
            authenticated: self.authenticated,
            result: Err((Stage::Read, SourceError::NotOpen)),
        };

        if !source.is_open() {
            if let Err(e) = source.open() {
                report.authenticated = false;
                report.result = Err((Stage::Open, e));
                return report;
            }
            report.opened = true;
            report.authenticated = false;
        }

        // A configured credential is always applied, even when the source
        // could be read without it.
        if !report.authenticated {
            if let Some(credential) = &self.credential {
                if let Err(e) = source.authenticate(credential) {
                    report.result = Err((Stage::Authenticate, e));
                    return report;
                }
                report.authenticated = true;
            }
        }

        report.result = source.read(self.max_len).map_err(|e| (Stage::Read, e));
        report
    }
}

/// Releases the worker slot and the source's busy flag, even on panic.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct WorkerPool {
    max_workers: usize,
    in_flight: Arc<AtomicUsize>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            threads: Vec::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Starts `job` on a new worker. Returns `None` if every worker slot
    /// is taken or the thread could not be spawned.
    pub fn dispatch(&mut self, source_id: &str, job: ReadJob) -> Option<Receiver<ReadReport>> {
        self.reap();
        if self.in_flight() >= self.max_workers {
            return None;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        job.busy.store(true, Ordering::SeqCst);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            busy: Arc::clone(&job.busy),
        };

        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("read-{}", source_id))
            .spawn(move || {
                let report = job.run();
                // Release before reporting so the next cycle sees the handle free.
                drop(guard);
                // The receiver is gone if the read timed out.
                let _ = tx.send(report);
            });

        match spawned {
            Ok(handle) => {
                self.threads.push(handle);
                Some(rx)
            }
            Err(e) => {
                tracing::error!(source = %source_id, error = %e, "Failed to spawn read worker");
                None
            }
        }
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.threads.drain(..).partition(|t| t.is_finished());
        self.threads = running;
        for thread in finished {
            if thread.join().is_err() {
                tracing::warn!("Read worker panicked");
            }
        }
    }

    /// Waits for every outstanding worker.
    pub fn join_all(&mut self) {
        let outstanding = self.threads.len();
        if outstanding > 0 {
            tracing::info!(outstanding, "Waiting for in-flight reads");
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::warn!("Read worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSource, Step};
    use std::time::Duration;

    fn job(source: &ScriptedSource, busy: &Arc<AtomicBool>) -> ReadJob {
        ReadJob {
            handle: Arc::new(Mutex::new(source.boxed())),
            busy: Arc::clone(busy),
            credential: None,
            authenticated: false,
            max_len: 16,
        }
    }

    #[test]
    fn test_opens_lazily_and_reads() {
        let source = ScriptedSource::new("s");
        let busy = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool::new(2);

        let rx = pool.dispatch("s", job(&source, &busy)).unwrap();
        let report = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(report.opened);
        assert_eq!(report.result.unwrap().len(), 16);
        pool.join_all();
        assert!(!busy.load(Ordering::SeqCst));
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_saturated_pool_refuses() {
        let slow = ScriptedSource::new("slow");
        slow.push(Step::Stall(Duration::from_millis(200)));
        let busy = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool::new(1);

        let _rx = pool.dispatch("slow", job(&slow, &busy)).unwrap();
        let other = Arc::new(AtomicBool::new(false));
        assert!(pool
            .dispatch("other", job(&ScriptedSource::new("other"), &other))
            .is_none());
        assert!(!other.load(Ordering::SeqCst));

        pool.join_all();
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_open_error_reported_with_stage() {
        let source = ScriptedSource::new("s");
        source.push_open(Err(SourceError::InitFailure("bad".into())));
        let busy = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool::new(1);

        let report = pool
            .dispatch("s", job(&source, &busy))
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();

        assert!(matches!(
            report.result,
            Err((Stage::Open, SourceError::InitFailure(_)))
        ));
        pool.join_all();
    }
}
