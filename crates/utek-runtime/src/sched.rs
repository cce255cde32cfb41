//! Scheduler: a bounded pool of execution units over a shared job queue.
//!
//! Workers block on the queue's condvar, take the next submitted package,
//! and run it on their own unit. The audit sink and the locked-hash set
//! are the only state shared across workers; both live behind `Arc`
//! handles owned here and passed into each unit.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use utek_contracts::UTEK_STATUS_REPORT_SCHEMA_VERSION;
use utek_crypto::CryptoEngine;
use utek_pkg::ProgramPackage;

use crate::audit::AuditSink;
use crate::context::ResourceLimits;
use crate::net::{RemoteTransport, SimulatedTransport};
use crate::report::{RunReport, UnitStatus};
use crate::unit::{ExecutionUnit, UnitShared};

pub const DEFAULT_POOL_SIZE: usize = 8;

/// Content hashes currently holding an execution lock (`LOCK_EXEC`).
#[derive(Debug, Default)]
pub struct LockSet {
    inner: Mutex<HashSet<String>>,
}

impl LockSet {
    pub fn new() -> Self {
        LockSet::default()
    }

    /// Returns `true` if the lock was acquired.
    pub fn lock(&self, hash: &str) -> bool {
        self.inner
            .lock()
            .expect("lock set poisoned")
            .insert(hash.to_string())
    }

    pub fn unlock(&self, hash: &str) -> bool {
        self.inner.lock().expect("lock set poisoned").remove(hash)
    }

    pub fn is_locked(&self, hash: &str) -> bool {
        self.inner.lock().expect("lock set poisoned").contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub pool_size: usize,
    pub base_limits: ResourceLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            pool_size: DEFAULT_POOL_SIZE,
            base_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("program hash {0} is locked")]
    HashLocked(String),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("invalid package: {0}")]
    InvalidPackage(String),
}

struct Job {
    package: ProgramPackage,
    reply: mpsc::Sender<RunReport>,
}

struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
}

struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl JobQueue {
    fn new() -> Self {
        JobQueue {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn push(&self, job: Job) -> bool {
        let mut state = self.state.lock().expect("job queue poisoned");
        if state.closed {
            return false;
        }
        state.jobs.push_back(job);
        self.available.notify_one();
        true
    }

    fn pop(&self, shutdown: &AtomicBool) -> Option<Job> {
        let mut state = self.state.lock().expect("job queue poisoned");
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.closed {
                return None;
            }
            state = self.available.wait(state).expect("job queue poisoned");
        }
    }

    fn close(&self) {
        self.state.lock().expect("job queue poisoned").closed = true;
        self.available.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().expect("job queue poisoned").jobs.len()
    }
}

/// Receipt for one submitted package.
pub struct JobHandle {
    hash: String,
    receiver: mpsc::Receiver<RunReport>,
}

impl JobHandle {
    pub fn program_hash(&self) -> &str {
        &self.hash
    }

    /// Block until the run finishes. Errors only if the scheduler was shut
    /// down before the job ran.
    pub fn wait(&self) -> anyhow::Result<RunReport> {
        self.receiver
            .recv()
            .map_err(|_| anyhow::anyhow!("scheduler shut down before the job ran"))
    }

    pub fn try_report(&self) -> Option<RunReport> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub id: u32,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub schema_version: String,
    pub pool_size: usize,
    pub units: Vec<UnitSnapshot>,
    pub queued_jobs: usize,
    pub audit_records: usize,
    pub locked_hashes: usize,
    pub shutting_down: bool,
}

pub struct Scheduler {
    queue: Arc<JobQueue>,
    workers: Vec<JoinHandle<()>>,
    shared: UnitShared,
    unit_status: Arc<Vec<Mutex<UnitStatus>>>,
    pool_size: usize,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(SimulatedTransport),
            CryptoEngine::new(),
            Arc::new(AuditSink::new()),
        )
    }

    pub fn with_parts(
        config: RuntimeConfig,
        transport: Arc<dyn RemoteTransport>,
        crypto: CryptoEngine,
        audit: Arc<AuditSink>,
    ) -> Self {
        let pool_size = config.pool_size.max(1);
        let shared = UnitShared {
            audit,
            locks: Arc::new(LockSet::new()),
            transport,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        let queue = Arc::new(JobQueue::new());
        let unit_status: Arc<Vec<Mutex<UnitStatus>>> = Arc::new(
            (0..pool_size)
                .map(|_| Mutex::new(UnitStatus::Idle))
                .collect(),
        );

        let mut workers = Vec::with_capacity(pool_size);
        for unit_id in 0..pool_size as u32 {
            let queue = Arc::clone(&queue);
            let shared = shared.clone();
            let statuses = Arc::clone(&unit_status);
            let limits = config.base_limits.clone();
            let crypto = crypto.clone();
            let handle = std::thread::Builder::new()
                .name(format!("utek-unit-{unit_id:03}"))
                .spawn(move || {
                    let mut unit =
                        ExecutionUnit::with_limits(unit_id, shared.clone(), crypto, limits);
                    while let Some(job) = queue.pop(&shared.shutdown) {
                        set_status(&statuses, unit_id, UnitStatus::Running);
                        let report = unit.run(&job.package);
                        set_status(&statuses, unit_id, report.status);
                        // The submitter may have dropped its handle.
                        let _ = job.reply.send(report);
                        set_status(&statuses, unit_id, UnitStatus::Idle);
                    }
                    set_status(&statuses, unit_id, UnitStatus::Idle);
                })
                .expect("spawn worker thread");
            workers.push(handle);
        }

        Scheduler {
            queue,
            workers,
            shared,
            unit_status,
            pool_size,
        }
    }

    /// Enqueue a package. Submission is rejected (not deferred) when the
    /// package's content hash currently holds an execution lock.
    pub fn submit(&self, package: ProgramPackage) -> Result<JobHandle, SubmitError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        let hash = package
            .content_hash()
            .map_err(|e| SubmitError::InvalidPackage(format!("{e:#}")))?;
        if self.shared.locks.is_locked(&hash) {
            return Err(SubmitError::HashLocked(hash));
        }
        let (reply, receiver) = mpsc::channel();
        let accepted = self.queue.push(Job { package, reply });
        if !accepted {
            return Err(SubmitError::ShuttingDown);
        }
        Ok(JobHandle { hash, receiver })
    }

    pub fn audit(&self) -> Arc<AuditSink> {
        Arc::clone(&self.shared.audit)
    }

    pub fn locks(&self) -> Arc<LockSet> {
        Arc::clone(&self.shared.locks)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            schema_version: UTEK_STATUS_REPORT_SCHEMA_VERSION.to_string(),
            pool_size: self.pool_size,
            units: self
                .unit_status
                .iter()
                .enumerate()
                .map(|(id, status)| UnitSnapshot {
                    id: id as u32,
                    status: *status.lock().expect("status poisoned"),
                })
                .collect(),
            queued_jobs: self.queue.len(),
            audit_records: self.shared.audit.len(),
            locked_hashes: self.shared.locks.len(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Stop intake, signal every unit, and wait up to `grace` for in-flight
    /// instructions to finish. Workers still running after the grace
    /// period are detached; their units observe the shutdown flag at the
    /// next cycle boundary.
    pub fn shutdown(mut self, grace: Duration) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.queue.close();

        let deadline = Instant::now() + grace;
        let mut remaining = std::mem::take(&mut self.workers);
        while !remaining.is_empty() && Instant::now() < deadline {
            remaining.retain(|handle| !handle.is_finished());
            if remaining.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        for handle in remaining {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("worker still busy after grace period; detaching");
                drop(handle);
            }
        }
    }

    /// Drain gracefully: close intake, let queued jobs finish, then join.
    pub fn drain(mut self) {
        self.queue.close();
        for handle in std::mem::take(&mut self.workers) {
            let _ = handle.join();
        }
    }
}

fn set_status(statuses: &[Mutex<UnitStatus>], unit_id: u32, status: UnitStatus) {
    if let Some(slot) = statuses.get(unit_id as usize) {
        *slot.lock().expect("status poisoned") = status;
    }
}
