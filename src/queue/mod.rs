//! Job queue: ordering, isolation and the device-memory ledger.
//!
//! The queue owns the job list and the [`BudgetLedger`]. Promotion from
//! queued to running reserves the job's preset budget; every terminal
//! transition releases it. Listeners observe each transition after the
//! internal lock has been dropped, so a listener may query the queue.
//!
//! A queue can be mirrored to a state file with [`JobQueue::sync`]. Other
//! processes edit that file through [`store::edit`]; records they add are
//! picked up as queued jobs and records they drop are cancelled.

pub mod store;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::pipeline::{JobFailure, JobOutcome, JobReporter, JobSummary, Stage};
use crate::presets::{Preset, PresetName, preset_for};
use crate::scheduler::{BudgetLedger, LedgerSnapshot};

pub use store::{JobRecord, QueueFile};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Extracting,
    Upscaling,
    Interpolating,
    Encoding,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Extracting => "extracting",
            Self::Upscaling => "upscaling",
            Self::Interpolating => "interpolating",
            Self::Encoding => "encoding",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminal() && *self != Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub preset: PresetName,
    pub interpolate: bool,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<JobSummary>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub preset: PresetName,
    /// Run the preset's frame-rate stage. Off keeps the source rate.
    pub interpolate: bool,
}

impl JobRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, preset: PresetName) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            preset,
            interpolate: true,
        }
    }

    pub fn with_interpolation(mut self, enabled: bool) -> Self {
        self.interpolate = enabled;
        self
    }
}

/// Cooperative cancellation flag shared between the queue and a sequencer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A job handed to a worker by [`JobQueue::next`].
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub id: JobId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub preset: Preset,
    pub interpolate: bool,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobEventKind {
    Enqueued,
    Started,
    StatusChanged,
    Progress,
    CancelRequested,
    /// A queued job was cancelled and dropped from the list.
    Removed,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
}

type Listener = Box<dyn Fn(&JobEvent) + Send + Sync>;

struct QueueState {
    jobs: Vec<Job>,
    ledger: BudgetLedger,
    tokens: Vec<(JobId, CancelToken)>,
    next_id: JobId,
    /// Ids present in the state file as of the last load or sync.
    persisted: BTreeSet<JobId>,
}

impl QueueState {
    fn position(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    fn running(&self) -> usize {
        self.jobs.iter().filter(|j| j.status.is_running()).count()
    }

    fn has_queued(&self) -> bool {
        self.jobs.iter().any(|j| j.status == JobStatus::Queued)
    }

    fn token(&self, id: JobId) -> Option<&CancelToken> {
        self.tokens.iter().find(|(j, _)| *j == id).map(|(_, t)| t)
    }

    fn is_duplicate(&self, input: &Path) -> bool {
        self.jobs
            .iter()
            .any(|j| !j.status.is_terminal() && j.input == input)
    }

    /// Removes a queued job or flags a running one. Terminal jobs are left
    /// untouched.
    fn cancel(&mut self, id: JobId) -> PipelineResult<Option<JobEvent>> {
        let pos = self.position(id).ok_or(PipelineError::UnknownJob(id))?;
        let status = self.jobs[pos].status;
        if status == JobStatus::Queued {
            let mut job = self.jobs.remove(pos);
            job.status = JobStatus::Cancelled;
            info!(job = id, "Queued job cancelled");
            Ok(Some(JobEvent {
                kind: JobEventKind::Removed,
                job,
            }))
        } else if status.is_running() {
            if let Some(token) = self.token(id) {
                token.cancel();
            }
            info!(job = id, "Cancellation requested");
            Ok(Some(JobEvent {
                kind: JobEventKind::CancelRequested,
                job: self.jobs[pos].clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Takes a persisted record back into the list under its own id. A
    /// record caught mid-run comes back queued.
    fn adopt(&mut self, record: JobRecord) -> PipelineResult<Job> {
        let pending = record.is_pending();
        if pending && self.is_duplicate(&record.input) {
            return Err(PipelineError::DuplicateJob {
                path: record.input,
            });
        }
        let id = if record.id == 0 || self.position(record.id).is_some() {
            warn!(job = record.id, reassigned = self.next_id, "Persisted job id already in use");
            self.next_id
        } else {
            record.id
        };
        self.next_id = self.next_id.max(id + 1);

        let status = if pending {
            JobStatus::Queued
        } else {
            record.status
        };
        let job = Job {
            id,
            input: record.input,
            output: record.output,
            preset: record.preset,
            interpolate: record.interpolate,
            status,
            progress: if status == JobStatus::Done { 1.0 } else { 0.0 },
            error: record.error,
            summary: None,
            enqueued_at: record.enqueued_at,
        };
        self.jobs.push(job.clone());
        Ok(job)
    }

    fn records(&self) -> Vec<JobRecord> {
        self.jobs.iter().map(JobRecord::from_job).collect()
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    listeners: RwLock<Vec<Listener>>,
    max_concurrent: usize,
}

impl JobQueue {
    /// Queue over `device_memory` bytes running at most `max_concurrent`
    /// jobs at once.
    pub fn new(device_memory: u64, max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: Vec::new(),
                ledger: BudgetLedger::new(device_memory),
                tokens: Vec::new(),
                next_id: 1,
                persisted: BTreeSet::new(),
            }),
            changed: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<JobEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for event in &events {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    pub fn enqueue(&self, request: JobRequest) -> PipelineResult<JobId> {
        let mut state = self.lock();
        if state.is_duplicate(&request.input) {
            return Err(PipelineError::DuplicateJob {
                path: request.input,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let job = Job {
            id,
            input: request.input,
            output: request.output,
            preset: request.preset,
            interpolate: request.interpolate,
            status: JobStatus::Queued,
            progress: 0.0,
            error: None,
            summary: None,
            enqueued_at: Utc::now(),
        };
        info!(job = id, input = %job.input.display(), preset = %job.preset, "Job enqueued");
        let event = JobEvent {
            kind: JobEventKind::Enqueued,
            job: job.clone(),
        };
        state.jobs.push(job);
        drop(state);

        self.changed.notify_all();
        self.emit(vec![event]);
        Ok(id)
    }

    /// Promotes the oldest queued job when the concurrency bound and the
    /// ledger allow it. Never skips over a queued job that does not fit.
    pub fn next(&self) -> Option<RunningJob> {
        let mut state = self.lock();
        let (job, events) = self.promote(&mut state);
        drop(state);
        self.emit(events);
        job
    }

    /// Like [`JobQueue::next`], but blocks until a job can be promoted.
    /// Returns `None` once nothing is queued or running.
    pub fn wait_next(&self) -> Option<RunningJob> {
        let mut state = self.lock();
        loop {
            let (job, events) = self.promote(&mut state);
            if job.is_some() || !events.is_empty() {
                drop(state);
                self.emit(events);
                if job.is_some() {
                    return job;
                }
                state = self.lock();
                continue;
            }
            if !state.has_queued() && state.running() == 0 {
                return None;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn promote(&self, state: &mut QueueState) -> (Option<RunningJob>, Vec<JobEvent>) {
        let mut events = Vec::new();
        loop {
            if state.running() >= self.max_concurrent {
                return (None, events);
            }
            let Some(pos) = state.jobs.iter().position(|j| j.status == JobStatus::Queued) else {
                return (None, events);
            };
            let id = state.jobs[pos].id;
            let preset = preset_for(state.jobs[pos].preset);

            if !state.ledger.can_ever_fit(preset.vram_budget) {
                let err = PipelineError::ResourceExhausted {
                    batch_size: 0,
                    budget: state.ledger.capacity(),
                    halvings: 0,
                };
                warn!(job = id, budget = preset.vram_budget, capacity = state.ledger.capacity(), "Preset budget exceeds device memory");
                let job = &mut state.jobs[pos];
                job.status = JobStatus::Failed;
                job.error = Some(JobFailure::new(Stage::Schedule, &err, None));
                events.push(JobEvent {
                    kind: JobEventKind::Finished,
                    job: job.clone(),
                });
                continue;
            }

            if !state.ledger.try_acquire(id, preset.vram_budget) {
                return (None, events);
            }

            let token = CancelToken::default();
            state.tokens.push((id, token.clone()));
            let job = &mut state.jobs[pos];
            job.status = JobStatus::Extracting;
            debug!(job = id, preset = %job.preset, "Job promoted");
            events.push(JobEvent {
                kind: JobEventKind::Started,
                job: job.clone(),
            });
            let running = RunningJob {
                id,
                input: job.input.clone(),
                output: job.output.clone(),
                preset,
                interpolate: job.interpolate,
                cancel: token,
            };
            return (Some(running), events);
        }
    }

    /// Cancels a job. A queued job is removed outright; a running job is
    /// flagged and stops at its next batch boundary. Terminal jobs are left
    /// untouched.
    pub fn cancel(&self, id: JobId) -> PipelineResult<()> {
        let event = self.lock().cancel(id)?;

        self.changed.notify_all();
        self.emit(event.into_iter().collect());
        Ok(())
    }

    /// Records a running job's terminal state and releases its budget.
    pub fn finish(&self, id: JobId, outcome: JobOutcome) -> PipelineResult<()> {
        let mut state = self.lock();
        let pos = state.position(id).ok_or(PipelineError::UnknownJob(id))?;
        state.ledger.release(id);
        state.tokens.retain(|(j, _)| *j != id);

        let job = &mut state.jobs[pos];
        match outcome {
            JobOutcome::Done(summary) => {
                job.status = JobStatus::Done;
                job.progress = 1.0;
                job.summary = Some(summary);
            }
            JobOutcome::Failed(failure) => {
                job.status = JobStatus::Failed;
                job.error = Some(failure);
            }
            JobOutcome::Cancelled => job.status = JobStatus::Cancelled,
        }
        info!(job = id, status = %job.status, "Job finished");
        let event = JobEvent {
            kind: JobEventKind::Finished,
            job: job.clone(),
        };
        drop(state);

        self.changed.notify_all();
        self.emit(vec![event]);
        Ok(())
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        let state = self.lock();
        state.position(id).map(|pos| state.jobs[pos].clone())
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.lock().ledger.snapshot()
    }

    /// Records for every job, finished ones included, in enqueue order.
    pub fn records(&self) -> Vec<JobRecord> {
        self.lock().records()
    }

    /// Takes persisted records back under their own ids. Finished records
    /// are kept for listing; anything else is queued again. Returns how
    /// many jobs were queued.
    pub fn restore(&self, records: Vec<JobRecord>) -> usize {
        let mut state = self.lock();
        let mut events = Vec::new();
        for record in records {
            let persisted = record.id;
            match state.adopt(record) {
                Ok(job) => {
                    if job.id == persisted {
                        state.persisted.insert(persisted);
                    }
                    if job.status == JobStatus::Queued {
                        events.push(JobEvent {
                            kind: JobEventKind::Enqueued,
                            job,
                        });
                    }
                }
                Err(err) => warn!(error = %err, "Skipping persisted job"),
            }
        }
        drop(state);

        let queued = events.len();
        self.changed.notify_all();
        self.emit(events);
        queued
    }

    /// Loads the state at `path` into this queue.
    pub fn load(&self, path: &Path) -> PipelineResult<usize> {
        let file = store::read(path)?;
        {
            let mut state = self.lock();
            state.next_id = state.next_id.max(file.next_id);
        }
        Ok(self.restore(file.jobs))
    }

    /// Writes this queue to `path`, replacing whatever the file held.
    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let (jobs, next_id) = {
            let state = self.lock();
            (state.records(), state.next_id)
        };
        let persisted = jobs.iter().map(|r| r.id).collect();
        store::save(
            path,
            QueueFile {
                next_id,
                jobs,
                ..QueueFile::default()
            },
        )?;
        self.lock().persisted = persisted;
        Ok(())
    }

    /// Merges edits other processes made to the state at `path`, then
    /// writes this queue back. Records added since the last sync are
    /// queued; records dropped since then are cancelled, or forgotten when
    /// already finished.
    pub fn sync(&self, path: &Path) -> PipelineResult<()> {
        // Lock order: state file, then queue.
        let events = store::edit(path, |file| {
            let mut state = self.lock();
            let mut events = Vec::new();
            state.next_id = state.next_id.max(file.next_id);
            let on_disk: BTreeSet<JobId> = file.jobs.iter().map(|r| r.id).collect();

            let dropped: Vec<JobId> = state
                .persisted
                .iter()
                .copied()
                .filter(|id| !on_disk.contains(id))
                .collect();
            for id in dropped {
                let Some(pos) = state.position(id) else {
                    continue;
                };
                if state.jobs[pos].status.is_terminal() {
                    state.jobs.remove(pos);
                } else if let Some(event) = state.cancel(id)? {
                    events.push(event);
                }
            }

            for record in file.jobs.drain(..) {
                if state.persisted.contains(&record.id) {
                    continue;
                }
                match state.adopt(record) {
                    Ok(job) if job.status == JobStatus::Queued => {
                        info!(job = job.id, input = %job.input.display(), "Picked up queued job");
                        events.push(JobEvent {
                            kind: JobEventKind::Enqueued,
                            job,
                        });
                    }
                    Ok(_) => {}
                    Err(err) => debug!(error = %err, "Ignoring persisted job"),
                }
            }

            file.jobs = state.records();
            file.next_id = state.next_id;
            state.persisted = file.jobs.iter().map(|r| r.id).collect();
            Ok(events)
        })?;

        self.changed.notify_all();
        self.emit(events);
        Ok(())
    }
}

impl JobReporter for JobQueue {
    fn status(&self, id: JobId, status: JobStatus) {
        let mut state = self.lock();
        let Some(pos) = state.position(id) else {
            return;
        };
        let job = &mut state.jobs[pos];
        if job.status == status || job.status.is_terminal() {
            return;
        }
        job.status = status;
        let event = JobEvent {
            kind: JobEventKind::StatusChanged,
            job: job.clone(),
        };
        drop(state);
        self.emit(vec![event]);
    }

    fn progress(&self, id: JobId, fraction: f64) {
        let mut state = self.lock();
        let Some(pos) = state.position(id) else {
            return;
        };
        let job = &mut state.jobs[pos];
        job.progress = fraction.clamp(0.0, 1.0);
        let event = JobEvent {
            kind: JobEventKind::Progress,
            job: job.clone(),
        };
        drop(state);
        self.emit(vec![event]);
    }
}
