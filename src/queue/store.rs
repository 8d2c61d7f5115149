use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Job, JobId, JobRequest, JobStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::JobFailure;
use crate::presets::PresetName;

const STATE_VERSION: u32 = 2;

const LOCK_RETRY: Duration = Duration::from_millis(25);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// A lock file older than this is assumed to belong to a dead process.
const LOCK_STALE: Duration = Duration::from_secs(60);

/// On-disk queue state: every known job in enqueue order.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Lowest id never handed out. Ids are not reused once a record is
    /// dropped.
    #[serde(default)]
    pub next_id: JobId,
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub preset: PresetName,
    #[serde(default = "enabled")]
    pub interpolate: bool,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub enqueued_at: DateTime<Utc>,
}

fn enabled() -> bool {
    true
}

impl JobRecord {
    pub(crate) fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            input: job.input.clone(),
            output: job.output.clone(),
            preset: job.preset,
            interpolate: job.interpolate,
            status: job.status,
            error: job.error.clone(),
            enqueued_at: job.enqueued_at,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.status.is_terminal()
    }
}

impl Default for QueueFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            next_id: 1,
            jobs: Vec::new(),
        }
    }
}

impl QueueFile {
    /// Reads the state at `path`. A missing file is an empty queue.
    pub fn read(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|err| persist_error(path, err))?;
        let mut state: QueueFile =
            serde_yaml::from_str(&content).map_err(|err| persist_error(path, err))?;
        if state.version != STATE_VERSION {
            return Err(persist_error(
                path,
                format!("unsupported state version {}", state.version),
            ));
        }
        state.jobs.sort_by_key(|r| (r.enqueued_at, r.id));
        debug!(path = %path.display(), jobs = state.jobs.len(), "Queue state loaded");
        Ok(state)
    }

    pub fn write(&mut self, path: &Path) -> PipelineResult<()> {
        self.version = STATE_VERSION;
        self.saved_at = Utc::now();
        ensure_parent(path)?;

        // Staged beside the target; the rename swaps it in atomically.
        let staging = path.with_extension("tmp");
        let file = File::create(&staging).map_err(|err| persist_error(&staging, err))?;
        serde_yaml::to_writer(file, self).map_err(|err| persist_error(&staging, err))?;
        fs::rename(&staging, path).map_err(|err| persist_error(path, err))?;
        debug!(path = %path.display(), jobs = self.jobs.len(), "Queue state saved");
        Ok(())
    }

    fn allocate_id(&mut self) -> JobId {
        let id = self
            .jobs
            .iter()
            .map(|r| r.id + 1)
            .fold(self.next_id.max(1), JobId::max);
        self.next_id = id + 1;
        id
    }

    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs.iter().find(|r| r.id == id)
    }

    /// Appends a queued record. Fails while another pending record holds
    /// the same input.
    pub fn add(&mut self, request: JobRequest) -> PipelineResult<JobId> {
        if self
            .jobs
            .iter()
            .any(|r| r.is_pending() && r.input == request.input)
        {
            return Err(PipelineError::DuplicateJob {
                path: request.input,
            });
        }
        let id = self.allocate_id();
        self.jobs.push(JobRecord {
            id,
            input: request.input,
            output: request.output,
            preset: request.preset,
            interpolate: request.interpolate,
            status: JobStatus::Queued,
            error: None,
            enqueued_at: Utc::now(),
        });
        Ok(id)
    }

    /// Drops a pending record. A runner holding the job notices the gap on
    /// its next sync and cancels it. Finished records are left alone and
    /// `None` is returned.
    pub fn cancel(&mut self, id: JobId) -> PipelineResult<Option<JobRecord>> {
        let pos = self
            .jobs
            .iter()
            .position(|r| r.id == id)
            .ok_or(PipelineError::UnknownJob(id))?;
        if !self.jobs[pos].is_pending() {
            return Ok(None);
        }
        Ok(Some(self.jobs.remove(pos)))
    }

    pub fn clear_finished(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(JobRecord::is_pending);
        before - self.jobs.len()
    }
}

/// Exclusive hold on a state file, taken as a sibling `.lock` file.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(state: &Path) -> PipelineResult<Self> {
        ensure_parent(state)?;
        let path = lock_path(state);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!(lock = %path.display(), "Removing stale queue lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LOCK_TIMEOUT {
                        return Err(persist_error(&path, "queue state is locked by another process"));
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(persist_error(&path, err)),
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "Failed to release queue lock");
        }
    }
}

fn lock_path(state: &Path) -> PathBuf {
    let mut name = OsString::from(state.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn is_stale(lock: &Path) -> bool {
    fs::metadata(lock)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE)
}

fn ensure_parent(path: &Path) -> PipelineResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| persist_error(path, err))?;
    }
    Ok(())
}

fn persist_error(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Persist {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Read-modify-write of the state at `path` under its lock.
pub fn edit<T, F>(path: &Path, change: F) -> PipelineResult<T>
where
    F: FnOnce(&mut QueueFile) -> PipelineResult<T>,
{
    let _lock = StateLock::acquire(path)?;
    let mut state = QueueFile::read(path)?;
    let value = change(&mut state)?;
    state.write(path)?;
    Ok(value)
}

/// Reads the state at `path` under its lock.
pub fn read(path: &Path) -> PipelineResult<QueueFile> {
    let _lock = StateLock::acquire(path)?;
    QueueFile::read(path)
}

/// Persisted records in enqueue order.
pub fn load(path: &Path) -> PipelineResult<Vec<JobRecord>> {
    Ok(read(path)?.jobs)
}

/// Replaces the state at `path`.
pub fn save(path: &Path, mut state: QueueFile) -> PipelineResult<()> {
    let _lock = StateLock::acquire(path)?;
    state.write(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(input: &str) -> JobRequest {
        JobRequest::new(input, format!("out/{input}"), PresetName::Fast)
    }

    #[test]
    fn cancelled_ids_are_not_handed_out_again() {
        let mut file = QueueFile::default();
        assert_eq!(file.add(request("a.mp4")).unwrap(), 1);
        assert_eq!(file.add(request("b.mp4")).unwrap(), 2);
        file.cancel(2).unwrap();
        assert_eq!(file.add(request("c.mp4")).unwrap(), 3);

        let temp = tempdir().unwrap();
        let state = temp.path().join("queue.yaml");
        file.cancel(3).unwrap();
        save(&state, file).unwrap();
        let id = edit(&state, |file| file.add(request("d.mp4"))).unwrap();
        assert_eq!(id, 4);
    }

    #[test]
    fn cancel_leaves_finished_records() {
        let mut file = QueueFile::default();
        let id = file.add(request("a.mp4")).unwrap();
        file.jobs[0].status = JobStatus::Failed;
        assert!(file.cancel(id).unwrap().is_none());
        assert_eq!(file.jobs.len(), 1);
        assert!(matches!(file.cancel(9), Err(PipelineError::UnknownJob(9))));
        assert_eq!(file.clear_finished(), 1);
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let temp = tempdir().unwrap();
        let state = temp.path().join("queue.yaml");
        let lock = StateLock::acquire(&state).unwrap();
        assert!(temp.path().join("queue.yaml.lock").exists());
        drop(lock);
        assert!(!temp.path().join("queue.yaml.lock").exists());
        let _again = StateLock::acquire(&state).unwrap();
    }

    #[test]
    fn older_state_versions_are_rejected() {
        let temp = tempdir().unwrap();
        let state = temp.path().join("queue.yaml");
        fs::write(&state, "version: 1\nsaved_at: 2026-01-01T00:00:00Z\njobs: []\n").unwrap();
        let err = QueueFile::read(&state).unwrap_err();
        assert!(err.to_string().contains("unsupported state version 1"));
    }
}
