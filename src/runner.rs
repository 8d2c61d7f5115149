use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::observability::MetricsCollector;
use crate::pipeline::PipelineSequencer;
use crate::queue::{Job, JobEventKind, JobId, JobQueue, JobStatus};

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Drains a [`JobQueue`] with up to `max_concurrent` worker threads.
///
/// With a state file attached, the queue is synced on every job transition
/// and on a fixed interval while jobs run, so edits made through the file
/// reach jobs already in flight.
pub struct BatchRunner {
    queue: Arc<JobQueue>,
    sequencer: PipelineSequencer,
    state_file: Option<PathBuf>,
    sync_interval: Duration,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub jobs: Vec<Job>,
    pub duration_ms: f64,
}

impl RunReport {
    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn completed(&self) -> usize {
        self.count(JobStatus::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(JobStatus::Cancelled)
    }
}

impl BatchRunner {
    pub fn new(queue: Arc<JobQueue>, sequencer: PipelineSequencer) -> Self {
        let metrics = sequencer.metrics();
        queue.subscribe(move |event| {
            if event.kind != JobEventKind::Finished {
                return;
            }
            match event.job.status {
                JobStatus::Done => metrics.record_job_completed(),
                JobStatus::Failed => metrics.record_job_failed(),
                JobStatus::Cancelled => metrics.record_job_cancelled(),
                _ => {}
            }
        });
        Self {
            queue,
            sequencer,
            state_file: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Mirrors the queue to `path` while the batch runs.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.sequencer.metrics()
    }

    pub fn run(&self) -> RunReport {
        let started = Instant::now();
        let workers = self.queue.max_concurrent();
        info!(workers, "Batch started");
        let earlier: BTreeSet<JobId> = self
            .queue
            .jobs()
            .iter()
            .filter(|j| j.status.is_terminal())
            .map(|j| j.id)
            .collect();
        self.persist();

        thread::scope(|scope| {
            let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
            if self.state_file.is_some() {
                let spawned = thread::Builder::new()
                    .name("vidlift-sync".into())
                    .spawn_scoped(scope, move || {
                        while let Err(RecvTimeoutError::Timeout) =
                            stopped.recv_timeout(self.sync_interval)
                        {
                            self.persist();
                        }
                        debug!("State sync stopped");
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "Failed to start state sync");
                }
            }

            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let spawned = thread::Builder::new()
                    .name(format!("vidlift-worker-{worker}"))
                    .spawn_scoped(scope, move || self.work());
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => error!(worker, error = %err, "Failed to start worker"),
                }
            }
            for handle in handles {
                if handle.join().is_err() {
                    error!("Worker panicked");
                }
            }
            drop(stop);
        });
        self.persist();

        let duration = started.elapsed();
        self.metrics().record_total_duration(duration);
        let report = RunReport {
            jobs: self
                .queue
                .jobs()
                .into_iter()
                .filter(|j| !earlier.contains(&j.id))
                .collect(),
            duration_ms: duration_ms(duration),
        };
        info!(
            completed = report.completed(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            duration_ms = report.duration_ms,
            "Batch finished"
        );
        report
    }

    fn work(&self) {
        while let Some(job) = self.queue.wait_next() {
            self.persist();
            let outcome = self.sequencer.run_job(&job, self.queue.as_ref());
            if let Err(err) = self.queue.finish(job.id, outcome) {
                error!(job = job.id, error = %err, "Failed to record job outcome");
            }
            self.persist();
        }
    }

    fn persist(&self) {
        if let Some(path) = &self.state_file
            && let Err(err) = self.queue.sync(path)
        {
            warn!(error = %err, "Failed to persist queue state");
        }
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}
