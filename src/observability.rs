use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub frames_decoded: u64,
    pub frames_encoded: u64,
    pub budget_splits: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Process-wide counters shared by the sequencer, dispatcher and runner.
/// Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|m| m.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_job_completed(&self) {
        self.update(|m| m.jobs_completed += 1);
    }

    pub fn record_job_failed(&self) {
        self.update(|m| m.jobs_failed += 1);
    }

    pub fn record_job_cancelled(&self) {
        self.update(|m| m.jobs_cancelled += 1);
    }

    pub fn add_frames_decoded(&self, count: u64) {
        self.update(|m| m.frames_decoded += count);
    }

    pub fn add_frames_encoded(&self, count: u64) {
        self.update(|m| m.frames_encoded += count);
    }

    pub fn record_budget_split(&self) {
        self.update(|m| m.budget_splits += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        jobs_completed = snapshot.jobs_completed,
        jobs_failed = snapshot.jobs_failed,
        jobs_cancelled = snapshot.jobs_cancelled,
        frames_encoded = snapshot.frames_encoded,
        budget_splits = snapshot.budget_splits,
        "Batch metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP vidlift_{name} {help}");
    let _ = writeln!(output, "# TYPE vidlift_{name} counter");
    let _ = writeln!(output, "vidlift_{name} {value}");
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        counter(&mut output, "jobs_completed_total", "Jobs that finished successfully", self.jobs_completed);
        counter(&mut output, "jobs_failed_total", "Jobs that ended in failure", self.jobs_failed);
        counter(&mut output, "jobs_cancelled_total", "Jobs cancelled while running", self.jobs_cancelled);
        counter(&mut output, "frames_decoded_total", "Source frames decoded", self.frames_decoded);
        counter(&mut output, "frames_encoded_total", "Output frames handed to encoders", self.frames_encoded);
        counter(&mut output, "budget_splits_total", "Inference batches halved to fit the VRAM budget", self.budget_splits);

        output.push_str("# HELP vidlift_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE vidlift_stage_calls_total counter\n");
        output.push_str(
            "# HELP vidlift_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE vidlift_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP vidlift_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE vidlift_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "vidlift_stage_calls_total{{stage=\"{stage}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "vidlift_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "vidlift_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP vidlift_batch_duration_seconds Wall time of the whole batch\n");
        output.push_str("# TYPE vidlift_batch_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "vidlift_batch_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}
