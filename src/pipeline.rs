//! Pipeline sequencer: drives one job from decode to encode.
//!
//! Decoding and encoding run on their own threads behind bounded channels,
//! so a slow encoder back-pressures inference and a stalled capability is
//! caught by a receive or send timeout. Per batch the sequencer runs
//! interpolation first, then super-resolution, and hands the frames to the
//! encoder in output order. Cancellation is checked between batches.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{CapabilitySet, Decoder, EncodeSpec, Encoder};
use crate::dispatcher::{Dispatcher, InferenceRequest};
use crate::error::{CapabilityKind, ErrorKind, PipelineError, PipelineResult};
use crate::observability::MetricsCollector;
use crate::queue::{JobId, JobStatus, RunningJob};
use crate::recipe::Limits;
use crate::video::{
    ContainerFormat, Frame, FrameBatch, FrameRate, RateConversion, Resolution, VideoInfo,
};

/// Decoded bytes per batch stay under `budget / BATCH_BUDGET_DIVISOR`.
pub const BATCH_BUDGET_DIVISOR: u64 = 8;
pub const MAX_BATCH_FRAMES: usize = 64;

/// Frames per decoded batch for a given frame size and budget.
pub fn batch_size(frame_bytes: u64, budget: u64) -> usize {
    let frames = (budget / BATCH_BUDGET_DIVISOR) / frame_bytes.max(1);
    (frames as usize).clamp(1, MAX_BATCH_FRAMES)
}

/// Where in a job's life a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Promotion by the queue, before any capability ran.
    Schedule,
    Extract,
    Interpolate,
    SuperResolve,
    Encode,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Extract => "extract",
            Self::Interpolate => "interpolate",
            Self::SuperResolve => "super-resolve",
            Self::Encode => "encode",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    /// Output left behind by the encoder, if it got far enough to write one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<PathBuf>,
}

impl JobFailure {
    pub fn new(stage: Stage, err: &PipelineError, partial_output: Option<PathBuf>) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
            partial_output,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {}: {}", self.kind, self.stage, self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub output: PathBuf,
    pub frames_decoded: u64,
    pub frames_encoded: u64,
    pub source_resolution: Resolution,
    pub output_resolution: Resolution,
    pub source_frame_rate: FrameRate,
    pub output_frame_rate: FrameRate,
    pub batches: u64,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done(JobSummary),
    Failed(JobFailure),
    Cancelled,
}

/// Receives a running job's status and progress updates.
pub trait JobReporter: Send + Sync {
    fn status(&self, job: JobId, status: JobStatus);
    fn progress(&self, job: JobId, fraction: f64);
}

pub struct NullReporter;

impl JobReporter for NullReporter {
    fn status(&self, _job: JobId, _status: JobStatus) {}
    fn progress(&self, _job: JobId, _fraction: f64) {}
}

#[derive(Debug, Clone, Copy)]
pub struct SequencerSettings {
    pub decode_timeout: Duration,
    pub encode_timeout: Duration,
}

impl From<&Limits> for SequencerSettings {
    fn from(limits: &Limits) -> Self {
        Self {
            decode_timeout: limits.decode_timeout(),
            encode_timeout: limits.encode_timeout(),
        }
    }
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self::from(&Limits::default())
    }
}

enum Interrupt {
    Cancelled,
    Failed(Stage, PipelineError),
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, Interrupt>;
}

impl<T> AtStage<T> for PipelineResult<T> {
    fn at(self, stage: Stage) -> Result<T, Interrupt> {
        self.map_err(|err| Interrupt::Failed(stage, err))
    }
}

#[derive(Clone)]
pub struct PipelineSequencer {
    decoder: Arc<dyn Decoder>,
    encoder: Arc<dyn Encoder>,
    dispatcher: Dispatcher,
    settings: SequencerSettings,
    metrics: MetricsCollector,
}

impl PipelineSequencer {
    pub fn new(capabilities: &CapabilitySet, limits: &Limits) -> Self {
        Self {
            decoder: capabilities.decoder.clone(),
            encoder: capabilities.encoder.clone(),
            dispatcher: Dispatcher::new(capabilities, limits.inference_timeout()),
            settings: SequencerSettings::from(limits),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher.with_metrics(self.metrics.clone());
        self
    }

    pub fn with_settings(mut self, settings: SequencerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.dispatcher = self.dispatcher.with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Runs `job` to a terminal outcome. Never panics on capability
    /// failures; they come back as [`JobOutcome::Failed`].
    #[instrument(skip_all, fields(job = job.id, input = %job.input.display(), preset = %job.preset.name))]
    pub fn run_job(&self, job: &RunningJob, reporter: &dyn JobReporter) -> JobOutcome {
        let started = Instant::now();
        let mut encoder = None;
        let result = self.execute(job, reporter, &mut encoder, started);

        match result {
            Ok(summary) => {
                info!(
                    frames_decoded = summary.frames_decoded,
                    frames_encoded = summary.frames_encoded,
                    output = %summary.output.display(),
                    elapsed_ms = summary.elapsed_ms,
                    "Job complete"
                );
                JobOutcome::Done(summary)
            }
            Err(interrupt) => {
                if let Some(handle) = encoder.take()
                    && let Err(err) = handle.finish()
                {
                    debug!(error = %err, "Encoder did not close cleanly after interruption");
                }
                match interrupt {
                    Interrupt::Cancelled => {
                        info!("Job cancelled at batch boundary");
                        JobOutcome::Cancelled
                    }
                    Interrupt::Failed(stage, err) => {
                        let partial = partial_output(&job.output);
                        warn!(%stage, kind = %err.kind(), error = %err, "Job failed");
                        JobOutcome::Failed(JobFailure::new(stage, &err, partial))
                    }
                }
            }
        }
    }

    fn execute(
        &self,
        job: &RunningJob,
        reporter: &dyn JobReporter,
        encoder: &mut Option<EncoderHandle>,
        started: Instant,
    ) -> Result<JobSummary, Interrupt> {
        let budget = job.preset.vram_budget;
        reporter.status(job.id, JobStatus::Extracting);

        let decode = DecoderHandle::spawn(
            self.decoder.clone(),
            job,
            budget,
            self.settings.decode_timeout,
        )
        .at(Stage::Extract)?;
        let info = {
            let _timer = self.metrics.start_stage("decode");
            decode.opened().at(Stage::Extract)?
        };

        let output_resolution = job.preset.output_resolution(info.resolution);
        let output_rate = if job.interpolate {
            job.preset.output_frame_rate(info.frame_rate)
        } else {
            info.frame_rate
        };
        let conversion = RateConversion::new(info.frame_rate, output_rate);
        let interpolate = !conversion.is_identity();
        let upscale = output_resolution != info.resolution;
        info!(
            source = %info.resolution,
            target = %output_resolution,
            source_rate = %info.frame_rate,
            target_rate = %output_rate,
            interpolate,
            upscale,
            "Job plan resolved"
        );

        if job.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        let spec = EncodeSpec {
            output: job.output.clone(),
            container: ContainerFormat::from_path(&job.output).unwrap_or_default(),
            resolution: output_resolution,
            frame_rate: output_rate,
            tuning: job.preset.encoder.clone(),
            audio_source: info.has_audio.then(|| job.input.clone()),
        };
        let handle = encoder.insert(
            EncoderHandle::spawn(self.encoder.clone(), spec, job.id, self.settings.encode_timeout)
                .at(Stage::Encode)?,
        );

        let mut decoded = 0u64;
        let mut encoded = 0u64;
        let mut sequence = 0u64;
        let mut current = self.receive(&decode)?;

        while let Some(frames) = current {
            reporter.status(job.id, JobStatus::Extracting);
            let next = self.receive(&decode)?;

            if job.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            let batch = FrameBatch::new(job.id, sequence, frames);
            batch.verify_contiguous(decoded).at(Stage::Extract)?;
            let source_len = batch.len() as u64;
            let lookahead = next.as_ref().and_then(|b| b.first().cloned());

            let mut batch = batch;
            if interpolate {
                reporter.status(job.id, JobStatus::Interpolating);
                let _timer = self.metrics.start_stage("interpolate");
                let first_output = conversion.output_count(decoded);
                let last_output = conversion.output_count(decoded + source_len);
                let positions = (first_output..last_output)
                    .map(|k| conversion.source_position(k) - decoded as f64)
                    .collect();
                let request =
                    InferenceRequest::interpolate(batch, lookahead, positions, first_output, budget);
                batch = self.dispatcher.run_adaptive(request).at(Stage::Interpolate)?;
            }
            if upscale {
                reporter.status(job.id, JobStatus::Upscaling);
                let _timer = self.metrics.start_stage("super_resolve");
                let request = InferenceRequest::super_resolve(batch, output_resolution, budget);
                batch = self.dispatcher.run_adaptive(request).at(Stage::SuperResolve)?;
            }

            batch.verify_contiguous(encoded).at(Stage::Encode)?;
            reporter.status(job.id, JobStatus::Encoding);
            {
                let _timer = self.metrics.start_stage("encode");
                let count = batch.len() as u64;
                for frame in batch.frames {
                    handle.send(frame).at(Stage::Encode)?;
                }
                encoded += count;
                self.metrics.add_frames_encoded(count);
            }

            decoded += source_len;
            sequence += 1;
            self.metrics.add_frames_decoded(source_len);
            if let Some(total) = info.frame_count.filter(|t| *t > 0) {
                reporter.progress(job.id, (decoded as f64 / total as f64).min(0.99));
            }
            debug!(batch = sequence, decoded, encoded, "Batch complete");
            current = next;
        }

        if decoded == 0 {
            return Err(Interrupt::Failed(
                Stage::Extract,
                PipelineError::capability(CapabilityKind::Decode, "input produced no frames"),
            ));
        }
        if let Some(reported) = info.frame_count
            && reported != decoded
        {
            debug!(reported, decoded, "Container frame count differs from decoded frames");
        }

        let expected = conversion.output_count(decoded);
        if encoded != expected {
            return Err(Interrupt::Failed(
                Stage::Encode,
                PipelineError::corruption(format!(
                    "{encoded} frame(s) reached the encoder, expected {expected} for {decoded} source frame(s)"
                )),
            ));
        }

        let written = {
            let _timer = self.metrics.start_stage("finalize");
            let handle = encoder.take().ok_or_else(|| {
                Interrupt::Failed(
                    Stage::Encode,
                    PipelineError::capability(CapabilityKind::Encode, "encoder already closed"),
                )
            })?;
            handle.finish().at(Stage::Encode)?
        };
        if written != encoded {
            return Err(Interrupt::Failed(
                Stage::Encode,
                PipelineError::corruption(format!(
                    "encoder wrote {written} of {encoded} frame(s)"
                )),
            ));
        }
        reporter.progress(job.id, 1.0);

        Ok(JobSummary {
            output: job.output.clone(),
            frames_decoded: decoded,
            frames_encoded: encoded,
            source_resolution: info.resolution,
            output_resolution,
            source_frame_rate: info.frame_rate,
            output_frame_rate: output_rate,
            batches: sequence,
            elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
        })
    }

    fn receive(&self, decode: &DecoderHandle) -> Result<Option<Vec<Frame>>, Interrupt> {
        let _timer = self.metrics.start_stage("decode");
        decode.next_batch().at(Stage::Extract)
    }
}

fn partial_output(output: &Path) -> Option<PathBuf> {
    output.exists().then(|| output.to_path_buf())
}

enum Decoded {
    Opened(VideoInfo),
    Batch(Vec<Frame>),
    Failed(anyhow::Error),
}

/// Decoder thread feeding fixed-size batches through a bounded channel.
struct DecoderHandle {
    batches: Receiver<Decoded>,
    timeout: Duration,
}

impl DecoderHandle {
    fn spawn(
        decoder: Arc<dyn Decoder>,
        job: &RunningJob,
        budget: u64,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let input = job.input.clone();
        thread::Builder::new()
            .name(format!("vidlift-decode-{}", job.id))
            .spawn(move || produce_batches(decoder, &input, budget, &tx))
            .map_err(|err| PipelineError::capability(CapabilityKind::Decode, err))?;
        Ok(Self {
            batches: rx,
            timeout,
        })
    }

    fn recv(&self) -> PipelineResult<Option<Decoded>> {
        match self.batches.recv_timeout(self.timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::timeout(
                CapabilityKind::Decode,
                self.timeout.as_secs_f64(),
            )),
        }
    }

    fn opened(&self) -> PipelineResult<VideoInfo> {
        match self.recv()? {
            Some(Decoded::Opened(info)) => Ok(info),
            Some(Decoded::Failed(err)) => Err(PipelineError::from_anyhow(CapabilityKind::Decode, err)),
            Some(Decoded::Batch(_)) | None => Err(PipelineError::capability(
                CapabilityKind::Decode,
                "decoder produced frames before stream info",
            )),
        }
    }

    fn next_batch(&self) -> PipelineResult<Option<Vec<Frame>>> {
        match self.recv()? {
            Some(Decoded::Batch(frames)) => Ok(Some(frames)),
            Some(Decoded::Failed(err)) => Err(PipelineError::from_anyhow(CapabilityKind::Decode, err)),
            Some(Decoded::Opened(_)) => Err(PipelineError::capability(
                CapabilityKind::Decode,
                "decoder reopened mid-stream",
            )),
            None => Ok(None),
        }
    }
}

fn produce_batches(decoder: Arc<dyn Decoder>, input: &Path, budget: u64, tx: &Sender<Decoded>) {
    let mut source = match decoder.open(input) {
        Ok(source) => source,
        Err(err) => {
            let _ = tx.send(Decoded::Failed(err));
            return;
        }
    };
    let info = source.info().clone();
    let size = batch_size(info.resolution.frame_bytes(), budget);
    debug!(input = %input.display(), batch_frames = size, "Decoder opened");
    if tx.send(Decoded::Opened(info)).is_err() {
        return;
    }

    loop {
        let mut frames = Vec::with_capacity(size);
        while frames.len() < size {
            match source.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Decoded::Failed(err));
                    return;
                }
            }
        }
        let exhausted = frames.len() < size;
        // A failed send means the sequencer stopped listening.
        if !frames.is_empty() && tx.send(Decoded::Batch(frames)).is_err() {
            return;
        }
        if exhausted {
            return;
        }
    }
}

/// Encoder thread draining frames from a bounded channel into a sink.
struct EncoderHandle {
    frames: Option<Sender<Frame>>,
    result: Receiver<anyhow::Result<u64>>,
    timeout: Duration,
}

impl EncoderHandle {
    fn spawn(
        encoder: Arc<dyn Encoder>,
        spec: EncodeSpec,
        job: JobId,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Frame>(4);
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        thread::Builder::new()
            .name(format!("vidlift-encode-{job}"))
            .spawn(move || {
                let outcome = (|| -> anyhow::Result<u64> {
                    let mut sink = encoder.create(&spec)?;
                    let mut written = 0u64;
                    for frame in frame_rx.iter() {
                        sink.write(&frame)?;
                        written += 1;
                    }
                    sink.finish()?;
                    Ok(written)
                })();
                let _ = result_tx.send(outcome);
            })
            .map_err(|err| PipelineError::capability(CapabilityKind::Encode, err))?;
        Ok(Self {
            frames: Some(frame_tx),
            result: result_rx,
            timeout,
        })
    }

    fn send(&mut self, frame: Frame) -> PipelineResult<()> {
        let Some(frames) = self.frames.as_ref() else {
            return Err(PipelineError::capability(
                CapabilityKind::Encode,
                "encoder already closed",
            ));
        };
        match frames.send_timeout(frame, self.timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(PipelineError::timeout(
                CapabilityKind::Encode,
                self.timeout.as_secs_f64(),
            )),
            Err(SendTimeoutError::Disconnected(_)) => {
                self.frames = None;
                Err(self.collect().err().unwrap_or_else(|| {
                    PipelineError::capability(
                        CapabilityKind::Encode,
                        "encoder stopped accepting frames",
                    )
                }))
            }
        }
    }

    /// Closes the frame channel and waits for the sink to finish.
    fn finish(mut self) -> PipelineResult<u64> {
        self.frames = None;
        self.collect()
    }

    fn collect(&self) -> PipelineResult<u64> {
        match self.result.recv_timeout(self.timeout) {
            Ok(Ok(written)) => Ok(written),
            Ok(Err(err)) => Err(PipelineError::from_anyhow(CapabilityKind::Encode, err)),
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::timeout(
                CapabilityKind::Encode,
                self.timeout.as_secs_f64(),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::capability(
                CapabilityKind::Encode,
                "encoder thread exited without a result",
            )),
        }
    }
}
