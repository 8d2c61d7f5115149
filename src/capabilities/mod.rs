//! Capability seams: decode, super-resolution, interpolation and encode.
//!
//! The core only talks to these traits. Concrete implementations live in
//! the submodules: FFmpeg for containers, numbered PNG directories for
//! frame sequences, and CPU reference filters for the two inference passes.
//! Model-backed inference plugs in by implementing [`SuperResolver`] or
//! [`Interpolator`].

pub mod ffmpeg;
pub mod frames;
pub mod reference;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::RecvTimeoutError;

use crate::error::{CapabilityKind, PipelineError, PipelineResult};
use crate::presets::EncoderTuning;
use crate::video::{ContainerFormat, Frame, FrameRate, Resolution, VideoInfo};

pub use ffmpeg::{FfmpegDecoder, FfmpegEncoder, FfmpegSettings};
pub use frames::{FrameSequenceDecoder, FrameSequenceEncoder, FrameSettings};
pub use reference::{BlendInterpolator, LanczosUpscaler};

/// Lazy, finite frame stream. Restarting requires opening the input again.
pub trait FrameSource: Send {
    fn info(&self) -> &VideoInfo;
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

pub trait Decoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn open(&self, input: &Path) -> Result<Box<dyn FrameSource>>;
}

pub trait SuperResolver: Send + Sync {
    fn name(&self) -> &'static str;
    /// Returns one frame per input, in input order, at `target` resolution.
    fn super_resolve(&self, frames: &[Frame], target: Resolution) -> Result<Vec<Frame>>;
}

pub trait Interpolator: Send + Sync {
    fn name(&self) -> &'static str;
    /// Synthesises one frame per entry of `positions`. A position `p` lies
    /// between `frames[floor(p)]` and `frames[floor(p) + 1]`; positions past
    /// the last frame hold it.
    fn interpolate(&self, frames: &[Frame], positions: &[f64]) -> Result<Vec<Frame>>;
}

#[derive(Debug, Clone)]
pub struct EncodeSpec {
    pub output: PathBuf,
    pub container: ContainerFormat,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub tuning: EncoderTuning,
    /// Source to copy audio from, when it carries any.
    pub audio_source: Option<PathBuf>,
}

pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameSink>>;
}

#[derive(Clone)]
pub struct CapabilitySet {
    pub decoder: Arc<dyn Decoder>,
    pub super_resolver: Arc<dyn SuperResolver>,
    pub interpolator: Arc<dyn Interpolator>,
    pub encoder: Arc<dyn Encoder>,
}

impl CapabilitySet {
    /// FFmpeg for containers, PNG directories for frame sequences, CPU
    /// reference filters for inference.
    pub fn builtin(ffmpeg: &FfmpegSettings, frames: &FrameSettings) -> Self {
        Self {
            decoder: Arc::new(AutoDecoder {
                ffmpeg: FfmpegDecoder::new(ffmpeg.clone()),
                frames: FrameSequenceDecoder::new(frames.clone()),
            }),
            super_resolver: Arc::new(LanczosUpscaler::default()),
            interpolator: Arc::new(BlendInterpolator),
            encoder: Arc::new(AutoEncoder {
                ffmpeg: FfmpegEncoder::new(ffmpeg.clone()),
                frames: FrameSequenceEncoder,
            }),
        }
    }
}

/// Routes directories to the frame-sequence decoder and files to FFmpeg.
struct AutoDecoder {
    ffmpeg: FfmpegDecoder,
    frames: FrameSequenceDecoder,
}

impl Decoder for AutoDecoder {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn open(&self, input: &Path) -> Result<Box<dyn FrameSource>> {
        if input.is_dir() {
            self.frames.open(input)
        } else {
            self.ffmpeg.open(input)
        }
    }
}

struct AutoEncoder {
    ffmpeg: FfmpegEncoder,
    frames: FrameSequenceEncoder,
}

impl Encoder for AutoEncoder {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn create(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameSink>> {
        match spec.container {
            ContainerFormat::Frames => self.frames.create(spec),
            _ => self.ffmpeg.create(spec),
        }
    }
}

/// Runs `call` on a helper thread and gives up after `timeout`.
///
/// A call that overruns is abandoned, not killed: its thread keeps running
/// until the capability returns, and the result is discarded.
pub fn call_with_timeout<T, F>(
    capability: CapabilityKind,
    timeout: Duration,
    call: F,
) -> PipelineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name(format!("vidlift-{capability}"))
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|err| PipelineError::capability(capability, err))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(PipelineError::from_anyhow(capability, err)),
        Err(RecvTimeoutError::Timeout) => {
            Err(PipelineError::timeout(capability, timeout.as_secs_f64()))
        }
        Err(RecvTimeoutError::Disconnected) => Err(PipelineError::capability(
            capability,
            "capability thread exited without a result",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use anyhow::anyhow;

    #[test]
    fn timeout_is_a_capability_error() {
        let err = call_with_timeout(
            CapabilityKind::SuperResolution,
            Duration::from_millis(20),
            || {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn failure_keeps_context() {
        let err = call_with_timeout::<(), _>(CapabilityKind::Encode, Duration::from_secs(5), || {
            Err(anyhow!("disk full")).map_err(|e| e.context("writing frame 3"))
        })
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("writing frame 3"));
        assert!(message.contains("disk full"));
    }
}
