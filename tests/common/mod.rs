#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use vidlift::capabilities::{
    CapabilitySet, Decoder, EncodeSpec, Encoder, FrameSink, FrameSource, Interpolator,
    SuperResolver,
};
use vidlift::presets::{PresetName, preset_for};
use vidlift::queue::{CancelToken, RunningJob};
use vidlift::video::{Frame, FrameRate, Resolution, VideoInfo};

pub const SMALL: Resolution = Resolution::new(4, 4);

/// Frame whose first eight bytes carry `tag`, so it can be traced through
/// inference.
pub fn tagged_frame(index: u64, resolution: Resolution, tag: u64) -> Frame {
    let mut data = vec![0u8; resolution.frame_bytes() as usize];
    data[..8].copy_from_slice(&tag.to_le_bytes());
    Frame::new(index, resolution.width, resolution.height, data).unwrap()
}

pub fn tag(frame: &Frame) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame.data[..8]);
    u64::from_le_bytes(bytes)
}

pub fn frames(count: u64) -> Vec<Frame> {
    (0..count).map(|i| tagged_frame(i, SMALL, i)).collect()
}

pub fn running_job(id: u64, preset: PresetName, output: impl Into<PathBuf>) -> RunningJob {
    RunningJob {
        id,
        input: PathBuf::from(format!("input-{id}.mp4")),
        output: output.into(),
        preset: preset_for(preset),
        interpolate: true,
        cancel: CancelToken::default(),
    }
}

/// How long one input was open for decoding.
#[derive(Debug, Clone)]
pub struct DecodeSpan {
    pub input: PathBuf,
    pub opened: Instant,
    pub closed: Instant,
}

impl DecodeSpan {
    pub fn overlaps(&self, other: &DecodeSpan) -> bool {
        self.opened < other.closed && other.opened < self.closed
    }
}

/// Emits `count` tagged frames. Can fail or stall at a given frame and
/// cancel a token once a frame has been produced.
#[derive(Clone)]
pub struct MockDecoder {
    pub count: u64,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub fail_at: Option<u64>,
    pub stall_at: Option<(u64, Duration)>,
    pub cancel_at: Option<(u64, CancelToken)>,
    pub frame_delay: Option<Duration>,
    pub spans: Arc<Mutex<Vec<DecodeSpan>>>,
}

impl MockDecoder {
    pub fn new(count: u64, frame_rate: FrameRate) -> Self {
        Self {
            count,
            resolution: SMALL,
            frame_rate,
            fail_at: None,
            stall_at: None,
            cancel_at: None,
            frame_delay: None,
            spans: Arc::default(),
        }
    }

    pub fn span(&self, input: &str) -> DecodeSpan {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.input.ends_with(input))
            .cloned()
            .unwrap_or_else(|| panic!("{input} was never decoded"))
    }
}

impl Decoder for MockDecoder {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(&self, input: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(MockSource {
            config: self.clone(),
            input: input.to_path_buf(),
            opened: Instant::now(),
            info: VideoInfo {
                resolution: self.resolution,
                frame_rate: self.frame_rate,
                frame_count: Some(self.count),
                has_audio: false,
            },
            next: 0,
        }))
    }
}

struct MockSource {
    config: MockDecoder,
    input: PathBuf,
    opened: Instant,
    info: VideoInfo,
    next: u64,
}

impl Drop for MockSource {
    fn drop(&mut self) {
        self.config.spans.lock().unwrap().push(DecodeSpan {
            input: self.input.clone(),
            opened: self.opened,
            closed: Instant::now(),
        });
    }
}

impl FrameSource for MockSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.next >= self.config.count {
            return Ok(None);
        }
        if self.config.fail_at == Some(self.next) {
            bail!("corrupt packet at frame {}", self.next);
        }
        if let Some((at, delay)) = self.config.stall_at
            && at == self.next
        {
            thread::sleep(delay);
        }
        if let Some((at, token)) = &self.config.cancel_at
            && *at == self.next
        {
            token.cancel();
        }
        if let Some(delay) = self.config.frame_delay {
            thread::sleep(delay);
        }
        let frame = tagged_frame(self.next, self.info.resolution, self.next);
        self.next += 1;
        Ok(Some(frame))
    }
}

/// Resizes by reallocating at the target size and copying the tag.
#[derive(Default)]
pub struct TagUpscaler {
    pub batch_sizes: Mutex<Vec<usize>>,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub delay: Option<Duration>,
}

impl SuperResolver for TagUpscaler {
    fn name(&self) -> &'static str {
        "tag-upscaler"
    }

    fn super_resolve(&self, frames: &[Frame], target: Resolution) -> Result<Vec<Frame>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(frames.len());
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let out = frames
            .iter()
            .map(|f| tagged_frame(f.index, target, tag(f)))
            .collect();
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(out)
    }
}

/// Fails every call, or only the first one when `once` is set.
#[derive(Default)]
pub struct FailingUpscaler {
    pub once: bool,
    pub calls: AtomicUsize,
    tripped: AtomicBool,
}

impl FailingUpscaler {
    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }
}

impl SuperResolver for FailingUpscaler {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn super_resolve(&self, frames: &[Frame], target: Resolution) -> Result<Vec<Frame>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.once || !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("CUDA error: out of memory"));
        }
        Ok(frames
            .iter()
            .map(|f| tagged_frame(f.index, target, tag(f)))
            .collect())
    }
}

/// Returns the wrong number of frames.
pub struct DroppingUpscaler;

impl SuperResolver for DroppingUpscaler {
    fn name(&self) -> &'static str {
        "dropping"
    }

    fn super_resolve(&self, frames: &[Frame], target: Resolution) -> Result<Vec<Frame>> {
        Ok(frames
            .iter()
            .skip(1)
            .map(|f| tagged_frame(f.index, target, tag(f)))
            .collect())
    }
}

/// Picks the nearest earlier source frame for each position, keeping its tag.
#[derive(Default)]
pub struct NearestInterpolator {
    pub positions: Mutex<Vec<Vec<f64>>>,
    pub short_by: usize,
}

impl Interpolator for NearestInterpolator {
    fn name(&self) -> &'static str {
        "nearest"
    }

    fn interpolate(&self, frames: &[Frame], positions: &[f64]) -> Result<Vec<Frame>> {
        self.positions.lock().unwrap().push(positions.to_vec());
        let last = frames.len() - 1;
        let keep = positions.len().saturating_sub(self.short_by);
        Ok(positions[..keep]
            .iter()
            .enumerate()
            .map(|(slot, p)| frames[(p.floor() as usize).min(last)].clone().with_index(slot as u64))
            .collect())
    }
}

/// Collects encoded frames in memory.
#[derive(Clone, Default)]
pub struct RecordingEncoder {
    pub frames: Arc<Mutex<Vec<Frame>>>,
    pub finished: Arc<AtomicBool>,
    pub specs: Arc<Mutex<Vec<EncodeSpec>>>,
    pub fail_after: Option<usize>,
}

impl RecordingEncoder {
    pub fn indices(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|f| f.index).collect()
    }

    pub fn tags(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(tag).collect()
    }
}

impl Encoder for RecordingEncoder {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn create(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameSink>> {
        self.specs.lock().unwrap().push(spec.clone());
        Ok(Box::new(RecordingSink {
            encoder: self.clone(),
        }))
    }
}

struct RecordingSink {
    encoder: RecordingEncoder,
}

impl FrameSink for RecordingSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let mut frames = self.encoder.frames.lock().unwrap();
        if let Some(limit) = self.encoder.fail_after
            && frames.len() >= limit
        {
            bail!("disk full");
        }
        frames.push(frame.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.encoder.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn capability_set(
    decoder: MockDecoder,
    super_resolver: Arc<dyn SuperResolver>,
    interpolator: Arc<dyn Interpolator>,
    encoder: RecordingEncoder,
) -> CapabilitySet {
    CapabilitySet {
        decoder: Arc::new(decoder),
        super_resolver,
        interpolator,
        encoder: Arc::new(encoder),
    }
}
