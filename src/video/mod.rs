//! Frame-level data model shared by the capabilities and the sequencer.
//!
//! Frames are packed RGB24 buffers. Pixel data sits behind an `Arc` so a
//! batch can be sliced for budget retries, or its first frame borrowed as the
//! interpolation look-ahead of the previous batch, without copying pixels.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PipelineError, PipelineResult};

pub const BYTES_PER_PIXEL: u64 = 3;

/// A decoded video frame.
#[derive(Clone)]
pub struct Frame {
    /// Position in the stream this frame belongs to (source order on decode,
    /// output order after interpolation).
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn new(index: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = Resolution::new(width, height).frame_bytes();
        if data.len() as u64 != expected {
            bail!(
                "frame {index} holds {} bytes, expected {expected} for {width}x{height} rgb24",
                data.len()
            );
        }
        Ok(Self {
            index,
            width,
            height,
            data: data.into(),
        })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Ordered run of frames owned by the sequencer while in flight.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    pub job_id: u64,
    pub sequence: u64,
    pub frames: Vec<Frame>,
}

impl FrameBatch {
    pub fn new(job_id: u64, sequence: u64, frames: Vec<Frame>) -> Self {
        Self {
            job_id,
            sequence,
            frames,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn byte_size(&self) -> u64 {
        self.frames.iter().map(Frame::byte_size).sum()
    }

    /// Checks that frame indices run contiguously from `expected_first`.
    pub fn verify_contiguous(&self, expected_first: u64) -> PipelineResult<()> {
        for (offset, frame) in self.frames.iter().enumerate() {
            let expected = expected_first + offset as u64;
            if frame.index != expected {
                return Err(PipelineError::corruption(format!(
                    "batch {} carries frame {} where frame {} was expected",
                    self.sequence, frame.index, expected
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD_1080: Resolution = Resolution::new(1920, 1080);
    pub const UHD_4K: Resolution = Resolution::new(3840, 2160);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn frame_bytes(&self) -> u64 {
        self.pixels() * BYTES_PER_PIXEL
    }

    /// Scales by `factor`, then shrinks to fit inside `bound` keeping the
    /// aspect ratio. Dimensions are always even for 4:2:0 encoders, so an
    /// odd source that cannot grow loses its last row or column.
    pub fn upscaled_within(&self, factor: u32, bound: Resolution) -> Resolution {
        if self.width == 0 || self.height == 0 {
            return *self;
        }
        let scaled_w = self.width as f64 * factor as f64;
        let scaled_h = self.height as f64 * factor as f64;
        let fit = (bound.width as f64 / scaled_w)
            .min(bound.height as f64 / scaled_h)
            .min(1.0);
        let width = even_floor((scaled_w * fit).floor() as u32);
        let height = even_floor((scaled_h * fit).floor() as u32);
        if width <= self.width || height <= self.height {
            self.even()
        } else {
            Resolution::new(width, height)
        }
    }

    /// Rounds both dimensions down to even, never below 2.
    pub fn even(&self) -> Resolution {
        Resolution::new(even_floor(self.width).max(2), even_floor(self.height).max(2))
    }
}

fn even_floor(value: u32) -> u32 {
    value & !1
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (w, h) = value
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| anyhow!("resolution '{value}' must look like WIDTHxHEIGHT"))?;
        Ok(Self::new(
            w.trim().parse().context("invalid resolution width")?,
            h.trim().parse().context("invalid resolution height")?,
        ))
    }
}

/// Exact rational frame rate, e.g. 30000/1001.
#[derive(Debug, Clone, Copy)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub const fn fps(value: u32) -> Self {
        Self::new(value, 1)
    }

    pub fn as_f64(&self) -> f64 {
        if self.denominator == 0 {
            0.0
        } else {
            self.numerator as f64 / self.denominator as f64
        }
    }

    fn cross(&self, other: &FrameRate) -> (u128, u128) {
        (
            self.numerator as u128 * other.denominator as u128,
            other.numerator as u128 * self.denominator as u128,
        )
    }

    pub fn is_faster_than(&self, other: &FrameRate) -> bool {
        let (lhs, rhs) = self.cross(other);
        lhs > rhs
    }
}

impl PartialEq for FrameRate {
    fn eq(&self, other: &Self) -> bool {
        let (lhs, rhs) = self.cross(other);
        lhs == rhs
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for FrameRate {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        let rate = if let Some((num, den)) = value.split_once('/') {
            FrameRate::new(
                num.trim().parse().context("invalid frame rate numerator")?,
                den.trim().parse().context("invalid frame rate denominator")?,
            )
        } else if let Ok(whole) = value.parse::<u32>() {
            FrameRate::fps(whole)
        } else {
            let fps: f64 = value
                .parse()
                .with_context(|| format!("invalid frame rate '{value}'"))?;
            FrameRate::new((fps * 1000.0).round() as u32, 1000)
        };
        if rate.numerator == 0 || rate.denominator == 0 {
            bail!("frame rate '{value}' must be positive");
        }
        Ok(rate)
    }
}

impl Serialize for FrameRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FrameRate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Maps a source frame count onto an output frame rate.
///
/// Output frame `k` samples source position `k * source / target`, and a
/// source prefix of `n` frames yields `ceil(n * target / source)` outputs.
/// Summing per-batch counts therefore reproduces the whole-stream count.
#[derive(Debug, Clone, Copy)]
pub struct RateConversion {
    source: FrameRate,
    output: FrameRate,
}

impl RateConversion {
    pub fn new(source: FrameRate, output: FrameRate) -> Self {
        Self { source, output }
    }

    pub fn is_identity(&self) -> bool {
        self.source == self.output
    }

    /// Number of output frames whose source position lies before `source_frames`.
    pub fn output_count(&self, source_frames: u64) -> u64 {
        let (num, den) = self.ratio();
        if den == 0 {
            return source_frames;
        }
        (source_frames as u128 * num).div_ceil(den) as u64
    }

    /// Source position sampled by output frame `output_index`.
    pub fn source_position(&self, output_index: u64) -> f64 {
        let (num, den) = self.ratio();
        if num == 0 {
            return output_index as f64;
        }
        (output_index as u128 * den) as f64 / num as f64
    }

    fn ratio(&self) -> (u128, u128) {
        // output / source
        self.output.cross(&self.source)
    }
}

/// Stream parameters reported by a decoder when it opens an input.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    /// Container-reported frame count; informational, may be absent or off.
    pub frame_count: Option<u64>,
    pub has_audio: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mkv,
    Mov,
    Webm,
    Avi,
    /// Directory of numbered PNG frames.
    Frames,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Mov => "mov",
            Self::Webm => "webm",
            Self::Avi => "avi",
            Self::Frames => "frames",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "mp4" | "m4v" => Some(Self::Mp4),
            "mkv" => Some(Self::Mkv),
            "mov" => Some(Self::Mov),
            "webm" => Some(Self::Webm),
            "avi" => Some(Self::Avi),
            "frames" => Some(Self::Frames),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm"];
pub const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff", "tif"];

pub fn is_video_path(path: &Path) -> bool {
    has_extension(path, VIDEO_EXTENSIONS)
}

pub fn is_frame_path(path: &Path) -> bool {
    has_extension(path, FRAME_EXTENSIONS)
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| allowed.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
