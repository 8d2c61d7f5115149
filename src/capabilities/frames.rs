use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Decoder, EncodeSpec, Encoder, FrameSink, FrameSource};
use crate::video::{Frame, FrameRate, Resolution, VideoInfo, is_frame_path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSettings {
    /// Rate assumed for frame directories, which carry no timing of their own.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: FrameRate,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
        }
    }
}

fn default_frame_rate() -> FrameRate {
    FrameRate::fps(30)
}

/// Decodes a directory of still images, ordered by file name.
pub struct FrameSequenceDecoder {
    settings: FrameSettings,
}

impl FrameSequenceDecoder {
    pub fn new(settings: FrameSettings) -> Self {
        Self { settings }
    }
}

pub fn list_frame_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read frame directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_frame_path(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl Decoder for FrameSequenceDecoder {
    fn name(&self) -> &'static str {
        "frames"
    }

    fn open(&self, input: &Path) -> Result<Box<dyn FrameSource>> {
        let files = list_frame_files(input)?;
        let first = files
            .first()
            .ok_or_else(|| anyhow!("no frames found in {}", input.display()))?;
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("Failed to read {}", first.display()))?;

        Ok(Box::new(FrameSequenceSource {
            info: VideoInfo {
                resolution: Resolution::new(width, height),
                frame_rate: self.settings.frame_rate,
                frame_count: Some(files.len() as u64),
                has_audio: false,
            },
            files,
            next_index: 0,
        }))
    }
}

struct FrameSequenceSource {
    info: VideoInfo,
    files: Vec<PathBuf>,
    next_index: u64,
}

impl FrameSource for FrameSequenceSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.next_index as usize) else {
            return Ok(None);
        };
        let image = image::open(path)
            .with_context(|| format!("Failed to decode frame {}", path.display()))?
            .to_rgb8();
        if image.dimensions() != (self.info.resolution.width, self.info.resolution.height) {
            bail!(
                "frame {} is {}x{}, sequence is {}",
                path.display(),
                image.width(),
                image.height(),
                self.info.resolution
            );
        }
        let frame = Frame::new(
            self.next_index,
            image.width(),
            image.height(),
            image.into_raw(),
        )?;
        self.next_index += 1;
        Ok(Some(frame))
    }
}

/// Writes `frame_NNNNNNNN.png` files into the output directory. Frames left
/// by an earlier run are removed first; other files are kept.
pub struct FrameSequenceEncoder;

fn is_encoded_frame(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("frame_") && name.ends_with(".png"))
}

fn remove_stale_frames(directory: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries = fs::read_dir(directory)
        .with_context(|| format!("Failed to read frame directory: {}", directory.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_encoded_frame(&path) {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale frame {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

impl Encoder for FrameSequenceEncoder {
    fn name(&self) -> &'static str {
        "frames"
    }

    fn create(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameSink>> {
        fs::create_dir_all(&spec.output).with_context(|| {
            format!("Failed to create frame directory: {}", spec.output.display())
        })?;
        let removed = remove_stale_frames(&spec.output)?;
        if removed > 0 {
            debug!(output = %spec.output.display(), removed, "Removed frames from an earlier run");
        }
        Ok(Box::new(FrameSequenceSink {
            directory: spec.output.clone(),
        }))
    }
}

struct FrameSequenceSink {
    directory: PathBuf,
}

impl FrameSink for FrameSequenceSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec())
            .ok_or_else(|| anyhow!("frame {} buffer does not match its size", frame.index))?;
        let path = self.directory.join(format!("frame_{:08}.png", frame.index));
        image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
