use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::recipe::{InputSpec, OutputSpec, Recipe};
use crate::video::{FrameRate, Resolution};

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PresetName {
    Fast,
    Standard,
    #[value(aliases = ["high", "hd"])]
    #[serde(alias = "high", alias = "hd")]
    HighDefinition,
}

impl PresetName {
    pub const ALL: [PresetName; 3] = [Self::Fast, Self::Standard, Self::HighDefinition];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::HighDefinition => "high-definition",
        }
    }
}

impl fmt::Display for PresetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresetName {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "standard" => Ok(Self::Standard),
            "high-definition" | "high_definition" | "high" | "hd" => Ok(Self::HighDefinition),
            _ => Err(PipelineError::UnknownPreset {
                name: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeedClass {
    Fast,
    Balanced,
    Slow,
}

impl SpeedClass {
    /// Processing speed relative to realtime on a GPU.
    pub fn realtime_multiplier(&self) -> f64 {
        match self {
            Self::Fast => 2.0,
            Self::Balanced => 0.5,
            Self::Slow => 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncoderTuning {
    pub speed: &'static str,
    pub crf: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub name: PresetName,
    pub description: &'static str,
    /// Upper bound for the super-resolved output.
    pub target_resolution: Resolution,
    pub scale_factor: u32,
    /// `None` keeps the source frame rate.
    pub target_frame_rate: Option<FrameRate>,
    pub vram_budget: u64,
    pub speed_class: SpeedClass,
    /// Model tile edge in pixels; 0 disables tiling.
    pub tile_size: u32,
    pub encoder: EncoderTuning,
}

impl Preset {
    pub fn all() -> Vec<Preset> {
        PresetName::ALL.iter().map(|name| preset_for(*name)).collect()
    }

    pub fn output_resolution(&self, source: Resolution) -> Resolution {
        source.upscaled_within(self.scale_factor, self.target_resolution)
    }

    /// Rate the encoder receives: the target when it is faster than the
    /// source, otherwise the source rate unchanged.
    pub fn output_frame_rate(&self, source: FrameRate) -> FrameRate {
        match self.target_frame_rate {
            Some(target) if target.is_faster_than(&source) => target,
            _ => source,
        }
    }

    pub fn vram_budget_gb(&self) -> f64 {
        self.vram_budget as f64 / GIB as f64
    }
}

/// Looks up one of the fixed presets by name or alias.
pub fn resolve(name: &str) -> Result<Preset, PipelineError> {
    let parsed: PresetName = name.parse()?;
    Ok(preset_for(parsed))
}

pub fn preset_for(name: PresetName) -> Preset {
    match name {
        PresetName::Fast => Preset {
            name,
            description: "Quick pass for 720p/1080p sources, keeps the source frame rate",
            target_resolution: Resolution::HD_1080,
            scale_factor: 2,
            target_frame_rate: None,
            vram_budget: 2 * GIB,
            speed_class: SpeedClass::Fast,
            tile_size: 0,
            encoder: EncoderTuning {
                speed: "fast",
                crf: 23,
            },
        },
        PresetName::Standard => Preset {
            name,
            description: "Balanced quality and speed, 1080p at 60fps",
            target_resolution: Resolution::HD_1080,
            scale_factor: 2,
            target_frame_rate: Some(FrameRate::fps(60)),
            vram_budget: 4 * GIB,
            speed_class: SpeedClass::Balanced,
            tile_size: 400,
            encoder: EncoderTuning {
                speed: "medium",
                crf: 20,
            },
        },
        PresetName::HighDefinition => Preset {
            name,
            description: "Maximum quality, 4K at 60fps",
            target_resolution: Resolution::UHD_4K,
            scale_factor: 4,
            target_frame_rate: Some(FrameRate::fps(60)),
            vram_budget: 6 * GIB,
            speed_class: SpeedClass::Slow,
            tile_size: 200,
            encoder: EncoderTuning {
                speed: "slow",
                crf: 18,
            },
        },
    }
}

/// Rough wall-clock estimate in seconds for a clip of `duration_secs`.
pub fn estimate_processing_time(duration_secs: f64, preset: &Preset, has_gpu: bool) -> f64 {
    let mut speed = preset.speed_class.realtime_multiplier();
    if !has_gpu {
        speed *= 0.1;
    }
    duration_secs / speed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VramFit {
    Sufficient,
    Tight,
    Insufficient,
}

pub fn check_vram_compatibility(available: u64, preset: &Preset) -> VramFit {
    if available >= preset.vram_budget {
        VramFit::Sufficient
    } else if available as f64 >= preset.vram_budget as f64 * 0.8 {
        VramFit::Tight
    } else {
        VramFit::Insufficient
    }
}

/// Writes a batch recipe template for `name` to `destination`.
pub fn generate_recipe(name: PresetName, destination: &Path) -> Result<PathBuf> {
    let recipe = Recipe {
        version: 1,
        inputs: vec![InputSpec {
            path: "./videos/*.mp4".into(),
        }],
        preset: name.to_string(),
        interpolate: true,
        output: OutputSpec {
            directory: PathBuf::from(format!("./out/{name}")),
            structure: "{stem}_{preset}.{ext}".into(),
            container: Default::default(),
        },
        device: Default::default(),
        limits: Default::default(),
        ffmpeg: Default::default(),
        frames: Default::default(),
    };

    let rendered = serde_yaml::to_string(&recipe)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}
