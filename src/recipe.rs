use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capabilities::{FfmpegSettings, FrameSettings};
use crate::video::{ContainerFormat, is_frame_path, is_video_path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    pub inputs: Vec<InputSpec>,
    pub preset: String,
    /// Run the preset's frame-rate stage. Off keeps each source rate.
    #[serde(default = "default_interpolate")]
    pub interpolate: bool,
    pub output: OutputSpec,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub ffmpeg: FfmpegSettings,
    #[serde(default)]
    pub frames: FrameSettings,
}

fn default_interpolate() -> bool {
    true
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        Ok(recipe)
    }

    /// Resolves every input pattern. Video files and directories holding
    /// image frames both count as inputs.
    pub fn expand_inputs(&self) -> Result<Vec<PathBuf>> {
        let mut resolved = Vec::new();
        for input in &self.inputs {
            let matches = glob(&input.path)
                .with_context(|| format!("Invalid glob pattern: {}", input.path))?;
            let mut found = false;
            for entry in matches {
                let path = entry?;
                if (path.is_file() && is_video_path(&path)) || is_frame_directory(&path) {
                    resolved.push(path);
                    found = true;
                } else if path.is_file() {
                    warn!(input = %path.display(), "Skipping unsupported input");
                }
            }
            if !found {
                anyhow::bail!("No inputs matched pattern: {}", input.path);
            }
        }
        Ok(resolved)
    }

    pub fn output_path(&self, input: &Path) -> PathBuf {
        self.output.render(input, &self.preset)
    }
}

fn is_frame_directory(path: &Path) -> bool {
    path.is_dir()
        && std::fs::read_dir(path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .any(|e| is_frame_path(&e.path()))
            })
            .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub directory: PathBuf,
    #[serde(default = "default_structure")]
    pub structure: String,
    #[serde(default)]
    pub container: ContainerFormat,
}

fn default_structure() -> String {
    "{stem}.{ext}".to_string()
}

impl OutputSpec {
    /// Expands `{stem}`, `{preset}` and `{ext}` for one input.
    pub fn render(&self, input: &Path, preset: &str) -> PathBuf {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let name = self
            .structure
            .replace("{stem}", stem)
            .replace("{preset}", preset)
            .replace("{ext}", self.container.extension());
        self.directory.join(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Ledger capacity in GiB. Falls back to `VIDLIFT_VRAM_GB`, then the
    /// built-in default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_gb: Option<f64>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vram_gb: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_decode_timeout")]
    pub decode_timeout_secs: u64,
    #[serde(default = "default_inference_timeout")]
    pub inference_timeout_secs: u64,
    #[serde(default = "default_encode_timeout")]
    pub encode_timeout_secs: u64,
    /// A run refuses to start with less free space than this in the
    /// output directory.
    #[serde(default = "default_min_free_disk_gb")]
    pub min_free_disk_gb: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            decode_timeout_secs: default_decode_timeout(),
            inference_timeout_secs: default_inference_timeout(),
            encode_timeout_secs: default_encode_timeout(),
            min_free_disk_gb: default_min_free_disk_gb(),
        }
    }
}

impl Limits {
    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }
}

fn default_decode_timeout() -> u64 {
    60
}

fn default_inference_timeout() -> u64 {
    300
}

fn default_encode_timeout() -> u64 {
    120
}

fn default_min_free_disk_gb() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_recipe_fills_defaults() {
        let recipe: Recipe = serde_yaml::from_str(
            "version: 1\ninputs:\n  - path: a.mp4\npreset: fast\noutput:\n  directory: out\n",
        )
        .unwrap();
        assert_eq!(recipe.device.max_concurrent_jobs, 1);
        assert_eq!(recipe.limits.inference_timeout_secs, 300);
        assert_eq!(recipe.output.container, ContainerFormat::Mp4);
        assert_eq!(recipe.ffmpeg.codec, "libx264");
        assert!(recipe.interpolate);
        assert_eq!(recipe.limits.min_free_disk_gb, 5.0);
    }

    #[test]
    fn output_name_expands_placeholders() {
        let spec = OutputSpec {
            directory: PathBuf::from("out"),
            structure: "{stem}_{preset}.{ext}".into(),
            container: ContainerFormat::Mkv,
        };
        let path = spec.render(Path::new("clips/holiday.mp4"), "standard");
        assert_eq!(path, PathBuf::from("out/holiday_standard.mkv"));
    }
}
