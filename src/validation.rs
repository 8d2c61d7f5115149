use std::path::Path;

use serde::Serialize;

use crate::presets::{self, GIB, Preset};
use crate::recipe::Recipe;
use crate::scheduler::detect_device_memory;
use crate::video::VIDEO_EXTENSIONS;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.inputs.is_empty() {
        report
            .errors
            .push("At least one input pattern is required".into());
    }
    for (idx, input) in recipe.inputs.iter().enumerate() {
        if input.path.trim().is_empty() {
            report
                .errors
                .push("Input path patterns cannot be empty".into());
            continue;
        }
        if let Err(err) = glob::Pattern::new(&input.path) {
            report.errors.push(format!(
                "Input pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                input.path,
                err
            ));
        }
        if let Some(ext) = Path::new(&input.path).extension().and_then(|e| e.to_str())
            && !ext.contains('*')
            && !VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str())
        {
            report.warnings.push(format!(
                "Input pattern '{}' targets unsupported extension '.{}' (supported: {})",
                input.path,
                ext,
                VIDEO_EXTENSIONS.join(", ")
            ));
        }
    }

    if recipe.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }

    let limits = &recipe.limits;
    for (name, secs) in [
        ("decode_timeout_secs", limits.decode_timeout_secs),
        ("inference_timeout_secs", limits.inference_timeout_secs),
        ("encode_timeout_secs", limits.encode_timeout_secs),
    ] {
        if secs == 0 {
            report
                .errors
                .push(format!("limits.{name} must be greater than zero"));
        }
    }
    if !limits.min_free_disk_gb.is_finite() || limits.min_free_disk_gb < 0.0 {
        report.errors.push(format!(
            "limits.min_free_disk_gb must be zero or more (got {})",
            limits.min_free_disk_gb
        ));
    }

    match presets::resolve(&recipe.preset) {
        Ok(preset) => report.merge(validate_device(recipe, &preset)),
        Err(err) => report.errors.push(err.to_string()),
    }

    report
}

fn validate_device(recipe: &Recipe, preset: &Preset) -> ValidationReport {
    let mut report = ValidationReport::default();
    let concurrency = recipe.device.max_concurrent_jobs;
    if concurrency == 0 {
        report
            .errors
            .push("device.max_concurrent_jobs must be at least 1".into());
        return report;
    }

    let capacity = detect_device_memory(recipe.device.vram_gb);
    if capacity < preset.vram_budget {
        report.errors.push(format!(
            "Preset '{}' needs {:.1} GB of VRAM but the device offers {:.1} GB",
            preset.name,
            preset.vram_budget_gb(),
            capacity as f64 / GIB as f64
        ));
    } else if concurrency > 1 && preset.vram_budget * concurrency as u64 > capacity {
        let fits = capacity / preset.vram_budget;
        report.warnings.push(format!(
            "{concurrency} concurrent '{}' jobs need {:.1} GB; only {fits} will run at a time",
            preset.name,
            preset.vram_budget_gb() * concurrency as f64
        ));
    }
    report
}
