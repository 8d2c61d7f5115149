use std::path::PathBuf;

use tempfile::tempdir;
use vidlift::recipe::{DeviceSettings, InputSpec, Limits, OutputSpec, Recipe};
use vidlift::validation::validate_recipe;
use vidlift::video::ContainerFormat;

fn base_recipe(output_dir: PathBuf) -> Recipe {
    Recipe {
        version: 1,
        inputs: vec![InputSpec {
            path: "./clips/*.mp4".to_string(),
        }],
        preset: "standard".to_string(),
        interpolate: true,
        output: OutputSpec {
            directory: output_dir,
            structure: "{stem}.{ext}".to_string(),
            container: ContainerFormat::Mp4,
        },
        device: DeviceSettings {
            vram_gb: Some(8.0),
            max_concurrent_jobs: 1,
        },
        limits: Limits::default(),
        ffmpeg: Default::default(),
        frames: Default::default(),
    }
}

#[test]
fn well_formed_recipe_passes() {
    let temp = tempdir().unwrap();
    let report = validate_recipe(&base_recipe(temp.path().join("out")));
    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    assert!(report.warnings.is_empty());
}

#[test]
fn unknown_preset_and_bad_glob_are_errors() {
    let temp = tempdir().unwrap();
    let mut recipe = base_recipe(temp.path().join("out"));
    recipe.preset = "cinematic".into();
    recipe.inputs.push(InputSpec {
        path: "clips/[*.mp4".into(),
    });

    let report = validate_recipe(&recipe);
    assert!(!report.is_ok());
    assert!(report.errors.iter().any(|e| e.contains("cinematic")));
    assert!(report.errors.iter().any(|e| e.contains("not a valid glob")));
}

#[test]
fn preset_larger_than_device_is_rejected() {
    let temp = tempdir().unwrap();
    let mut recipe = base_recipe(temp.path().join("out"));
    recipe.preset = "high-definition".into();
    recipe.device.vram_gb = Some(4.0);

    let report = validate_recipe(&recipe);
    assert!(
        report.errors.iter().any(|e| e.contains("needs 6.0 GB")),
        "errors: {:?}",
        report.errors
    );
}

#[test]
fn oversubscribed_concurrency_only_warns() {
    let temp = tempdir().unwrap();
    let mut recipe = base_recipe(temp.path().join("out"));
    recipe.device.max_concurrent_jobs = 3;

    let report = validate_recipe(&recipe);
    assert!(report.is_ok());
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("only 2 will run at a time"))
    );
}

#[test]
fn zero_limits_and_concurrency_are_errors() {
    let temp = tempdir().unwrap();
    let mut recipe = base_recipe(temp.path().join("out"));
    recipe.limits.inference_timeout_secs = 0;
    recipe.device.max_concurrent_jobs = 0;
    recipe.limits.min_free_disk_gb = -1.0;

    let report = validate_recipe(&recipe);
    assert!(report.errors.iter().any(|e| e.contains("min_free_disk_gb")));
    assert!(report.errors.iter().any(|e| e.contains("inference_timeout_secs")));
    assert!(report.errors.iter().any(|e| e.contains("max_concurrent_jobs")));
}

#[test]
fn unsupported_extension_is_a_warning() {
    let temp = tempdir().unwrap();
    let mut recipe = base_recipe(temp.path().join("out"));
    recipe.inputs = vec![InputSpec {
        path: "clips/*.txt".into(),
    }];

    let report = validate_recipe(&recipe);
    assert!(report.is_ok());
    assert!(report.warnings.iter().any(|w| w.contains(".txt")));
}

#[test]
fn empty_inputs_and_output_are_errors() {
    let mut recipe = base_recipe(PathBuf::new());
    recipe.inputs.clear();
    recipe.version = 2;

    let report = validate_recipe(&recipe);
    assert_eq!(report.errors.len(), 3, "errors: {:?}", report.errors);
}
