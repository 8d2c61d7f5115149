use std::fs;

use tempfile::tempdir;
use vidlift::ErrorKind;
use vidlift::presets::{
    GIB, PresetName, VramFit, check_vram_compatibility, estimate_processing_time,
    generate_recipe, preset_for, resolve,
};
use vidlift::recipe::Recipe;
use vidlift::video::{FrameRate, Resolution};

#[test]
fn fixed_table_matches_tiers() {
    let fast = resolve("fast").unwrap();
    assert_eq!(fast.target_resolution, Resolution::HD_1080);
    assert_eq!(fast.target_frame_rate, None);
    assert_eq!(fast.vram_budget, 2 * GIB);

    let standard = resolve("standard").unwrap();
    assert_eq!(standard.target_resolution, Resolution::HD_1080);
    assert_eq!(standard.target_frame_rate, Some(FrameRate::fps(60)));
    assert_eq!(standard.vram_budget, 4 * GIB);

    let hd = resolve("high-definition").unwrap();
    assert_eq!(hd.target_resolution, Resolution::UHD_4K);
    assert_eq!(hd.scale_factor, 4);
    assert_eq!(hd.vram_budget, 6 * GIB);
}

#[test]
fn aliases_resolve_and_unknown_names_fail() {
    assert_eq!(resolve("HD").unwrap().name, PresetName::HighDefinition);
    assert_eq!(resolve(" high ").unwrap().name, PresetName::HighDefinition);

    let err = resolve("ultra").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownPreset);
    assert!(err.to_string().contains("ultra"));
}

#[test]
fn frame_rate_is_never_decimated() {
    let standard = preset_for(PresetName::Standard);
    assert_eq!(standard.output_frame_rate(FrameRate::fps(24)), FrameRate::fps(60));
    assert_eq!(standard.output_frame_rate(FrameRate::fps(120)), FrameRate::fps(120));

    let fast = preset_for(PresetName::Fast);
    let ntsc = FrameRate::new(30000, 1001);
    assert_eq!(fast.output_frame_rate(ntsc), ntsc);
}

#[test]
fn output_resolution_fits_bound() {
    let fast = preset_for(PresetName::Fast);
    assert_eq!(
        fast.output_resolution(Resolution::new(1280, 720)),
        Resolution::HD_1080
    );
    assert_eq!(
        fast.output_resolution(Resolution::new(640, 360)),
        Resolution::new(1280, 720)
    );

    let hd = preset_for(PresetName::HighDefinition);
    assert_eq!(
        hd.output_resolution(Resolution::new(1280, 720)),
        Resolution::UHD_4K
    );
}

#[test]
fn vram_fit_thresholds() {
    let standard = preset_for(PresetName::Standard);
    assert_eq!(check_vram_compatibility(8 * GIB, &standard), VramFit::Sufficient);
    assert_eq!(
        check_vram_compatibility(4 * GIB * 85 / 100, &standard),
        VramFit::Tight
    );
    assert_eq!(check_vram_compatibility(2 * GIB, &standard), VramFit::Insufficient);
}

#[test]
fn processing_estimate_scales_with_speed_class() {
    let fast = preset_for(PresetName::Fast);
    let hd = preset_for(PresetName::HighDefinition);
    assert_eq!(estimate_processing_time(60.0, &fast, true), 30.0);
    assert_eq!(estimate_processing_time(60.0, &hd, true), 240.0);
    assert!((estimate_processing_time(60.0, &fast, false) - 300.0).abs() < 1e-9);
}

#[test]
fn generated_recipe_loads_back() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("recipes/hd.yaml");
    let generated = generate_recipe(PresetName::HighDefinition, &path).expect("recipe generation");
    assert!(generated.exists());

    let contents = fs::read_to_string(&generated).unwrap();
    assert!(contents.contains("preset: high-definition"));

    let recipe = Recipe::load(&generated).unwrap();
    assert_eq!(recipe.preset, "high-definition");
    assert_eq!(recipe.output.structure, "{stem}_{preset}.{ext}");
}
