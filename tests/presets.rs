use std::fs;

use mpgif::presets::{generate_recipe, known_presets, preset};
use mpgif::recipe::Recipe;
use mpgif::validation::validate_recipe;
use tempfile::tempdir;

#[test]
fn preset_table_is_stable() {
    let rows: Vec<_> = known_presets()
        .iter()
        .map(|p| (p.name, p.fps, p.width, p.quality, p.loop_count, p.audio))
        .collect();
    assert_eq!(
        rows,
        [
            ("gif-like", 12, 320, 60, 0, false),
            ("balanced", 15, 480, 75, 0, true),
            ("hq", 24, 720, 90, 0, true),
            ("archival", 30, 1080, 95, 0, true),
        ]
    );
    assert_eq!(preset("HQ").map(|p| p.name), Some("hq"));
    assert!(preset("ultra").is_none());
}

#[test]
fn generated_recipe_loads_and_validates() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("recipes/gif-like.yaml");
    let generated = generate_recipe("gif-like", &path).expect("recipe generation");
    assert!(generated.is_file());

    let contents = fs::read_to_string(&generated).unwrap();
    assert!(contents.contains("preset: gif-like"));
    assert!(contents.contains("{stem}.mpgif"));

    let recipe = Recipe::load(&generated).unwrap();
    assert_eq!(recipe.encode.preset.as_deref(), Some("gif-like"));
    let report = validate_recipe(&recipe);
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn unknown_preset_names_the_alternatives() {
    let temp = tempdir().unwrap();
    let err = generate_recipe("ultra", &temp.path().join("ultra.yaml")).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("ultra"));
    assert!(message.contains("balanced"));
    assert!(!temp.path().join("ultra.yaml").exists());
}
