use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::convert::EncodeOptions;
use crate::recipe::{InputSpec, OutputSpec, Recipe};

/// A named bundle of encode settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub fps: u8,
    pub width: u32,
    pub quality: u8,
    pub loop_count: u8,
    pub audio: bool,
}

const PRESETS: [Preset; 4] = [
    Preset {
        name: "gif-like",
        description: "Small silent loop in the spirit of an animated GIF",
        fps: 12,
        width: 320,
        quality: 60,
        loop_count: 0,
        audio: false,
    },
    Preset {
        name: "balanced",
        description: "Default trade-off between size and fidelity",
        fps: 15,
        width: 480,
        quality: 75,
        loop_count: 0,
        audio: true,
    },
    Preset {
        name: "hq",
        description: "Smooth 720p clip with audio",
        fps: 24,
        width: 720,
        quality: 90,
        loop_count: 0,
        audio: true,
    },
    Preset {
        name: "archival",
        description: "Full HD, near-lossless frames",
        fps: 30,
        width: 1080,
        quality: 95,
        loop_count: 0,
        audio: true,
    },
];

pub fn preset(name: &str) -> Option<&'static Preset> {
    let name = name.trim();
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

pub fn known_presets() -> &'static [Preset] {
    &PRESETS
}

pub fn preset_names() -> Vec<&'static str> {
    PRESETS.iter().map(|p| p.name).collect()
}

/// Writes a starter recipe that encodes `./videos/*.mp4` with `name`.
pub fn generate_recipe(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = preset(name).with_context(|| {
        format!(
            "Unknown preset '{name}'. Available presets: {}",
            preset_names().join(", ")
        )
    })?;

    let recipe = Recipe {
        version: 1,
        inputs: vec![InputSpec {
            path: "./videos/*.mp4".into(),
        }],
        output: OutputSpec {
            directory: PathBuf::from(format!("./out/{}", preset.name)),
            structure: "{stem}.mpgif".into(),
        },
        encode: EncodeOptions {
            preset: Some(preset.name.to_string()),
            ..EncodeOptions::default()
        },
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
