use serde::Serialize;

use crate::convert::EncodeOptions;
use crate::presets;
use crate::recipe::Recipe;

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
                .push(format!("Input pattern {} is empty", idx + 1));
        } else if let Err(err) = glob::Pattern::new(&input.path) {
            report.errors.push(format!(
                "Input pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                input.path,
                err
            ));
        }
    }

    if recipe.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }
    if !recipe.output.structure.contains("{stem}") {
        report.warnings.push(format!(
            "Output structure '{}' has no {{stem}} placeholder; every input writes the same file",
            recipe.output.structure
        ));
    }

    report.merge(validate_encode(&recipe.encode));
    report
}

pub fn validate_encode(options: &EncodeOptions) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Some(name) = options.preset.as_deref() {
        if presets::preset(name).is_none() {
            report.errors.push(format!(
                "Unknown preset '{name}'. Available presets: {}",
                presets::preset_names().join(", ")
            ));
        }
        let defaults = EncodeOptions::default();
        let shadowed: Vec<&str> = [
            ("fps", options.fps != defaults.fps),
            ("width", options.width != defaults.width),
            ("quality", options.quality != defaults.quality),
            ("loop_count", options.loop_count != defaults.loop_count),
            ("audio", options.audio != defaults.audio),
        ]
        .into_iter()
        .filter_map(|(field, changed)| changed.then_some(field))
        .collect();
        if !shadowed.is_empty() {
            report.warnings.push(format!(
                "Preset '{name}' overrides explicit {}",
                shadowed.join(", ")
            ));
        }
    } else {
        if options.fps == 0 || options.fps > u32::from(u8::MAX) {
            report
                .errors
                .push(format!("fps must be between 1 and 255, got {}", options.fps));
        }
        if options.width == 0 || options.width > u32::from(u16::MAX) {
            report.errors.push(format!(
                "width must be between 1 and {}, got {}",
                u16::MAX,
                options.width
            ));
        }
        if options.quality > 100 {
            report
                .errors
                .push(format!("quality must be at most 100, got {}", options.quality));
        }
    }

    if let Some(height) = options.height
        && (height == 0 || height > u32::from(u16::MAX))
    {
        report.errors.push(format!(
            "height must be between 1 and {}, got {height}",
            u16::MAX
        ));
    }

    for (label, value) in [("start", options.start), ("end", options.end)] {
        if let Some(value) = value
            && (!value.is_finite() || value < 0.0)
        {
            report
                .errors
                .push(format!("{label} must be a non-negative number of seconds"));
        }
    }
    if let (Some(start), Some(end)) = (options.start, options.end)
        && start >= end
    {
        report
            .errors
            .push(format!("start ({start}s) must be before end ({end}s)"));
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_shadowing_is_a_warning() {
        let options = EncodeOptions {
            preset: Some("balanced".into()),
            fps: 30,
            ..EncodeOptions::default()
        };
        let report = validate_encode(&options);
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("fps"));
    }

    #[test]
    fn out_of_range_values_are_errors() {
        let options = EncodeOptions {
            fps: 300,
            quality: 120,
            start: Some(5.0),
            end: Some(1.0),
            ..EncodeOptions::default()
        };
        let report = validate_encode(&options);
        assert_eq!(report.errors.len(), 3);
    }
}
