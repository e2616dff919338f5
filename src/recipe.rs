use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::convert::EncodeOptions;

/// Batch encode job description, loaded from YAML.
///
/// ```yaml
/// version: 1
/// inputs:
///   - path: ./videos/*.mp4
/// output:
///   directory: ./out
///   structure: "{stem}.mpgif"
/// encode:
///   preset: balanced
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Recipe {
    pub version: u32,
    pub inputs: Vec<InputSpec>,
    pub output: OutputSpec,
    #[serde(default)]
    pub encode: EncodeOptions,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        Ok(recipe)
    }

    pub fn expand_inputs(&self) -> Result<Vec<PathBuf>> {
        let mut resolved = Vec::new();
        for input in &self.inputs {
            let matches = glob(&input.path)
                .with_context(|| format!("Invalid glob pattern: {}", input.path))?;
            let mut found = false;
            for entry in matches {
                let path = entry?;
                if path.is_file() {
                    resolved.push(path);
                    found = true;
                }
            }
            if !found {
                anyhow::bail!("No inputs matched pattern: {}", input.path);
            }
        }
        resolved.sort();
        resolved.dedup();
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSpec {
    pub directory: PathBuf,
    #[serde(default = "default_output_structure")]
    pub structure: String,
}

fn default_output_structure() -> String {
    "{stem}.mpgif".to_string()
}

impl OutputSpec {
    /// Output path for `input`, with `{stem}` replaced by its file stem.
    pub fn resolve(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "clip".to_string());
        self.directory
            .join(self.structure.replace("{stem}", &stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_recipe_uses_defaults() {
        let recipe: Recipe = serde_yaml::from_str(
            "version: 1\ninputs:\n  - path: clips/*.mp4\noutput:\n  directory: out\n",
        )
        .unwrap();
        assert_eq!(recipe.output.structure, "{stem}.mpgif");
        assert_eq!(recipe.encode, EncodeOptions::default());
        assert_eq!(
            recipe.output.resolve(Path::new("clips/cat.mp4")),
            PathBuf::from("out/cat.mpgif")
        );
    }

    #[test]
    fn unmatched_pattern_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = Recipe {
            version: 1,
            inputs: vec![InputSpec {
                path: dir.path().join("*.mp4").to_string_lossy().into_owned(),
            }],
            output: OutputSpec {
                directory: dir.path().to_path_buf(),
                structure: default_output_structure(),
            },
            encode: EncodeOptions::default(),
        };
        let err = recipe.expand_inputs().unwrap_err();
        assert!(err.to_string().contains("No inputs matched"));
    }
}
