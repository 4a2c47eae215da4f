//! LoRA selection and its side-car metadata.
//!
//! A LoRA weights file may have a JSON file with the same basename next to
//! it. Its `"activation text"` entry is the trigger phrase prepended to every
//! region prompt. Merging the weights is left to the pipeline loader.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LoraMetadata {
    #[serde(rename = "activation text", default)]
    pub activation_text: Option<String>,
}

impl LoraMetadata {
    /// Reads `<weights without extension>.json`; a missing file means no metadata.
    pub fn for_weights(weights: impl AsRef<Path>) -> Result<Self> {
        let sidecar = weights.as_ref().with_extension("json");
        if !sidecar.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&sidecar)?;
        let metadata: Self = serde_json::from_str(&text)?;
        Ok(metadata)
    }

    /// The trigger phrase, if present and not blank.
    pub fn activation_text(&self) -> Option<&str> {
        self.activation_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// A LoRA chosen for a render.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSelection {
    pub path: PathBuf,
    pub scale: f64,
    pub metadata: LoraMetadata,
}

impl LoraSelection {
    /// Resolves the user's choice.
    ///
    /// Returns the selection (if any) and the effective scale: without a
    /// weights file on disk the LoRA is ignored and the scale forced to 0.
    pub fn resolve(path: Option<&Path>, scale: f64) -> Result<(Option<Self>, f64)> {
        match path {
            Some(path) if path.is_file() => {
                let metadata = LoraMetadata::for_weights(path)?;
                Ok((
                    Some(Self {
                        path: path.to_path_buf(),
                        scale,
                        metadata,
                    }),
                    scale,
                ))
            }
            Some(path) => {
                tracing::warn!("lora {} not found, ignoring it", path.display());
                Ok((None, 0.0))
            }
            None => Ok((None, 0.0)),
        }
    }

    pub fn activation_text(&self) -> Option<&str> {
        self.metadata.activation_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_activation_text() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("pixel_art.safetensors");
        std::fs::write(&weights, b"")?;
        std::fs::write(
            dir.path().join("pixel_art.json"),
            r#"{"activation text": " pixel art, ", "preferred weight": 0.8}"#,
        )?;
        let (selection, scale) = LoraSelection::resolve(Some(&weights), 0.5)?;
        let selection = selection.unwrap();
        assert_eq!(scale, 0.5);
        assert_eq!(selection.activation_text(), Some("pixel art,"));
        Ok(())
    }

    #[test]
    fn missing_sidecar_means_no_activation_text() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let weights = dir.path().join("detail.safetensors");
        std::fs::write(&weights, b"")?;
        let metadata = LoraMetadata::for_weights(&weights)?;
        assert_eq!(metadata.activation_text(), None);
        Ok(())
    }

    #[test]
    fn missing_weights_zero_the_scale() -> Result<()> {
        let (selection, scale) = LoraSelection::resolve(Some(Path::new("/nonexistent/lora.safetensors")), 0.7)?;
        assert!(selection.is_none());
        assert_eq!(scale, 0.0);
        let (selection, scale) = LoraSelection::resolve(None, 0.7)?;
        assert!(selection.is_none());
        assert_eq!(scale, 0.0);
        Ok(())
    }
}
