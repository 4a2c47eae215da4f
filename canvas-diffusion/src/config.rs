//! Studio configuration.
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object (or no file at all) yields the stock studio settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub use crate::models::residency::EvictionPolicy;

/// Default negative prompt for every render.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "lowres, bad anatomy, bad hands, cropped, worst quality";

/// Top-level studio settings.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct StudioConfig {
    #[serde(default)]
    pub render: RenderDefaults,

    #[serde(default)]
    pub chat: ChatDefaults,

    #[serde(default)]
    pub folders: Folders,

    /// Where components go when a stage no longer needs them.
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

impl StudioConfig {
    /// Reads a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.chat.poll_interval()?;
        Ok(config)
    }
}

/// Default render parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RenderDefaults {
    #[serde(default = "default_width")]
    pub width: usize,

    #[serde(default = "default_height")]
    pub height: usize,

    #[serde(default = "default_num_samples")]
    pub num_samples: usize,

    #[serde(default = "default_steps")]
    pub steps: usize,

    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,

    /// 1.0 disables the highres pass.
    #[serde(default = "default_highres_scale")]
    pub highres_scale: f64,

    #[serde(default = "default_highres_steps")]
    pub highres_steps: usize,

    #[serde(default = "default_highres_denoise")]
    pub highres_denoise: f64,

    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,

    #[serde(default = "default_lora_scale")]
    pub lora_scale: f64,
}

fn default_width() -> usize {
    1920
}
fn default_height() -> usize {
    1080
}
fn default_num_samples() -> usize {
    1
}
fn default_steps() -> usize {
    25
}
fn default_cfg_scale() -> f64 {
    5.0
}
fn default_highres_scale() -> f64 {
    1.0
}
fn default_highres_steps() -> usize {
    20
}
fn default_highres_denoise() -> f64 {
    0.4
}
fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}
fn default_lora_scale() -> f64 {
    0.5
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            num_samples: default_num_samples(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            highres_scale: default_highres_scale(),
            highres_steps: default_highres_steps(),
            highres_denoise: default_highres_denoise(),
            negative_prompt: default_negative_prompt(),
            lora_scale: default_lora_scale(),
        }
    }
}

/// Default text generation parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatDefaults {
    /// 0.0 switches to greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Longest wait for the next streamed fragment before reporting a stall.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
}

fn default_temperature() -> f64 {
    0.6
}
fn default_top_p() -> f64 {
    0.9
}
fn default_max_new_tokens() -> usize {
    4096
}
fn default_poll_interval_secs() -> f64 {
    10.0
}

impl Default for ChatDefaults {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_new_tokens: default_max_new_tokens(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl ChatDefaults {
    pub fn poll_interval(&self) -> crate::Result<Duration> {
        Duration::try_from_secs_f64(self.poll_interval_secs)
            .map_err(|e| crate::Error::Config(format!("poll_interval_secs {}: {e}", self.poll_interval_secs)))
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Folders {
    #[serde(default = "default_outputs")]
    pub outputs: PathBuf,

    /// Base directory for relative checkpoint paths.
    #[serde(default = "default_checkpoints")]
    pub checkpoints: PathBuf,

    #[serde(default = "default_loras")]
    pub loras: PathBuf,
}

fn default_outputs() -> PathBuf {
    PathBuf::from("outputs")
}
fn default_checkpoints() -> PathBuf {
    PathBuf::from("models/checkpoints")
}
fn default_loras() -> PathBuf {
    PathBuf::from("models/loras")
}

impl Folders {
    /// Resolves a checkpoint given on the command line: existing or absolute
    /// paths are used as is, anything else is looked up under `checkpoints`.
    pub fn checkpoint(&self, name: &str) -> PathBuf {
        let path = PathBuf::from(name);
        if path.is_absolute() || path.exists() {
            path
        } else {
            self.checkpoints.join(path)
        }
    }
}

impl Default for Folders {
    fn default() -> Self {
        Self {
            outputs: default_outputs(),
            checkpoints: default_checkpoints(),
            loras: default_loras(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config: StudioConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StudioConfig::default());
        assert_eq!(config.render.width, 1920);
        assert_eq!(config.render.height, 1080);
        assert_eq!(config.render.steps, 25);
        assert_eq!(config.render.highres_steps, 20);
        assert_eq!(config.chat.max_new_tokens, 4096);
        assert_eq!(config.chat.poll_interval().unwrap(), Duration::from_secs(10));
        assert_eq!(config.eviction, EvictionPolicy::Unload);
    }

    #[test]
    fn partial_sections_are_filled_in() {
        let config: StudioConfig = serde_json::from_str(
            r#"{"render": {"steps": 30, "highres_scale": 1.5},
                "chat": {"temperature": 0.0},
                "eviction": "host"}"#,
        )
        .unwrap();
        assert_eq!(config.render.steps, 30);
        assert_eq!(config.render.highres_scale, 1.5);
        assert_eq!(config.render.cfg_scale, 5.0);
        assert_eq!(config.render.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(config.chat.temperature, 0.0);
        assert_eq!(config.chat.top_p, 0.9);
        assert_eq!(config.eviction, EvictionPolicy::Host);
    }

    #[test]
    fn out_of_range_poll_interval_is_a_config_error() -> crate::Result<()> {
        for secs in [f64::INFINITY, f64::NAN, -1.0, 1e300] {
            let chat = ChatDefaults {
                poll_interval_secs: secs,
                ..ChatDefaults::default()
            };
            assert!(matches!(chat.poll_interval(), Err(crate::Error::Config(_))), "{secs}");
        }

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("studio.json");
        std::fs::write(&path, r#"{"chat": {"poll_interval_secs": 1e300}}"#)?;
        assert!(matches!(StudioConfig::from_file(&path), Err(crate::Error::Config(_))));
        Ok(())
    }

    #[test]
    fn checkpoints_resolve_under_the_folder() {
        let folders = Folders::default();
        assert_eq!(
            folders.checkpoint("sdxl-base"),
            PathBuf::from("models/checkpoints/sdxl-base")
        );
        assert_eq!(folders.checkpoint("/opt/sdxl"), PathBuf::from("/opt/sdxl"));
    }

    #[test]
    fn reads_from_disk() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("studio.json");
        std::fs::write(&path, r#"{"folders": {"outputs": "renders"}}"#)?;
        let config = StudioConfig::from_file(&path)?;
        assert_eq!(config.folders.outputs, PathBuf::from("renders"));
        assert_eq!(config.folders.loras, PathBuf::from("models/loras"));
        Ok(())
    }
}
