//! Render orchestration.
//!
//! [`Orchestrator::run`] sequences one render request through the stages,
//! moving models with the registry at every boundary:
//!
//! ```text
//! validate → seed → evict all → select checkpoint → type check
//!   → [text encoders] compile → [unet] render → [vae] decode
//!   → (highres: [vae] encode → [unet] render → [vae] decode)
//!   → PNG files
//! ```
//!
//! Parameter errors are raised before any model is touched. A highres
//! failure after a successful base pass keeps the base images.

use std::path::{Path, PathBuf};

use candle::{DType, Tensor};
use image::RgbImage;
use rand::Rng;

use super::canvas::{floor_resolution, Canvas};
use super::conditioning::{compile, TextEncoders, LATENT_FACTOR};
use super::highres::{self, should_refine, HighresParams, RefineContext};
use super::lora::LoraSelection;
use super::render::RegionalMode;
use super::residency::{CheckpointId, ComponentKind, ModelRegistry, PipelineLoader};
use super::rng::NoiseGenerator;
use super::scheduler::{NoiseSchedule, ScheduleConfig};
use crate::config::RenderDefaults;
use crate::error::StageContext;
use crate::{Error, Result};

/// Pipeline variant the orchestrator knows how to drive.
pub const REGIONAL_PIPELINE: &str = "regional-sdxl";

/// Channels of the SDXL latent space.
pub const LATENT_CHANNELS: usize = 4;

/// One render, as submitted by the caller.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub canvas: Canvas,
    pub num_samples: usize,
    /// `-1` picks a fresh random seed.
    pub seed: i64,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub cfg_scale: f64,
    pub highres_scale: f64,
    pub highres_steps: usize,
    pub highres_denoise: f64,
    /// Empty falls back to the canvas's own negative prompt.
    pub negative_prompt: String,
    pub lora_selection: Option<PathBuf>,
    pub lora_scale: f64,
    pub regional_mode: RegionalMode,
}

impl RenderRequest {
    pub fn new(canvas: Canvas, defaults: &RenderDefaults) -> Self {
        Self {
            canvas,
            num_samples: defaults.num_samples,
            seed: -1,
            width: defaults.width,
            height: defaults.height,
            steps: defaults.steps,
            cfg_scale: defaults.cfg_scale,
            highres_scale: defaults.highres_scale,
            highres_steps: defaults.highres_steps,
            highres_denoise: defaults.highres_denoise,
            negative_prompt: defaults.negative_prompt.clone(),
            lora_selection: None,
            lora_scale: defaults.lora_scale,
            regional_mode: RegionalMode::default(),
        }
    }

    /// Checks every parameter; returns the floored resolution.
    pub fn validate(&self) -> Result<(usize, usize)> {
        if self.num_samples == 0 {
            return Err(Error::invalid("num_samples", "must be at least 1"));
        }
        if self.seed < -1 {
            return Err(Error::invalid("seed", format!("{} is negative", self.seed)));
        }
        if self.steps == 0 {
            return Err(Error::InvalidStepCount(self.steps));
        }
        if !self.cfg_scale.is_finite() {
            return Err(Error::invalid("cfg_scale", "must be finite"));
        }
        if !self.lora_scale.is_finite() {
            return Err(Error::invalid("lora_scale", "must be finite"));
        }
        if !(self.highres_scale.is_finite() && self.highres_scale > 0.0) {
            return Err(Error::invalid("highres_scale", "must be positive"));
        }
        if should_refine(self.highres_scale) {
            if self.highres_steps == 0 {
                return Err(Error::InvalidStepCount(self.highres_steps));
            }
            if !(self.highres_denoise > 0.0 && self.highres_denoise <= 1.0) {
                return Err(Error::invalid(
                    "highres_denoise",
                    format!("{} is outside (0, 1]", self.highres_denoise),
                ));
            }
        }
        floor_resolution(self.width, self.height)
    }
}

/// What became of the highres pass.
#[derive(Debug, Clone, PartialEq)]
pub enum HighresOutcome {
    /// The scale was within the threshold of 1.0.
    Skipped,
    Applied,
    /// The pass failed; the base images were returned instead.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub images: Vec<RgbImage>,
    /// The seed actually used, never -1.
    pub seed: u64,
    pub paths: Vec<PathBuf>,
    pub highres: HighresOutcome,
}

/// Resolves `-1` to a random seed in `[0, 2^32 - 1)`.
pub fn resolve_seed(seed: i64) -> Result<u64> {
    match seed {
        -1 => Ok(rand::rng().random_range(0..u32::MAX as u64)),
        s if s >= 0 => Ok(s as u64),
        s => Err(Error::invalid("seed", format!("{s} is negative"))),
    }
}

/// Writes each image as `<uuid>_<index>.png` under `dir`, with a fresh
/// token per image.
pub fn save_outputs(images: &[RgbImage], dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    images
        .iter()
        .enumerate()
        .map(|(i, image)| {
            let stem = uuid::Uuid::new_v4().simple().to_string();
            let path = dir.join(format!("{stem}_{i}.png"));
            image.save(&path)?;
            Ok(path)
        })
        .collect()
}

/// Drives render requests against a [`ModelRegistry`].
pub struct Orchestrator {
    loader: Box<dyn PipelineLoader>,
    checkpoint: CheckpointId,
    output_dir: PathBuf,
    schedule: NoiseSchedule,
}

impl Orchestrator {
    pub fn new(loader: Box<dyn PipelineLoader>, checkpoint: CheckpointId, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            checkpoint,
            output_dir: output_dir.into(),
            schedule: NoiseSchedule::new(&ScheduleConfig::default()),
        }
    }

    pub fn with_schedule(mut self, config: &ScheduleConfig) -> Self {
        self.schedule = NoiseSchedule::new(config);
        self
    }

    pub fn checkpoint(&self) -> &CheckpointId {
        &self.checkpoint
    }

    /// Checkpoint used by the next render.
    pub fn set_checkpoint(&mut self, checkpoint: CheckpointId) {
        self.checkpoint = checkpoint;
    }

    pub fn run(&self, registry: &mut ModelRegistry, request: &RenderRequest) -> Result<RenderOutput> {
        let (width, height) = request.validate()?;
        let seed = resolve_seed(request.seed)?;
        tracing::info!(seed, width, height, samples = request.num_samples, "render started");

        registry.ensure_resident(&[])?;
        let (lora, lora_scale) = LoraSelection::resolve(request.lora_selection.as_deref(), request.lora_scale)?;
        let activation_text = lora
            .as_ref()
            .and_then(|l| l.activation_text())
            .map(str::to_string);
        registry.select_checkpoint(self.loader.as_ref(), &self.checkpoint, lora)?;
        let kind = registry.pipeline()?.kind;
        if kind != REGIONAL_PIPELINE {
            return Err(Error::PipelineType {
                expected: REGIONAL_PIPELINE,
                found: kind.to_string(),
            });
        }

        let device = registry.device().clone();
        if !device.is_cpu() {
            device.set_seed(seed)?;
        }
        let canvas = request.canvas.clone().at_resolution(width, height)?;
        let negative_prompt = match request.negative_prompt.trim() {
            "" => canvas.negative_prompt(),
            prompt => prompt,
        };

        registry.ensure_resident(&[ComponentKind::TextEncoder, ComponentKind::TextEncoder2])?;
        let bundle = {
            let pipeline = registry.pipeline()?;
            let encoders = TextEncoders {
                tokenizer: &*pipeline.tokenizer,
                encoder: &**pipeline.text_encoder.get()?,
                tokenizer_2: &*pipeline.tokenizer_2,
                encoder_2: &**pipeline.text_encoder_2.get()?,
                device: &device,
            };
            compile(
                &canvas,
                negative_prompt,
                lora_scale,
                activation_text.as_deref(),
                &encoders,
                request.num_samples,
            )
            .stage("conditioning")?
        };

        let mut rng = NoiseGenerator::new(seed);
        let initial = Tensor::zeros(
            (request.num_samples, LATENT_CHANNELS, height / LATENT_FACTOR, width / LATENT_FACTOR),
            DType::F32,
            &device,
        )?;
        let latents = highres::denoise(
            registry,
            &self.schedule,
            &initial,
            1.0,
            request.steps,
            &bundle,
            request.cfg_scale,
            request.regional_mode,
            &mut rng,
            "render",
        )?;
        let base = highres::decode(registry, &latents, "decode")?;
        tracing::info!("base pass finished");

        let (images, outcome) = if should_refine(request.highres_scale) {
            let params = HighresParams {
                scale: request.highres_scale,
                steps: request.highres_steps,
                denoise: request.highres_denoise,
            };
            let mut ctx = RefineContext {
                registry: &mut *registry,
                schedule: &self.schedule,
                bundle: &bundle,
                guidance_scale: request.cfg_scale,
                mode: request.regional_mode,
                rng: &mut rng,
            };
            match highres::refine(&mut ctx, &base, &params, 64) {
                Ok(images) => (images, HighresOutcome::Applied),
                Err(e @ Error::ResidencyViolation { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("highres pass failed, keeping base images: {e}");
                    (base, HighresOutcome::Failed(e.to_string()))
                }
            }
        } else {
            (base, HighresOutcome::Skipped)
        };

        let paths = save_outputs(&images, &self.output_dir)?;
        tracing::info!(seed, files = paths.len(), "render finished");
        Ok(RenderOutput {
            images,
            seed,
            paths,
            highres: outcome,
        })
    }
}
