//! Regional SDXL rendering of a canvas.

use std::path::{Path, PathBuf};

use anyhow::Result;
use canvas_diffusion::models::canvas::{render_to_grid, Canvas};
use canvas_diffusion::models::pipeline::{HighresOutcome, Orchestrator, RenderRequest};
use canvas_diffusion::models::render::RegionalMode;
use canvas_diffusion::models::residency::CheckpointId;
use canvas_diffusion::models::sdxl::SdxlLoader;

use crate::Studio;

#[derive(clap::Args)]
pub struct RenderArgs {
    #[arg(long)]
    width: Option<usize>,

    #[arg(long)]
    height: Option<usize>,

    #[arg(long)]
    num_samples: Option<usize>,

    /// Number of denoising steps.
    #[arg(long)]
    steps: Option<usize>,

    /// Classifier-free guidance scale.
    #[arg(long)]
    cfg_scale: Option<f64>,

    /// Render seed, -1 for a random one.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    seed: i64,

    /// Upscale factor of the second pass; values near 1.0 skip it.
    #[arg(long)]
    highres_scale: Option<f64>,

    #[arg(long)]
    highres_steps: Option<usize>,

    /// Strength of the second pass.
    #[arg(long)]
    highres_denoise: Option<f64>,

    /// Replaces the configured negative prompt; empty uses the canvas's own.
    #[arg(long)]
    negative_prompt: Option<String>,

    /// LoRA weights, absolute or relative to the configured lora folder.
    #[arg(long)]
    lora: Option<String>,

    #[arg(long)]
    lora_scale: Option<f64>,

    /// Denoise each region separately and blend by mask.
    #[arg(long)]
    composite: bool,

    /// Write the region color layout to this file.
    #[arg(long)]
    preview: Option<String>,
}

fn lora_path(lora: &str, folder: &Path) -> PathBuf {
    let path = PathBuf::from(lora);
    if path.is_absolute() || path.is_file() {
        path
    } else {
        folder.join(path)
    }
}

pub fn run(args: &RenderArgs, canvas: Canvas, studio: &mut Studio) -> Result<()> {
    let Some(checkpoint) = studio.checkpoint.clone() else {
        anyhow::bail!("render needs --checkpoint <sdxl directory or name under the checkpoint folder>");
    };
    let config = &studio.config;
    let mut request = RenderRequest::new(canvas, &config.render);
    request.seed = args.seed;
    request.width = args.width.unwrap_or(request.width);
    request.height = args.height.unwrap_or(request.height);
    request.num_samples = args.num_samples.unwrap_or(request.num_samples);
    request.steps = args.steps.unwrap_or(request.steps);
    request.cfg_scale = args.cfg_scale.unwrap_or(request.cfg_scale);
    request.highres_scale = args.highres_scale.unwrap_or(request.highres_scale);
    request.highres_steps = args.highres_steps.unwrap_or(request.highres_steps);
    request.highres_denoise = args.highres_denoise.unwrap_or(request.highres_denoise);
    if let Some(negative) = &args.negative_prompt {
        request.negative_prompt = negative.clone();
    }
    request.lora_selection = args.lora.as_deref().map(|l| lora_path(l, &config.folders.loras));
    request.lora_scale = args.lora_scale.unwrap_or(request.lora_scale);
    if args.composite {
        request.regional_mode = RegionalMode::Composite;
    }
    let (width, height) = request.validate()?;

    if let Some(preview) = &args.preview {
        let canvas = request.canvas.clone().at_resolution(width, height)?;
        render_to_grid(&canvas, width, height).color_image().save(preview)?;
        println!("layout preview written to {preview}");
    }

    let loader = SdxlLoader::new(studio.dtype, studio.use_flash_attn);
    let orchestrator = Orchestrator::new(
        Box::new(loader),
        CheckpointId::new(config.folders.checkpoint(&checkpoint)),
        &config.folders.outputs,
    );
    let output = orchestrator.run(&mut studio.registry, &request)?;

    println!("seed {}", output.seed);
    match &output.highres {
        HighresOutcome::Skipped => {}
        HighresOutcome::Applied => println!("highres pass applied"),
        HighresOutcome::Failed(reason) => println!("highres pass failed, kept base images: {reason}"),
    }
    for path in &output.paths {
        println!("{}", path.display());
    }
    Ok(())
}
