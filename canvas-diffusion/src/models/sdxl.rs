//! SDXL and quantized Llama backends.
//!
//! Thin adapters from `candle_transformers` models to the studio's stage
//! traits, and a [`PipelineLoader`] for checkpoints stored in the diffusers
//! directory layout:
//!
//! ```text
//! <checkpoint>/
//!   tokenizer/tokenizer.json       tokenizer_2/tokenizer.json
//!   text_encoder/model.safetensors text_encoder_2/model.safetensors
//!   unet/diffusion_pytorch_model.safetensors
//!   vae/diffusion_pytorch_model.safetensors
//! ```

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use candle::quantized::gguf_file;
use candle::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::quantized_llama;
use candle_transformers::models::stable_diffusion::{
    clip,
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
};

use super::chat::CausalLm;
use super::conditioning::{PromptTokenizer, TextEncoder, Tokenize};
use super::highres::LatentCodec;
use super::lora::LoraSelection;
use super::pipeline::{LATENT_CHANNELS, REGIONAL_PIPELINE};
use super::render::{Conditioning, NoisePredictor};
use super::residency::{
    CheckpointId, Component, ComponentKind, HostWeights, LoadedPipeline, PipelineLoader, SharedLm,
    Stager,
};
use crate::{Error, Result};

/// Latent scaling factor of the SDXL VAE.
pub const SDXL_VAE_SCALE: f64 = 0.13025;

/// Padding token of the second SDXL tokenizer.
pub const SDXL_PAD_TOKEN_2: &str = "!";

/// Log-variance that makes the posterior standard deviation exactly zero.
const LOGVAR_FLOOR: f64 = -1e4;

// https://huggingface.co/stabilityai/stable-diffusion-xl-base-1.0/blob/main/unet/config.json
pub fn sdxl_unet_config(sliced_attention_size: Option<usize>) -> UNet2DConditionModelConfig {
    let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };
    UNet2DConditionModelConfig {
        blocks: vec![bc(320, None, 5), bc(640, Some(2), 10), bc(1280, Some(10), 20)],
        center_input_sample: false,
        cross_attention_dim: 2048,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size,
        use_linear_projection: true,
    }
}

// https://huggingface.co/stabilityai/stable-diffusion-xl-base-1.0/blob/main/vae/config.json
pub fn sdxl_vae_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: LATENT_CHANNELS,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// CLIP text transformer returning its last hidden state and the state at the
/// first end-of-text token as the pooled embedding.
pub struct ClipEncoder {
    model: clip::ClipTextTransformer,
    eos_token: u32,
}

impl ClipEncoder {
    pub fn new(model: clip::ClipTextTransformer, eos_token: u32) -> Self {
        Self { model, eos_token }
    }
}

impl TextEncoder for ClipEncoder {
    fn encode(&self, ids: &Tensor, _lora_scale: f64) -> Result<(Tensor, Tensor)> {
        let hidden = self.model.forward(ids)?;
        let row = ids.i(0)?.to_vec1::<u32>()?;
        let eos = row
            .iter()
            .position(|&t| t == self.eos_token)
            .unwrap_or(row.len().saturating_sub(1));
        let pooled = hidden.i((.., eos, ..))?.contiguous()?;
        Ok((hidden, pooled))
    }
}

/// SDXL UNet as an epsilon predictor. Output is always F32.
pub struct SdxlUnet {
    model: UNet2DConditionModel,
    dtype: DType,
}

impl SdxlUnet {
    pub fn new(model: UNet2DConditionModel, dtype: DType) -> Self {
        Self { model, dtype }
    }
}

impl NoisePredictor for SdxlUnet {
    fn predict(&self, x: &Tensor, timestep: f64, cond: &Conditioning<'_>) -> Result<Tensor> {
        let x = x.to_dtype(self.dtype)?;
        let embeds = cond.embeds.to_dtype(self.dtype)?;
        Ok(self.model.forward(&x, timestep, &embeds)?.to_dtype(DType::F32)?)
    }
}

/// SDXL VAE, run in F32.
///
/// Encoding returns the mode of the latent posterior, so the same pixels
/// always give the same latents and the only noise in a render comes from the
/// seeded sampler.
pub struct SdxlVae {
    model: AutoEncoderKL,
}

impl SdxlVae {
    pub fn from_tensors(
        weights: &HashMap<String, Tensor>,
        config: AutoEncoderKLConfig,
        device: &Device,
    ) -> Result<Self> {
        let weights = pin_posterior_mode(weights, &config)?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, device);
        Ok(Self {
            model: AutoEncoderKL::new(vb, 3, 3, config)?,
        })
    }
}

/// Rewrites the layer producing the posterior moments so that its
/// log-variance half is the constant [`LOGVAR_FLOOR`]. candle's
/// `DiagonalGaussianDistribution::sample` then returns the mean exactly.
fn pin_posterior_mode(
    weights: &HashMap<String, Tensor>,
    config: &AutoEncoderKLConfig,
) -> Result<HashMap<String, Tensor>> {
    let prefix = if config.use_quant_conv {
        "quant_conv"
    } else {
        "encoder.conv_out"
    };
    let latent = config.latent_channels;
    let mut pinned = weights.clone();
    for (suffix, fill) in [("weight", 0.0), ("bias", LOGVAR_FLOOR)] {
        let name = format!("{prefix}.{suffix}");
        let moments = weights
            .get(&name)
            .ok_or_else(|| Error::invalid("vae", format!("missing tensor {name}")))?;
        let mean = moments.narrow(0, 0, latent)?;
        let logvar = (mean.zeros_like()? + fill)?;
        pinned.insert(name, Tensor::cat(&[&mean, &logvar], 0)?);
    }
    Ok(pinned)
}

impl LatentCodec for SdxlVae {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let posterior = self.model.encode(&pixels.to_dtype(DType::F32)?)?;
        Ok((posterior.sample()? * SDXL_VAE_SCALE)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents.to_dtype(DType::F32)? / SDXL_VAE_SCALE)?;
        Ok(self.model.decode(&latents)?)
    }
}

/// Weight files of a diffusers-layout SDXL checkpoint.
#[derive(Debug, Clone)]
pub struct SdxlFiles {
    pub tokenizer: PathBuf,
    pub tokenizer_2: PathBuf,
    pub text_encoder: PathBuf,
    pub text_encoder_2: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl SdxlFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            tokenizer: dir.join("tokenizer").join("tokenizer.json"),
            tokenizer_2: dir.join("tokenizer_2").join("tokenizer.json"),
            text_encoder: dir.join("text_encoder").join("model.safetensors"),
            text_encoder_2: dir.join("text_encoder_2").join("model.safetensors"),
            unet: dir.join("unet").join("diffusion_pytorch_model.safetensors"),
            vae: dir.join("vae").join("diffusion_pytorch_model.safetensors"),
        }
    }

    /// The first expected file that is missing.
    pub fn missing(&self) -> Option<&Path> {
        [
            &self.tokenizer,
            &self.tokenizer_2,
            &self.text_encoder,
            &self.text_encoder_2,
            &self.unet,
            &self.vae,
        ]
        .into_iter()
        .find(|p| !p.is_file())
        .map(PathBuf::as_path)
    }
}

fn footprint(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Reads a safetensors file into CPU tensors.
fn stage_safetensors(path: PathBuf) -> Stager {
    Box::new(move || Ok(HostWeights::Tensors(candle::safetensors::load(&path, &Device::Cpu)?)))
}

/// Loads SDXL checkpoints as regional pipelines.
#[derive(Clone)]
pub struct SdxlLoader {
    clip: clip::Config,
    clip2: clip::Config,
    unet: UNet2DConditionModelConfig,
    vae: AutoEncoderKLConfig,
    dtype: DType,
    use_flash_attn: bool,
}

impl SdxlLoader {
    pub fn new(dtype: DType, use_flash_attn: bool) -> Self {
        Self {
            clip: clip::Config::sdxl(),
            clip2: clip::Config::sdxl2(),
            unet: sdxl_unet_config(None),
            vae: sdxl_vae_config(),
            dtype,
            use_flash_attn,
        }
    }

    fn clip_component(
        &self,
        kind: ComponentKind,
        clip_config: clip::Config,
        weights: PathBuf,
        eos_token: u32,
    ) -> Component<Box<dyn TextEncoder>> {
        let dtype = self.dtype;
        Component::new(
            kind,
            dtype,
            footprint(&weights),
            stage_safetensors(weights),
            Box::new(move |staged: &HostWeights, device: &Device| -> Result<Box<dyn TextEncoder>> {
                let vb = VarBuilder::from_tensors(staged.tensors()?.clone(), dtype, device);
                let model = clip::ClipTextTransformer::new(vb, &clip_config)?;
                Ok(Box::new(ClipEncoder::new(model, eos_token)) as Box<dyn TextEncoder>)
            }),
        )
    }
}

impl PipelineLoader for SdxlLoader {
    fn load(&self, id: &CheckpointId) -> Result<LoadedPipeline> {
        let files = SdxlFiles::in_dir(&id.path);
        if let Some(missing) = files.missing() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("checkpoint {} has no {}", id.name, missing.display()),
            )));
        }
        let tokenizer = PromptTokenizer::from_file(&files.tokenizer, PromptTokenizer::EOS)?;
        let tokenizer_2 = PromptTokenizer::from_file(&files.tokenizer_2, SDXL_PAD_TOKEN_2)?;

        let text_encoder = self.clip_component(
            ComponentKind::TextEncoder,
            self.clip.clone(),
            files.text_encoder.clone(),
            tokenizer.eos(),
        );
        let text_encoder_2 = self.clip_component(
            ComponentKind::TextEncoder2,
            self.clip2.clone(),
            files.text_encoder_2.clone(),
            tokenizer_2.eos(),
        );

        let (config, dtype, flash) = (self.unet.clone(), self.dtype, self.use_flash_attn);
        let unet = Component::new(
            ComponentKind::Unet,
            dtype,
            footprint(&files.unet),
            stage_safetensors(files.unet.clone()),
            Box::new(move |staged: &HostWeights, device: &Device| -> Result<Box<dyn NoisePredictor>> {
                let vb = VarBuilder::from_tensors(staged.tensors()?.clone(), dtype, device);
                let model = UNet2DConditionModel::new(vb, LATENT_CHANNELS, LATENT_CHANNELS, flash, config.clone())?;
                Ok(Box::new(SdxlUnet::new(model, dtype)) as Box<dyn NoisePredictor>)
            }),
        );

        let config = self.vae.clone();
        let vae = Component::new(
            ComponentKind::Vae,
            DType::F32,
            footprint(&files.vae),
            stage_safetensors(files.vae.clone()),
            Box::new(move |staged: &HostWeights, device: &Device| -> Result<Box<dyn LatentCodec>> {
                let vae = SdxlVae::from_tensors(staged.tensors()?, config.clone(), device)?;
                Ok(Box::new(vae) as Box<dyn LatentCodec>)
            }),
        );

        Ok(LoadedPipeline {
            id: id.clone(),
            kind: REGIONAL_PIPELINE,
            tokenizer: Box::new(tokenizer),
            tokenizer_2: Box::new(tokenizer_2),
            text_encoder,
            text_encoder_2,
            unet,
            vae,
            lora: None,
        })
    }

    fn apply_lora(&self, pipeline: &mut LoadedPipeline, lora: Option<LoraSelection>) -> Result<()> {
        if let Some(lora) = &lora {
            tracing::warn!(
                "lora {} selected but its weights are not merged into the unet; only its activation text is used",
                lora.path.display()
            );
        }
        pipeline.lora = lora;
        Ok(())
    }
}

/// Llama-family chat model from GGUF weights.
pub struct QuantizedLlama {
    model: quantized_llama::ModelWeights,
    device: Device,
}

impl QuantizedLlama {
    /// Builds the model from an in-memory GGUF file.
    pub fn from_gguf_bytes(bytes: &[u8], device: &Device) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let content = gguf_file::Content::read(&mut reader)?;
        let model = quantized_llama::ModelWeights::from_gguf(content, &mut reader, device)?;
        Ok(Self {
            model,
            device: device.clone(),
        })
    }
}

impl CausalLm for QuantizedLlama {
    fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&input, index_pos)?.squeeze(0)?)
    }
}

/// Registry component for a GGUF chat model.
pub fn llm_component(weights: PathBuf) -> Component<SharedLm> {
    Component::new(
        ComponentKind::Llm,
        DType::F32,
        footprint(&weights),
        Box::new(move || Ok(HostWeights::Bytes(std::fs::read(&weights)?))),
        Box::new(|staged: &HostWeights, device: &Device| -> Result<SharedLm> {
            let lm: Box<dyn CausalLm + Send> = Box::new(QuantizedLlama::from_gguf_bytes(staged.bytes()?, device)?);
            Ok(Arc::new(Mutex::new(lm)))
        }),
    )
}
