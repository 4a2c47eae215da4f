//! Canvas-to-conditioning compiler.
//!
//! Every surviving canvas region is encoded by both text encoders. The
//! sequence embeddings of the two encoders are concatenated on the hidden
//! axis and the second encoder's pooled output is kept. Region sequences are
//! then blended position by position, weighted by the fraction of the latent
//! each region owns after the painter's-algorithm composite:
//!
//! ```text
//! positive_embeds = Σ_r (area_r / Σ area) · embeds_r        (1, 77, H1 + H2)
//! ```
//!
//! Token order is preserved, so position `i` of the blended sequence still
//! lines up with position `i` of every region's prompt. The per-region
//! embeddings and latent masks are kept in [`RegionLayout`] for backbones that
//! composite regions spatially.

use std::path::Path;

use candle::{DType, Device, Tensor, D};

use super::canvas::{render_to_grid, Canvas};
use crate::{Error, Result};

/// Maximum CLIP sequence length, BOS and EOS included.
pub const MAX_TOKENS: usize = 77;

/// Spatial compression of the VAE.
pub const LATENT_FACTOR: usize = 8;

pub trait Tokenize {
    /// Token ids of `text`, without special tokens.
    fn ids(&self, text: &str) -> Result<Vec<u32>>;
    fn bos(&self) -> u32;
    fn eos(&self) -> u32;
    fn pad(&self) -> u32;
}

/// CLIP BPE tokenizer backed by `tokenizers`.
pub struct PromptTokenizer {
    inner: tokenizers::Tokenizer,
    bos: u32,
    eos: u32,
    pad: u32,
}

impl PromptTokenizer {
    pub const BOS: &'static str = "<|startoftext|>";
    pub const EOS: &'static str = "<|endoftext|>";

    pub fn new(inner: tokenizers::Tokenizer, pad_token: &str) -> Result<Self> {
        let id = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| Error::Tokenizer(format!("vocabulary has no `{token}`")))
        };
        Ok(Self {
            bos: id(Self::BOS)?,
            eos: id(Self::EOS)?,
            pad: id(pad_token)?,
            inner,
        })
    }

    pub fn from_file(path: impl AsRef<Path>, pad_token: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Self::new(inner, pad_token)
    }
}

impl Tokenize for PromptTokenizer {
    fn ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn bos(&self) -> u32 {
        self.bos
    }

    fn eos(&self) -> u32 {
        self.eos
    }

    fn pad(&self) -> u32 {
        self.pad
    }
}

/// Frames `ids` as one fixed-length CLIP sequence.
///
/// Overflow is dropped from the end, so the start of the prompt always
/// survives: `BOS, ids[..75], EOS, PAD...`.
pub fn frame_ids(tokenizer: &dyn Tokenize, ids: &[u32]) -> Vec<u32> {
    let keep = ids.len().min(MAX_TOKENS - 2);
    let mut out = Vec::with_capacity(MAX_TOKENS);
    out.push(tokenizer.bos());
    out.extend_from_slice(&ids[..keep]);
    out.push(tokenizer.eos());
    out.resize(MAX_TOKENS, tokenizer.pad());
    out
}

/// A frozen text encoder.
pub trait TextEncoder {
    /// Encodes `(1, 77)` token ids into sequence states `(1, 77, H)` and a
    /// pooled embedding `(1, P)`.
    fn encode(&self, ids: &Tensor, lora_scale: f64) -> Result<(Tensor, Tensor)>;
}

/// The two tokenizer/encoder pairs of a dual-encoder pipeline.
pub struct TextEncoders<'a> {
    pub tokenizer: &'a dyn Tokenize,
    pub encoder: &'a dyn TextEncoder,
    pub tokenizer_2: &'a dyn Tokenize,
    pub encoder_2: &'a dyn TextEncoder,
    pub device: &'a Device,
}

impl TextEncoders<'_> {
    fn ids(&self, tokenizer: &dyn Tokenize, text: &str) -> Result<Tensor> {
        let ids = tokenizer.ids(text).unwrap_or_else(|e| {
            tracing::warn!("encoding region as blank, tokenizer failed: {e}");
            Vec::new()
        });
        Ok(Tensor::new(frame_ids(tokenizer, &ids).as_slice(), self.device)?.unsqueeze(0)?)
    }

    /// Encodes one prompt: `(1, 77, H1 + H2)` sequence states and the
    /// second encoder's `(1, P)` pooled embedding.
    pub fn encode_prompt(&self, text: &str, lora_scale: f64) -> Result<(Tensor, Tensor)> {
        let (seq, _) = self
            .encoder
            .encode(&self.ids(self.tokenizer, text)?, lora_scale)?;
        let (seq_2, pooled) = self
            .encoder_2
            .encode(&self.ids(self.tokenizer_2, text)?, lora_scale)?;
        let seq = Tensor::cat(&[&seq, &seq_2.to_dtype(seq.dtype())?], D::Minus1)?;
        Ok((seq, pooled))
    }
}

/// Spatial side of the conditioning, kept per surviving region.
#[derive(Debug, Clone)]
pub struct RegionLayout {
    /// Canvas index of each surviving region, in paint order.
    pub region_indices: Vec<usize>,
    /// `(R, h, w)` fraction of each latent pixel owned by each region.
    pub masks: Tensor,
    /// `(R, 77, H)` sequence embeddings of each region.
    pub embeds: Tensor,
    /// Latent pixels owned by each region.
    pub areas: Vec<f32>,
}

impl RegionLayout {
    pub fn len(&self) -> usize {
        self.region_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region_indices.is_empty()
    }
}

/// Batched conditioning for one render.
#[derive(Debug, Clone)]
pub struct ConditioningBundle {
    pub positive_embeds: Tensor,
    pub positive_pooled: Tensor,
    pub negative_embeds: Tensor,
    pub negative_pooled: Tensor,
    pub layout: RegionLayout,
    pub lora_scale: f64,
}

impl ConditioningBundle {
    pub fn num_samples(&self) -> usize {
        self.positive_embeds.dims()[0]
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            positive_embeds: self.positive_embeds.to_dtype(dtype)?,
            positive_pooled: self.positive_pooled.to_dtype(dtype)?,
            negative_embeds: self.negative_embeds.to_dtype(dtype)?,
            negative_pooled: self.negative_pooled.to_dtype(dtype)?,
            layout: RegionLayout {
                masks: self.layout.masks.to_dtype(dtype)?,
                embeds: self.layout.embeds.to_dtype(dtype)?,
                ..self.layout.clone()
            },
            lora_scale: self.lora_scale,
        })
    }
}

fn broadcast_batch(t: &Tensor, num_samples: usize) -> Result<Tensor> {
    let mut reps = vec![1; t.rank()];
    reps[0] = num_samples;
    Ok(t.repeat(reps)?)
}

/// Compiles a canvas into batched conditioning.
///
/// `activation_text` (a LoRA trigger phrase) is prepended to every region's
/// prompt. The negative prompt is applied uniformly. Every sample of the
/// batch receives the same conditioning. Compilation is deterministic.
pub fn compile(
    canvas: &Canvas,
    negative_prompt: &str,
    lora_scale: f64,
    activation_text: Option<&str>,
    encoders: &TextEncoders<'_>,
    num_samples: usize,
) -> Result<ConditioningBundle> {
    if num_samples == 0 {
        return Err(Error::invalid("num_samples", "must be at least 1"));
    }
    let (latent_w, latent_h) = (canvas.width() / LATENT_FACTOR, canvas.height() / LATENT_FACTOR);
    let grid = render_to_grid(canvas, canvas.width(), canvas.height());
    let masks = grid.downsample_masks(LATENT_FACTOR)?;

    let mut region_indices = Vec::new();
    let mut areas = Vec::new();
    let mut kept_masks = Vec::new();
    for (index, mask) in masks.into_iter().enumerate() {
        let area: f32 = mask.iter().sum();
        if area > 0.0 {
            region_indices.push(index);
            areas.push(area);
            kept_masks.extend(mask);
        } else {
            tracing::debug!(region = index, "region covers no latent pixel, dropped");
        }
    }

    let activation = activation_text.map(str::trim).filter(|t| !t.is_empty());
    let mut seqs = Vec::with_capacity(region_indices.len());
    let mut pooled = None;
    for &index in &region_indices {
        let description = &canvas.regions()[index].description;
        let prompt = match activation {
            Some(trigger) => format!("{trigger} {description}"),
            None => description.clone(),
        };
        let (seq, region_pooled) = encoders.encode_prompt(&prompt, lora_scale)?;
        seqs.push(seq);
        pooled.get_or_insert(region_pooled);
    }
    let pooled = pooled.ok_or_else(|| Error::MalformedCanvas("canvas has no visible region".into()))?;

    let embeds = Tensor::cat(&seqs, 0)?;
    let total: f32 = areas.iter().sum();
    let weights: Vec<f32> = areas.iter().map(|a| a / total).collect();
    let weights = Tensor::from_vec(weights, (areas.len(), 1, 1), encoders.device)?.to_dtype(embeds.dtype())?;
    let positive = embeds.broadcast_mul(&weights)?.sum_keepdim(0)?;

    let (negative, negative_pooled) = encoders.encode_prompt(negative_prompt, lora_scale)?;
    let masks = Tensor::from_vec(kept_masks, (region_indices.len(), latent_h, latent_w), encoders.device)?;

    tracing::info!(
        regions = region_indices.len(),
        dropped = canvas.regions().len() - region_indices.len(),
        num_samples,
        "compiled conditioning"
    );
    Ok(ConditioningBundle {
        positive_embeds: broadcast_batch(&positive, num_samples)?,
        positive_pooled: broadcast_batch(&pooled, num_samples)?,
        negative_embeds: broadcast_batch(&negative, num_samples)?,
        negative_pooled: broadcast_batch(&negative_pooled, num_samples)?,
        layout: RegionLayout {
            region_indices,
            masks,
            embeds,
            areas,
        },
        lora_scale,
    })
}
