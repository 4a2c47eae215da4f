//! Diffusion render stage.
//!
//! Runs the guided denoising loop over a Karras schedule with the
//! DPM-Solver++(2M) update. The latent is returned as is; decoding to pixels
//! is the caller's job.

use candle::{DType, Tensor};
use serde::Deserialize;

use super::conditioning::{ConditioningBundle, RegionLayout};
use super::rng::NoiseGenerator;
use super::scheduler::{DpmSolverPlusPlus2M, NoiseSchedule};
use crate::{Error, Result};

/// What the backbone is conditioned on for one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct Conditioning<'a> {
    /// `(B, S, H)` cross-attention states.
    pub embeds: &'a Tensor,
    /// `(B, P)` pooled text embedding.
    pub pooled: &'a Tensor,
    /// Per-region layout, present on the positive branch only.
    pub layout: Option<&'a RegionLayout>,
    pub lora_scale: f64,
}

/// An epsilon-prediction backbone.
pub trait NoisePredictor {
    /// Predicts the noise in `x` (`(B, C, h, w)`, already scaled for the
    /// model) at the given discrete training timestep. Returns F32.
    fn predict(&self, x: &Tensor, timestep: f64, cond: &Conditioning<'_>) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Positive,
    Negative,
}

impl ConditioningBundle {
    pub fn branch(&self, branch: Branch) -> Conditioning<'_> {
        match branch {
            Branch::Positive => Conditioning {
                embeds: &self.positive_embeds,
                pooled: &self.positive_pooled,
                layout: Some(&self.layout),
                lora_scale: self.lora_scale,
            },
            Branch::Negative => Conditioning {
                embeds: &self.negative_embeds,
                pooled: &self.negative_pooled,
                layout: None,
                lora_scale: self.lora_scale,
            },
        }
    }
}

/// Classifier-free guidance: `neg + scale · (pos - neg)`.
pub fn apply_guidance(positive: &Tensor, negative: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    Ok((negative + ((positive - negative)? * guidance_scale)?)?)
}

/// How region prompts reach the backbone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionalMode {
    /// One area-weighted blend of all region prompts.
    #[default]
    Pooled,
    /// One backbone pass per region, composited with the region masks.
    Composite,
}

/// Composites per-region predictions by their latent masks.
///
/// Each region is predicted with its own prompt; the results are blended
/// with the region ownership masks, resized to the latent being denoised.
/// Costs one backbone pass per surviving region on the positive branch.
pub struct MaskedComposite<'a> {
    inner: &'a dyn NoisePredictor,
}

impl<'a> MaskedComposite<'a> {
    pub fn new(inner: &'a dyn NoisePredictor) -> Self {
        Self { inner }
    }
}

impl NoisePredictor for MaskedComposite<'_> {
    fn predict(&self, x: &Tensor, timestep: f64, cond: &Conditioning<'_>) -> Result<Tensor> {
        let Some(layout) = cond.layout.filter(|l| !l.is_empty()) else {
            return self.inner.predict(x, timestep, cond);
        };
        let (batch, _, h, w) = x.dims4()?;
        let mut total: Option<Tensor> = None;
        for r in 0..layout.len() {
            let embeds = layout.embeds.narrow(0, r, 1)?.repeat((batch, 1, 1))?;
            let region = Conditioning {
                embeds: &embeds,
                pooled: cond.pooled,
                layout: None,
                lora_scale: cond.lora_scale,
            };
            let eps = self.inner.predict(x, timestep, &region)?;
            let mask = layout
                .masks
                .narrow(0, r, 1)?
                .unsqueeze(0)?
                .to_dtype(DType::F32)?
                .upsample_nearest2d(h, w)?;
            let weighted = eps.broadcast_mul(&mask)?;
            total = Some(match total {
                Some(acc) => (acc + weighted)?,
                None => weighted,
            });
        }
        total.ok_or_else(|| Error::invalid("layout", "no regions"))
    }
}

/// Denoises `initial_latent` over `steps` model evaluations.
///
/// With `strength == 1` the supplied latent is ignored and sampling starts
/// from pure noise at the top of the schedule. With `strength < 1` the latent
/// is noised to an intermediate level, preserving its structure.
#[allow(clippy::too_many_arguments)]
pub fn render(
    predictor: &dyn NoisePredictor,
    schedule: &NoiseSchedule,
    initial_latent: &Tensor,
    strength: f64,
    steps: usize,
    bundle: &ConditioningBundle,
    guidance_scale: f64,
    rng: &mut NoiseGenerator,
) -> Result<Tensor> {
    let sigmas = schedule.sigmas(steps, strength)?;
    let batch = initial_latent.dims4()?.0;
    if batch != bundle.num_samples() {
        return Err(Error::invalid(
            "initial_latent",
            format!("batch {batch} does not match {} conditioned samples", bundle.num_samples()),
        ));
    }

    let init = initial_latent.to_dtype(DType::F32)?;
    let init = if strength >= 1.0 { init.zeros_like()? } else { init };
    let noise = rng.randn_like(&init)?;
    let mut x = (init + (noise * sigmas[0])?)?;

    let positive = bundle.branch(Branch::Positive);
    let negative = bundle.branch(Branch::Negative);
    let mut solver = DpmSolverPlusPlus2M::new(sigmas);
    while let Some(sigma) = solver.current_sigma() {
        let model_input = schedule.scale_model_input(&x, sigma)?;
        let timestep = schedule.timestep(sigma);
        let eps_pos = predictor.predict(&model_input, timestep, &positive)?;
        let eps_neg = predictor.predict(&model_input, timestep, &negative)?;
        let eps = apply_guidance(&eps_pos, &eps_neg, guidance_scale)?;
        let denoised = (&x - (eps * sigma)?)?;
        x = solver.step(&denoised, &x)?;
        tracing::debug!(step = solver.step_index(), sigma, timestep, "denoising step");
    }
    Ok(x)
}
