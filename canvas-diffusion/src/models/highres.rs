//! Highres refinement stage.
//!
//! Decoded images are upscaled without cropping, re-encoded, and denoised
//! again with `strength < 1` so the second pass adds detail while keeping the
//! base composition. The pass reuses the base render's conditioning and its
//! noise generator.

use candle::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;

use super::conditioning::ConditioningBundle;
use super::render::{self, MaskedComposite, NoisePredictor, RegionalMode};
use super::residency::{ComponentKind, ModelRegistry};
use super::rng::NoiseGenerator;
use super::scheduler::NoiseSchedule;
use crate::error::StageContext;
use crate::{Error, Result};

/// Scales within this distance of 1.0 skip the pass.
pub const HIGHRES_EPSILON: f64 = 0.05;

/// A VAE: pixels in `[-1, 1]` to scaled latents and back.
pub trait LatentCodec {
    /// `(B, 3, H, W)` pixels to `(B, C, H / 8, W / 8)` latents, scaling included.
    fn encode(&self, pixels: &Tensor) -> Result<Tensor>;
    /// Inverse of [`LatentCodec::encode`]; returns F32 pixels.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

pub fn should_refine(highres_scale: f64) -> bool {
    highres_scale > 1.0 + HIGHRES_EPSILON
}

/// Scaled size, each side rounded (ties to even) to a multiple of
/// `multiple`, never below one multiple.
pub fn target_size(width: usize, height: usize, scale: f64, multiple: usize) -> (usize, usize) {
    let side = |v: usize| {
        let units = (v as f64 * scale / multiple as f64).round_ties_even().max(1.0);
        units as usize * multiple
    };
    (side(width), side(height))
}

/// Resizes to exactly `width` × `height` with Lanczos filtering; nothing is cropped.
pub fn resize_without_crop(image: &RgbImage, width: usize, height: usize) -> RgbImage {
    image::imageops::resize(image, width as u32, height as u32, FilterType::Lanczos3)
}

/// `(B, 3, H, W)` pixels in `[-1, 1]` to 8-bit images.
pub fn tensor_to_images(pixels: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch, channels, height, width) = pixels.dims4()?;
    if channels != 3 {
        return Err(Error::invalid("pixels", format!("expected 3 channels, got {channels}")));
    }
    let bytes = ((pixels.to_dtype(DType::F32)? * 127.5)? + 127.5)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?
        .to_device(&Device::Cpu)?;
    (0..batch)
        .map(|b| {
            let raw = bytes.get(b)?.flatten_all()?.to_vec1::<u8>()?;
            RgbImage::from_raw(width as u32, height as u32, raw)
                .ok_or_else(|| Error::invalid("pixels", "buffer does not match image size"))
        })
        .collect()
}

/// 8-bit images of equal size to `(B, 3, H, W)` F32 pixels in `[-1, 1]`.
pub fn images_to_tensor(images: &[RgbImage], device: &Device) -> Result<Tensor> {
    let Some(first) = images.first() else {
        return Err(Error::invalid("images", "empty batch"));
    };
    let (width, height) = first.dimensions();
    let mut raw = Vec::with_capacity(images.len() * (width * height * 3) as usize);
    for image in images {
        if image.dimensions() != (width, height) {
            return Err(Error::invalid("images", "batch images differ in size"));
        }
        raw.extend_from_slice(image.as_raw());
    }
    let pixels = Tensor::from_vec(raw, (images.len(), height as usize, width as usize, 3), device)?
        .permute((0, 3, 1, 2))?
        .to_dtype(DType::F32)?;
    Ok(((pixels / 127.5)? - 1.0)?)
}

/// Places the UNet and runs the render stage.
#[allow(clippy::too_many_arguments)]
pub(crate) fn denoise(
    registry: &mut ModelRegistry,
    schedule: &NoiseSchedule,
    initial_latent: &Tensor,
    strength: f64,
    steps: usize,
    bundle: &ConditioningBundle,
    guidance_scale: f64,
    mode: RegionalMode,
    rng: &mut NoiseGenerator,
    stage: &'static str,
) -> Result<Tensor> {
    registry.ensure_resident(&[ComponentKind::Unet])?;
    let unet = registry.pipeline()?.unet.get()?;
    let composite;
    let predictor: &dyn NoisePredictor = match mode {
        RegionalMode::Pooled => &**unet,
        RegionalMode::Composite => {
            composite = MaskedComposite::new(&**unet);
            &composite
        }
    };
    render::render(
        predictor,
        schedule,
        initial_latent,
        strength,
        steps,
        bundle,
        guidance_scale,
        rng,
    )
    .stage(stage)
}

/// Places the VAE and decodes latents to images.
pub(crate) fn decode(registry: &mut ModelRegistry, latents: &Tensor, stage: &'static str) -> Result<Vec<RgbImage>> {
    registry.ensure_resident(&[ComponentKind::Vae])?;
    let vae = registry.pipeline()?.vae.get()?;
    vae.decode(latents)
        .and_then(|pixels| tensor_to_images(&pixels))
        .stage(stage)
}

/// Places the VAE and encodes images to latents.
pub(crate) fn encode(registry: &mut ModelRegistry, images: &[RgbImage], stage: &'static str) -> Result<Tensor> {
    registry.ensure_resident(&[ComponentKind::Vae])?;
    let device = registry.device().clone();
    let vae = registry.pipeline()?.vae.get()?;
    images_to_tensor(images, &device)
        .and_then(|pixels| vae.encode(&pixels))
        .stage(stage)
}

/// Parameters of the highres pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighresParams {
    pub scale: f64,
    pub steps: usize,
    /// Strength of the second pass, in `(0, 1]`.
    pub denoise: f64,
}

/// Everything the highres pass shares with the base render.
pub struct RefineContext<'a> {
    pub registry: &'a mut ModelRegistry,
    pub schedule: &'a NoiseSchedule,
    pub bundle: &'a ConditioningBundle,
    pub guidance_scale: f64,
    pub mode: RegionalMode,
    pub rng: &'a mut NoiseGenerator,
}

/// Upscales, re-encodes, partially re-renders and decodes `images`.
pub fn refine(
    ctx: &mut RefineContext<'_>,
    images: &[RgbImage],
    params: &HighresParams,
    target_multiple_of: usize,
) -> Result<Vec<RgbImage>> {
    let Some(first) = images.first() else {
        return Ok(Vec::new());
    };
    let (width, height) = (first.width() as usize, first.height() as usize);
    let (target_w, target_h) = target_size(width, height, params.scale, target_multiple_of);
    tracing::info!("highres pass {width}x{height} -> {target_w}x{target_h}");

    let resized: Vec<RgbImage> = images
        .iter()
        .map(|image| resize_without_crop(image, target_w, target_h))
        .collect();
    let latents = encode(ctx.registry, &resized, "highres-encode")?;
    let latents = denoise(
        ctx.registry,
        ctx.schedule,
        &latents,
        params.denoise,
        params.steps,
        ctx.bundle,
        ctx.guidance_scale,
        ctx.mode,
        ctx.rng,
        "highres-render",
    )?;
    decode(ctx.registry, &latents, "highres-decode")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refine_threshold() {
        assert!(!should_refine(1.0));
        assert!(!should_refine(1.04));
        assert!(!should_refine(1.05));
        assert!(should_refine(1.06));
        assert!(should_refine(2.0));
    }

    #[test]
    fn target_sizes_round_to_64() {
        assert_eq!(target_size(1920, 1024, 1.5, 64), (2880, 1536));
        assert_eq!(target_size(1920, 1088, 1.5, 64), (2880, 1664));
        // 512 · 1.0625 / 64 = 8.5 rounds to even.
        assert_eq!(target_size(512, 512, 1.0625, 64), (512, 512));
        assert_eq!(target_size(64, 64, 0.1, 64), (64, 64));
    }

    #[test]
    fn pixel_conversion() -> Result<()> {
        let device = Device::Cpu;
        let pixels = Tensor::new(&[-1f32, 0.0, 1.0, 2.0], &device)?
            .reshape((1, 1, 1, 4))?
            .repeat((1, 3, 2, 1))?;
        let images = tensor_to_images(&pixels)?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].dimensions(), (4, 2));
        let row: Vec<u8> = (0..4).map(|x| images[0].get_pixel(x, 1).0[0]).collect();
        assert_eq!(row, vec![0, 127, 255, 255]);

        let back = images_to_tensor(&images, &device)?;
        assert_eq!(back.dims(), &[1, 3, 2, 4]);
        let values = back.get(0)?.get(2)?.get(0)?.to_vec1::<f32>()?;
        assert_eq!(values[0], -1.0);
        assert_eq!(values[2], 1.0);
        Ok(())
    }

    #[test]
    fn resize_keeps_the_whole_frame() {
        let mut image = RgbImage::new(64, 32);
        for x in 0..64 {
            for y in 0..32 {
                image.put_pixel(x, y, image::Rgb([200, 10, 10]));
            }
        }
        let resized = resize_without_crop(&image, 128, 128);
        assert_eq!(resized.dimensions(), (128, 128));
        assert_eq!(resized.get_pixel(127, 127).0, [200, 10, 10]);
    }

    #[test]
    fn mixed_sizes_are_rejected() {
        let images = [RgbImage::new(8, 8), RgbImage::new(8, 16)];
        assert!(images_to_tensor(&images, &Device::Cpu).is_err());
        assert!(images_to_tensor(&[], &Device::Cpu).is_err());
    }
}
