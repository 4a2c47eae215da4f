//! Seeded Gaussian noise for the sampler.
//!
//! One generator is created per render from the resolved seed and threaded
//! through both diffusion stages, so the base pass, the highres pass and every
//! ancestral draw come from a single reproducible stream. Draws follow the
//! MT19937 + Box-Muller scheme of `torch.randn` so a seed yields the same
//! starting latent as the reference sampler:
//!
//! - fewer than 16 values: 53-bit uniforms, pairs cached between calls
//! - 16 or more values: 24-bit uniforms in blocks of 16 (8 cos, then 8 sin)
//!
//! Noise is always produced on the CPU and then moved, so the stream does not
//! depend on the accelerator.

use candle::{DType, Device, Tensor};
use rand_mt::Mt;

use crate::Result;

#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    seed: u32,
    mt: Mt,
    spare: Option<f32>,
}

impl NoiseGenerator {
    /// Seeds from the low 32 bits, as `torch.manual_seed` does.
    pub fn new(seed: u64) -> Self {
        Self {
            seed: seed as u32,
            mt: Mt::new(seed as u32),
            spare: None,
        }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    fn uniform_f64(&mut self) -> f64 {
        let hi = self.mt.next_u32() as u64;
        let lo = self.mt.next_u32() as u64;
        ((hi << 32 | lo) & ((1 << 53) - 1)) as f64 / (1u64 << 53) as f64
    }

    fn uniform_f32(&mut self) -> f32 {
        (self.mt.next_u32() & ((1 << 24) - 1)) as f32 / (1u32 << 24) as f32
    }

    /// One standard normal draw.
    pub fn next_normal(&mut self) -> f32 {
        if let Some(spare) = self.spare.take() {
            return spare;
        }
        let u1 = self.uniform_f64();
        let u2 = self.uniform_f64();
        let radius = (-2.0 * (1.0 - u2).ln()).sqrt();
        let angle = std::f64::consts::TAU * u1;
        self.spare = Some((radius * angle.sin()) as f32);
        (radius * angle.cos()) as f32
    }

    fn fill_blocks(&mut self, count: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count / 16 {
            let mut u = [0f32; 16];
            for v in u.iter_mut() {
                *v = self.uniform_f32();
            }
            let mut block = [0f32; 16];
            for i in 0..8 {
                let radius = (-2.0 * (1.0 - u[i]).ln()).sqrt();
                let angle = std::f32::consts::TAU * u[8 + i];
                block[i] = radius * angle.cos();
                block[8 + i] = radius * angle.sin();
            }
            out.extend_from_slice(&block);
        }
        while out.len() < count {
            out.push(self.next_normal());
        }
        out
    }

    /// A tensor of standard normal values.
    pub fn randn(&mut self, shape: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
        let count: usize = shape.iter().product();
        let values = if count >= 16 {
            self.fill_blocks(count)
        } else {
            (0..count).map(|_| self.next_normal()).collect()
        };
        let noise = Tensor::from_vec(values, shape, &Device::Cpu)?;
        Ok(noise.to_device(device)?.to_dtype(dtype)?)
    }

    /// Noise shaped like `reference`, on its device and in its dtype.
    pub fn randn_like(&mut self, reference: &Tensor) -> Result<Tensor> {
        self.randn(reference.dims(), reference.device(), reference.dtype())
    }
}
