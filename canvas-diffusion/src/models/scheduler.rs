//! Karras noise schedule and the DPM-Solver++(2M) sampler.
//!
//! The backbone is treated as an epsilon predictor over the discrete
//! scaled-linear schedule it was trained on. Sampling happens in the
//! continuous sigma parameterization:
//!
//! ```text
//! alpha_bar_t = Π (1 - beta_i)          beta = linspace(√0.00085, √0.012, 1000)²
//! sigma_t     = √((1 - alpha_bar_t) / alpha_bar_t)
//! x_sigma     = x_0 + sigma · noise
//! ```
//!
//! At each step the model sees `x / √(sigma² + 1)` together with the discrete
//! timestep whose log-sigma is nearest, and the denoised estimate is
//! `x - eps · sigma`.
//!
//! # Partial denoising
//!
//! For `strength < 1` a Karras schedule of `floor(steps / strength)` levels is
//! built and only its last `steps + 1` sigmas are kept, so the pass starts at
//! an intermediate noise level and still runs exactly `steps` model calls.

use candle::Tensor;
use serde::Deserialize;

use crate::{Error, Result};

/// Training schedule of the backbone.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    /// Karras spacing exponent.
    #[serde(default = "default_rho")]
    pub rho: f64,
}

fn default_num_train_timesteps() -> usize {
    1000
}
fn default_beta_start() -> f64 {
    0.00085
}
fn default_beta_end() -> f64 {
    0.012
}
fn default_rho() -> f64 {
    7.0
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            rho: default_rho(),
        }
    }
}

/// Sigma table of a discrete epsilon-prediction model.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    log_sigmas: Vec<f64>,
    sigma_min: f64,
    sigma_max: f64,
    rho: f64,
}

impl NoiseSchedule {
    pub fn new(config: &ScheduleConfig) -> Self {
        let n = config.num_train_timesteps;
        let (start, end) = (config.beta_start.sqrt(), config.beta_end.sqrt());
        let mut alpha_bar = 1.0;
        let log_sigmas: Vec<f64> = (0..n)
            .map(|i| {
                let beta = (start + (end - start) * i as f64 / (n - 1).max(1) as f64).powi(2);
                alpha_bar *= 1.0 - beta;
                ((1.0 - alpha_bar) / alpha_bar).sqrt().ln()
            })
            .collect();
        Self {
            sigma_min: log_sigmas.first().map_or(0.0, |l| l.exp()),
            sigma_max: log_sigmas.last().map_or(0.0, |l| l.exp()),
            log_sigmas,
            rho: config.rho,
        }
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigma_min
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigma_max
    }

    /// `n` Karras-spaced sigmas from `sigma_max` to `sigma_min`, then `0`.
    pub fn karras(&self, n: usize) -> Vec<f64> {
        let min_inv_rho = self.sigma_min.powf(1.0 / self.rho);
        let max_inv_rho = self.sigma_max.powf(1.0 / self.rho);
        let mut sigmas: Vec<f64> = (0..n)
            .map(|i| {
                let ramp = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
                (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(self.rho)
            })
            .collect();
        sigmas.push(0.0);
        sigmas
    }

    /// The `steps + 1` sigmas of a pass that denoises `strength` of the way.
    pub fn sigmas(&self, steps: usize, strength: f64) -> Result<Vec<f64>> {
        if steps == 0 {
            return Err(Error::InvalidStepCount(steps));
        }
        if !(strength > 0.0 && strength <= 1.0) {
            return Err(Error::invalid("strength", format!("{strength} is outside (0, 1]")));
        }
        let total = ((steps as f64 / strength) as usize).max(steps);
        let sigmas = self.karras(total);
        Ok(sigmas[sigmas.len() - (steps + 1)..].to_vec())
    }

    /// Discrete training timestep nearest to `sigma` in log space.
    pub fn timestep(&self, sigma: f64) -> f64 {
        let log_sigma = sigma.ln();
        let mut best = (0, f64::INFINITY);
        for (i, l) in self.log_sigmas.iter().enumerate() {
            let distance = (log_sigma - l).abs();
            if distance < best.1 {
                best = (i, distance);
            }
        }
        best.0 as f64
    }

    /// Scales a noisy latent to unit variance for the backbone.
    pub fn scale_model_input(&self, x: &Tensor, sigma: f64) -> Result<Tensor> {
        Ok((x / (sigma * sigma + 1.0).sqrt())?)
    }
}

/// Second-order multistep DPM-Solver++ over a fixed sigma sequence.
///
/// # Example
///
/// ```ignore
/// let mut solver = DpmSolverPlusPlus2M::new(schedule.sigmas(steps, 1.0)?);
/// while let Some(sigma) = solver.current_sigma() {
///     let denoised = model(&x, sigma)?;
///     x = solver.step(&denoised, &x)?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DpmSolverPlusPlus2M {
    sigmas: Vec<f64>,
    step_index: usize,
    previous: Option<Tensor>,
}

impl DpmSolverPlusPlus2M {
    pub fn new(sigmas: Vec<f64>) -> Self {
        Self {
            sigmas,
            step_index: 0,
            previous: None,
        }
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn num_steps(&self) -> usize {
        self.sigmas.len().saturating_sub(1)
    }

    /// Noise level of the next step, `None` once the sequence is exhausted.
    pub fn current_sigma(&self) -> Option<f64> {
        (self.step_index < self.num_steps()).then(|| self.sigmas[self.step_index])
    }

    /// Advances `x` from the current sigma to the next using the denoised
    /// estimate at the current sigma.
    pub fn step(&mut self, denoised: &Tensor, x: &Tensor) -> Result<Tensor> {
        let i = self.step_index;
        let (sigma, sigma_next) = (self.sigmas[i], self.sigmas[i + 1]);
        let next = if sigma_next == 0.0 {
            denoised.clone()
        } else {
            let t = -sigma.ln();
            let h = -sigma_next.ln() - t;
            let target = match (&self.previous, i) {
                (Some(previous), i) if i > 0 => {
                    let h_last = t + self.sigmas[i - 1].ln();
                    let r = h_last / h;
                    ((denoised * (1.0 + 1.0 / (2.0 * r)))? - (previous * (1.0 / (2.0 * r)))?)?
                }
                _ => denoised.clone(),
            };
            ((x * (sigma_next / sigma))? - (target * (-h).exp_m1())?)?
        };
        self.previous = Some(denoised.clone());
        self.step_index += 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn schedule() -> NoiseSchedule {
        NoiseSchedule::new(&ScheduleConfig::default())
    }

    #[test]
    fn sigma_table_endpoints() {
        let s = schedule();
        assert!((s.sigma_min() - 0.029_167).abs() < 1e-4, "{}", s.sigma_min());
        assert!((s.sigma_max() - 14.614_64).abs() < 1e-3, "{}", s.sigma_max());
    }

    #[test]
    fn karras_is_decreasing_and_ends_at_zero() {
        let sigmas = schedule().karras(20);
        assert_eq!(sigmas.len(), 21);
        assert!((sigmas[0] - schedule().sigma_max()).abs() < 1e-9);
        assert!((sigmas[19] - schedule().sigma_min()).abs() < 1e-9);
        assert_eq!(sigmas[20], 0.0);
        assert!(sigmas.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn strength_keeps_the_tail() -> Result<()> {
        let s = schedule();
        let full = s.sigmas(20, 1.0)?;
        assert_eq!(full, s.karras(20));

        let partial = s.sigmas(20, 0.4)?;
        assert_eq!(partial.len(), 21);
        assert_eq!(partial, s.karras(50)[30..].to_vec());
        assert!(partial[0] < s.sigma_max());

        // floor(3 / 0.7) = 4 levels.
        assert_eq!(s.sigmas(3, 0.7)?, s.karras(4)[1..].to_vec());
        Ok(())
    }

    #[test]
    fn rejects_bad_arguments() {
        let s = schedule();
        assert!(matches!(s.sigmas(0, 1.0), Err(Error::InvalidStepCount(0))));
        assert!(s.sigmas(10, 0.0).is_err());
        assert!(s.sigmas(10, 1.5).is_err());
        assert!(s.sigmas(10, f64::NAN).is_err());
    }

    #[test]
    fn timestep_lookup() {
        let s = schedule();
        assert_eq!(s.timestep(s.sigma_max()), 999.0);
        assert_eq!(s.timestep(s.sigma_min()), 0.0);
        assert_eq!(s.timestep(1e-6), 0.0);
    }

    #[test]
    fn first_step_is_first_order() -> Result<()> {
        let device = Device::Cpu;
        let mut solver = DpmSolverPlusPlus2M::new(vec![2.0, 1.0, 0.0]);
        let x = Tensor::full(4f32, (1, 2), &device)?;
        let denoised = Tensor::full(1f32, (1, 2), &device)?;

        let x1 = solver.step(&denoised, &x)?;
        // (σ'/σ)·x - expm1(-h)·d with h = ln 2: 0.5·4 + 0.5·1
        let got = x1.to_vec2::<f32>()?;
        assert!((got[0][0] - 2.5).abs() < 1e-6);
        assert_eq!(solver.current_sigma(), Some(1.0));

        let x2 = solver.step(&denoised, &x1)?;
        assert_eq!(x2.to_vec2::<f32>()?, denoised.to_vec2::<f32>()?);
        assert_eq!(solver.current_sigma(), None);
        Ok(())
    }

    #[test]
    fn second_order_uses_history() -> Result<()> {
        let device = Device::Cpu;
        let sigmas = vec![4.0, 2.0, 1.0, 0.0];
        let mut solver = DpmSolverPlusPlus2M::new(sigmas);
        let x = Tensor::zeros((1, 1), DType::F32, &device)?;
        let d0 = Tensor::full(1f32, (1, 1), &device)?;
        let d1 = Tensor::full(3f32, (1, 1), &device)?;
        let x = solver.step(&d0, &x)?;
        let x = solver.step(&d1, &x)?;
        // x after step 1: 0.5. h = h_last = ln 2, r = 1: target = 1.5·3 - 0.5·1 = 4.
        let expected = 0.5 * 0.5 + 0.5 * 4.0;
        assert!((x.to_vec2::<f32>()?[0][0] - expected).abs() < 1e-6);
        Ok(())
    }
}
