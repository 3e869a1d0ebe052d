//! Gaussian diffusion schedule and DDIM sampling steps.
//!
//! ## Forward process
//!
//! `x_t = √ᾱ_t · x_0 + √(1 − ᾱ_t) · ε`, with `ᾱ_t = Π_{s ≤ t} (1 − β_s)`.
//!
//! The denoiser predicts `ε` in the first `in_channels` output channels (the
//! remaining half carries the variance prediction, unused by DDIM).
//!
//! ## DDIM step (η = 0)
//!
//! ```text
//! x̂_0    = (x_t − √(1 − ᾱ_t) · ε) / √ᾱ_t
//! x_prev = √ᾱ_prev · x̂_0 + √(1 − ᾱ_prev) · ε
//! ```

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Beta schedule family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear betas, rescaled so any step count spans the same noise range.
    Linear,
    /// Squared-cosine ᾱ schedule.
    Cosine,
}

/// Schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps.
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_schedule: default_beta_schedule(),
        }
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::Linear
}

/// Betas for `config`.
pub fn betas(config: &SchedulerConfig) -> Vec<f64> {
    let n = config.num_train_timesteps;
    match config.beta_schedule {
        BetaSchedule::Linear => {
            let scale = 1000.0 / n as f64;
            let start = scale * 0.0001;
            let end = scale * 0.02;
            (0..n)
                .map(|i| start + (end - start) * i as f64 / (n - 1).max(1) as f64)
                .collect()
        }
        BetaSchedule::Cosine => {
            let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..n)
                .map(|i| {
                    let t1 = i as f64 / n as f64;
                    let t2 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                })
                .collect()
        }
    }
}

/// Precomputed Gaussian diffusion coefficients.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    alphas_cumprod: Vec<f64>,
}

impl GaussianDiffusion {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        if config.num_train_timesteps == 0 {
            return Err(Error::Config("num_train_timesteps must be > 0".into()));
        }
        let betas = betas(config);
        if let Some((t, beta)) = betas
            .iter()
            .enumerate()
            .find(|(_, beta)| !(**beta > 0.0 && **beta <= 1.0))
        {
            return Err(Error::Config(format!(
                "beta {beta} at timestep {t} outside (0, 1]; {} timesteps is too few for the {:?} schedule",
                config.num_train_timesteps, config.beta_schedule
            )));
        }
        let mut acc = 1.0;
        let alphas_cumprod = betas
            .into_iter()
            .map(|beta| {
                acc *= 1.0 - beta;
                acc
            })
            .collect();
        Ok(Self { alphas_cumprod })
    }

    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn alpha_bar(&self, t: usize) -> Result<f64> {
        self.alphas_cumprod.get(t).copied().ok_or_else(|| {
            Error::Config(format!(
                "timestep {t} outside schedule of {}",
                self.alphas_cumprod.len()
            ))
        })
    }

    /// Noise `x0` to per-element timesteps `t` (one per batch element).
    pub fn q_sample(&self, x0: &Tensor, t: &[usize], noise: &Tensor) -> Result<Tensor> {
        let batch = x0.dim(0)?;
        if t.len() != batch {
            return Err(Error::Config(format!(
                "{} timesteps for a batch of {batch}",
                t.len()
            )));
        }
        let mut signal = Vec::with_capacity(batch);
        let mut sigma = Vec::with_capacity(batch);
        for &step in t {
            let ab = self.alpha_bar(step)?;
            signal.push(ab.sqrt() as f32);
            sigma.push((1.0 - ab).sqrt() as f32);
        }
        let dev = x0.device();
        let signal = Tensor::from_vec(signal, (batch, 1, 1), dev)?.to_dtype(x0.dtype())?;
        let sigma = Tensor::from_vec(sigma, (batch, 1, 1), dev)?.to_dtype(x0.dtype())?;
        Ok((x0.broadcast_mul(&signal)? + noise.broadcast_mul(&sigma)?)?)
    }

    /// Estimate `x0` from `x_t` and a noise prediction at timestep `t`.
    pub fn predict_x0(&self, x_t: &Tensor, t: usize, eps: &Tensor) -> Result<Tensor> {
        let ab = self.alpha_bar(t)?;
        Ok(((x_t - (eps * (1.0 - ab).sqrt())?)? / ab.sqrt())?)
    }
}

/// Deterministic DDIM sampler over a respaced subset of the timesteps.
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    diffusion: GaussianDiffusion,
    timesteps: Vec<usize>,
}

impl DdimScheduler {
    pub fn new(diffusion: GaussianDiffusion) -> Self {
        Self {
            diffusion,
            timesteps: Vec::new(),
        }
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    /// Evenly spaced timesteps from `T - 1` down to 0.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) {
        let total = self.diffusion.num_timesteps();
        let steps = num_inference_steps.clamp(1, total);
        let mut timesteps: Vec<usize> = (0..steps)
            .map(|i| {
                if steps == 1 {
                    total - 1
                } else {
                    ((total - 1) as f64 * i as f64 / (steps - 1) as f64).round() as usize
                }
            })
            .collect();
        timesteps.dedup();
        timesteps.reverse();
        self.timesteps = timesteps;
    }

    /// Descending timesteps; fed to the model as-is.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// One DDIM update from `timesteps()[step_index]` to the next entry (or
    /// to the clean sample after the last one).
    pub fn step(&self, eps: &Tensor, sample: &Tensor, step_index: usize) -> Result<Tensor> {
        let t = *self.timesteps.get(step_index).ok_or_else(|| {
            Error::Config(format!(
                "step {step_index} outside {} scheduled steps",
                self.timesteps.len()
            ))
        })?;
        let ab_prev = match self.timesteps.get(step_index + 1) {
            Some(&prev) => self.diffusion.alpha_bar(prev)?,
            None => 1.0,
        };
        let dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let eps = eps.to_dtype(DType::F32)?;
        let x0 = self.diffusion.predict_x0(&sample, t, &eps)?;
        let prev = ((x0 * ab_prev.sqrt())? + (eps * (1.0 - ab_prev).sqrt())?)?;
        Ok(prev.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn linear_betas_span_default_range() {
        let b = betas(&SchedulerConfig::default());
        assert_eq!(b.len(), 1000);
        assert!((b[0] - 1e-4).abs() < 1e-12);
        assert!((b[999] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn cosine_betas_are_bounded() {
        let config = SchedulerConfig {
            num_train_timesteps: 100,
            beta_schedule: BetaSchedule::Cosine,
        };
        let b = betas(&config);
        assert!(b.iter().all(|&beta| beta > 0.0 && beta <= 0.999));
    }

    #[test]
    fn short_linear_schedule_is_rejected() {
        // 1000/n rescaling pushes the late betas past 1 for small n.
        let config = SchedulerConfig {
            num_train_timesteps: 10,
            beta_schedule: BetaSchedule::Linear,
        };
        assert!(betas(&config).iter().any(|&b| b > 1.0));
        assert!(GaussianDiffusion::new(&config).is_err());

        let config = SchedulerConfig {
            num_train_timesteps: 50,
            ..config
        };
        let diffusion = GaussianDiffusion::new(&config).unwrap();
        assert!(diffusion.alphas_cumprod().iter().all(|&ab| ab > 0.0));
    }

    #[test]
    fn alphas_cumprod_decrease() {
        let diffusion = GaussianDiffusion::new(&SchedulerConfig::default()).unwrap();
        let ab = diffusion.alphas_cumprod();
        assert!(ab.windows(2).all(|w| w[1] < w[0]));
        assert!(ab[999] < 1e-3);
    }

    #[test]
    fn respaced_timesteps_descend_to_zero() {
        let diffusion = GaussianDiffusion::new(&SchedulerConfig::default()).unwrap();
        let mut scheduler = DdimScheduler::new(diffusion);
        scheduler.set_timesteps(5);
        assert_eq!(scheduler.timesteps(), &[999, 749, 500, 250, 0]);
        scheduler.set_timesteps(1);
        assert_eq!(scheduler.timesteps(), &[999]);
    }

    #[test]
    fn exact_noise_prediction_recovers_sample() {
        let dev = Device::Cpu;
        let diffusion = GaussianDiffusion::new(&SchedulerConfig::default()).unwrap();
        let x0 = Tensor::randn(0f32, 1.0, (2, 3, 4), &dev).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (2, 3, 4), &dev).unwrap();
        let x_t = diffusion.q_sample(&x0, &[400, 400], &noise).unwrap();

        let mut scheduler = DdimScheduler::new(diffusion);
        scheduler.set_timesteps(1000);
        let index = scheduler
            .timesteps()
            .iter()
            .position(|&t| t == 400)
            .unwrap();
        // From t=400, stepping with the true noise lands on x_{399}.
        let prev = scheduler.step(&noise, &x_t, index).unwrap();
        let expected = scheduler.diffusion().q_sample(&x0, &[399, 399], &noise).unwrap();
        let diff: f32 = (prev - expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn q_sample_checks_batch() {
        let dev = Device::Cpu;
        let diffusion = GaussianDiffusion::new(&SchedulerConfig::default()).unwrap();
        let x0 = Tensor::zeros((2, 1, 1), DType::F32, &dev).unwrap();
        assert!(diffusion.q_sample(&x0, &[1], &x0).is_err());
        assert!(diffusion.q_sample(&x0, &[1, 5000], &x0).is_err());
    }
}
