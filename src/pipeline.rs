//! Guided sampling pipeline.
//!
//! 1. Encode the condition once and start from Gaussian noise `[B, in_channels, T]`
//! 2. For each DDIM timestep run the conditional forward and, unless the
//!    guidance scale is 1, the conditioning-free forward
//! 3. Combine with classifier-free guidance and take a DDIM step
//! 4. Return the final clean estimate

use candle_core::{Device, Tensor};

use crate::model::Denoiser;
use crate::scheduler::{DdimScheduler, GaussianDiffusion, SchedulerConfig};
use crate::{Error, Result};

/// Default guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f64 = 1.5;

/// Maximum accepted guidance scale.
pub const MAX_GUIDANCE_SCALE: f64 = 20.0;

/// Classifier-free guidance: `uncond + scale · (cond − uncond)`.
pub fn apply_cfg(cond: &Tensor, uncond: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    Ok((uncond + ((cond - uncond)? * guidance_scale)?)?)
}

/// Reject non-finite, negative or excessive guidance scales.
pub fn validate_guidance_scale(scale: f64) -> Result<()> {
    if !scale.is_finite() {
        return Err(Error::Config("guidance scale must be a finite number".into()));
    }
    if !(0.0..=MAX_GUIDANCE_SCALE).contains(&scale) {
        return Err(Error::Config(format!(
            "guidance scale {scale} outside [0, {MAX_GUIDANCE_SCALE}]"
        )));
    }
    Ok(())
}

/// Sampling parameters.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// DDIM steps.
    pub steps: usize,
    /// Classifier-free guidance scale; 1 disables the unconditioned pass.
    pub guidance_scale: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            steps: 50,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }
}

/// DDIM sampler driving a [`Denoiser`].
pub struct Sampler {
    scheduler: DdimScheduler,
}

impl Sampler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            scheduler: DdimScheduler::new(GaussianDiffusion::new(config)?),
        })
    }

    /// Guided noise prediction at one timestep; `encoded` comes from
    /// [`Denoiser::encode_condition`].
    pub fn guided_eps(
        model: &dyn Denoiser,
        x: &Tensor,
        timesteps: &Tensor,
        encoded: &Tensor,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let in_channels = model.in_channels();
        let eps = model
            .forward_encoded(x, timesteps, Some(encoded), false)?
            .narrow(1, 0, in_channels)?;
        if (guidance_scale - 1.0).abs() < f64::EPSILON {
            return Ok(eps);
        }
        let uncond = model
            .forward_encoded(x, timesteps, None, true)?
            .narrow(1, 0, in_channels)?;
        apply_cfg(&eps, &uncond, guidance_scale)
    }

    /// Sample `[batch, in_channels, length]` conditioned on `cond`.
    pub fn sample(
        &mut self,
        model: &dyn Denoiser,
        cond: &Tensor,
        batch: usize,
        length: usize,
        params: &SamplingParams,
    ) -> Result<Tensor> {
        validate_guidance_scale(params.guidance_scale)?;
        let device = cond.device();
        let mut x = Tensor::randn(0f32, 1.0, (batch, model.in_channels(), length), device)?;
        self.scheduler.set_timesteps(params.steps);
        let timesteps = self.scheduler.timesteps().to_vec();
        let encoded = model.encode_condition(cond)?;

        for (index, &t) in timesteps.iter().enumerate() {
            let ts = timestep_tensor(t, batch, device)?;
            let eps = Self::guided_eps(model, &x, &ts, &encoded, params.guidance_scale)?;
            x = self.scheduler.step(&eps, &x, index)?;
            if index % 10 == 0 || index + 1 == timesteps.len() {
                tracing::debug!(step = index + 1, of = timesteps.len(), t, "sampling");
            }
        }
        Ok(x)
    }
}

fn timestep_tensor(t: usize, batch: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::full(t as u32, batch, device)?)
}
