//! Diffusion model paired with its cheater-latent encoder.
//!
//! During training the encoder sees the clean target mel and its latent is
//! fed to the diffusion model as the conditioning prior. The encoder can be
//! held frozen for the first part of a run.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use super::diffusion::TransformerDiffusion;
use super::encoder::ResEncoder16x;
use super::params::{self, ParameterGroups, BLOCK_GRADIENT_SCALE};
use crate::config::CheaterConfig;
use crate::{Error, Result};

/// Checkpoint prefix of the diffusion model.
pub const DIFFUSION_PREFIX: &str = "diff.";

/// Checkpoint prefix of the cheater encoder.
pub const ENCODER_PREFIX: &str = "encoder.";

#[derive(Debug, Clone)]
pub struct TransformerDiffusionWithCheaterLatent {
    diff: TransformerDiffusion,
    encoder: ResEncoder16x,
    freeze_encoder_until: Option<u64>,
    internal_step: u64,
}

impl TransformerDiffusionWithCheaterLatent {
    pub fn new(config: &CheaterConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let diff = TransformerDiffusion::new(&config.diffusion, vb.pp("diff"))?;
        let encoder = ResEncoder16x::new(&config.encoder, vb.pp("encoder"))?;
        Ok(Self {
            diff,
            encoder,
            freeze_encoder_until: config.freeze_encoder_until,
            internal_step: 0,
        })
    }

    pub fn diffusion(&self) -> &TransformerDiffusion {
        &self.diff
    }

    pub fn encoder(&self) -> &ResEncoder16x {
        &self.encoder
    }

    /// Record the current training step.
    pub fn set_step(&mut self, step: u64) {
        self.internal_step = step;
    }

    pub fn step(&self) -> u64 {
        self.internal_step
    }

    /// Encoder gradients flow only once the step passes `freeze_encoder_until`.
    /// Without a threshold the encoder never trains.
    pub fn encoder_trainable(&self) -> bool {
        self.freeze_encoder_until
            .is_some_and(|until| self.internal_step > until)
    }

    /// Cheater latent of `truth_mel`; detached while the encoder is frozen.
    pub fn encode(&self, truth_mel: &Tensor, train: bool) -> Result<Tensor> {
        let mel = truth_mel.to_dtype(self.diff.config().dtype())?;
        let proj = self.encoder.forward_t(&mel, train)?;
        if self.encoder_trainable() {
            Ok(proj)
        } else {
            Ok(proj.detach())
        }
    }

    /// - `x`: `[B, in_channels, T]`
    /// - `timesteps`: `[B]`
    /// - `truth_mel`: `[B, spec_dim, T_mel]`; may be omitted when `conditioning_free`
    pub fn forward_t(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        truth_mel: Option<&Tensor>,
        conditioning_free: bool,
        train: bool,
    ) -> Result<Tensor> {
        let proj = match (truth_mel, conditioning_free) {
            (_, true) => None,
            (Some(mel), false) => Some(self.encode(mel, train)?),
            (None, false) => {
                return Err(Error::Config(
                    "truth_mel is required unless conditioning_free is set".into(),
                ))
            }
        };
        self.diff
            .forward_t(x, timesteps, proj.as_ref(), conditioning_free, train)
    }

    pub fn forward(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        truth_mel: Option<&Tensor>,
        conditioning_free: bool,
    ) -> Result<Tensor> {
        self.forward_t(x, timesteps, truth_mel, conditioning_free, false)
    }

    /// Diffusion groups plus `encoder`.
    pub fn parameter_groups(&self, varmap: &VarMap) -> Result<ParameterGroups> {
        let mut groups = params::collect_groups(varmap, DIFFUSION_PREFIX)?;
        groups.insert(
            "encoder",
            params::filter_vars(varmap, |name| name.starts_with(ENCODER_PREFIX))?,
        );
        Ok(groups)
    }

    /// Variables the optimizer should update at the current step.
    pub fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        let encoder_trainable = self.encoder_trainable();
        let freeze_diff = self.diff.config().freeze_except_code_converters;
        let converter = format!("{DIFFUSION_PREFIX}input_converter.");
        params::filter_vars(varmap, |name| {
            if name.starts_with(ENCODER_PREFIX) {
                encoder_trainable
            } else if freeze_diff {
                name.starts_with(&converter)
            } else {
                true
            }
        })
    }

    /// Down-scale block output and prenorm gradients before the optimizer step.
    pub fn before_step(&self, grads: &mut GradStore, varmap: &VarMap) -> Result<()> {
        let scaled =
            params::scale_block_gradients(grads, varmap, DIFFUSION_PREFIX, BLOCK_GRADIENT_SCALE)?;
        tracing::trace!(scaled, "scaled block gradients");
        Ok(())
    }
}
