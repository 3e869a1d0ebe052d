//! Model components.
//!
//! ## Components
//!
//! - [`diffusion`] — the concat-attention transformer denoiser
//! - [`encoder`] — 16x residual mel encoder producing the cheater latent
//! - [`cheater`] — denoiser + encoder wrapper used for training and sampling
//! - [`blocks`], [`attention`], [`mask`], [`nn`] — building blocks
//! - [`params`] — parameter groups, freezing and gradient scaling
//! - [`registry`] — construction by registered model name

pub mod attention;
pub mod blocks;
pub mod cheater;
pub mod diffusion;
pub mod encoder;
pub mod mask;
pub mod nn;
pub mod params;
pub mod registry;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::Result;
use cheater::TransformerDiffusionWithCheaterLatent;
use diffusion::TransformerDiffusion;
use params::ParameterGroups;

/// Common interface of the denoisers, used by sampling and training.
///
/// `cond` is the model's conditioning input: the prior latent for
/// [`TransformerDiffusion`], the clean mel for the cheater wrapper.
pub trait Denoiser {
    /// Channels of the noisy input.
    fn in_channels(&self) -> usize;

    /// Forward pass returning `[B, out_channels, T]` in F32.
    fn forward_t(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        cond: Option<&Tensor>,
        conditioning_free: bool,
        train: bool,
    ) -> Result<Tensor>;

    /// Turn `cond` into the prior the diffusion trunk consumes. Sampling
    /// calls this once and reuses the result for every step.
    fn encode_condition(&self, cond: &Tensor) -> Result<Tensor> {
        Ok(cond.clone())
    }

    /// Inference forward pass on a condition already run through
    /// [`Denoiser::encode_condition`].
    fn forward_encoded(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        encoded: Option<&Tensor>,
        conditioning_free: bool,
    ) -> Result<Tensor> {
        self.forward_t(x, timesteps, encoded, conditioning_free, false)
    }

    /// Named parameter groups for gradient-norm reporting.
    fn parameter_groups(&self, varmap: &VarMap) -> Result<ParameterGroups>;

    /// Variables the optimizer should update at the current step.
    fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>>;

    /// Gradient adjustments applied between backward and the optimizer step.
    fn before_step(&self, _grads: &mut GradStore, _varmap: &VarMap) -> Result<()> {
        Ok(())
    }

    /// Record the current training step.
    fn set_step(&mut self, _step: u64) {}
}

impl Denoiser for TransformerDiffusion {
    fn in_channels(&self) -> usize {
        self.config().in_channels
    }

    fn forward_t(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        cond: Option<&Tensor>,
        conditioning_free: bool,
        train: bool,
    ) -> Result<Tensor> {
        TransformerDiffusion::forward_t(self, x, timesteps, cond, conditioning_free, train)
    }

    fn parameter_groups(&self, varmap: &VarMap) -> Result<ParameterGroups> {
        params::collect_groups(varmap, "")
    }

    fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        if self.config().freeze_except_code_converters {
            params::filter_vars(varmap, |name| name.starts_with("input_converter."))
        } else {
            Ok(varmap.all_vars())
        }
    }
}

impl Denoiser for TransformerDiffusionWithCheaterLatent {
    fn in_channels(&self) -> usize {
        self.diffusion().config().in_channels
    }

    fn forward_t(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        cond: Option<&Tensor>,
        conditioning_free: bool,
        train: bool,
    ) -> Result<Tensor> {
        TransformerDiffusionWithCheaterLatent::forward_t(
            self,
            x,
            timesteps,
            cond,
            conditioning_free,
            train,
        )
    }

    fn encode_condition(&self, cond: &Tensor) -> Result<Tensor> {
        self.encode(cond, false)
    }

    fn forward_encoded(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        encoded: Option<&Tensor>,
        conditioning_free: bool,
    ) -> Result<Tensor> {
        self.diffusion()
            .forward_t(x, timesteps, encoded, conditioning_free, false)
    }

    fn parameter_groups(&self, varmap: &VarMap) -> Result<ParameterGroups> {
        TransformerDiffusionWithCheaterLatent::parameter_groups(self, varmap)
    }

    fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        TransformerDiffusionWithCheaterLatent::trainable_vars(self, varmap)
    }

    fn before_step(&self, grads: &mut GradStore, varmap: &VarMap) -> Result<()> {
        TransformerDiffusionWithCheaterLatent::before_step(self, grads, varmap)
    }

    fn set_step(&mut self, step: u64) {
        TransformerDiffusionWithCheaterLatent::set_step(self, step)
    }
}
