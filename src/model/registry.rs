//! Named model constructors.
//!
//! Training options refer to models by registered name; [`ModelSpec`]
//! parses the `kwargs` for that name and builds a boxed [`Denoiser`].

use std::str::FromStr;

use candle_core::DType;
use candle_nn::VarBuilder;

use super::cheater::TransformerDiffusionWithCheaterLatent;
use super::diffusion::TransformerDiffusion;
use super::Denoiser;
use crate::config::{CheaterConfig, DiffusionConfig, ModelOptions};
use crate::{Error, Result};

/// Registered model names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    TransformerDiffusion14,
    TransformerDiffusion14WithCheaterLatent,
}

impl ModelKind {
    pub fn name(self) -> &'static str {
        match self {
            ModelKind::TransformerDiffusion14 => "transformer_diffusion14",
            ModelKind::TransformerDiffusion14WithCheaterLatent => {
                "transformer_diffusion_14_with_cheater_latent"
            }
        }
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "transformer_diffusion14" => Ok(ModelKind::TransformerDiffusion14),
            "transformer_diffusion_14_with_cheater_latent" => {
                Ok(ModelKind::TransformerDiffusion14WithCheaterLatent)
            }
            other => Err(Error::Config(format!("unknown model {other:?}"))),
        }
    }
}

/// A registered model with its parsed configuration.
#[derive(Debug, Clone)]
pub enum ModelSpec {
    Diffusion(DiffusionConfig),
    Cheater(CheaterConfig),
}

impl ModelSpec {
    pub fn from_options(options: &ModelOptions) -> Result<Self> {
        let kind: ModelKind = options.which_model.parse()?;
        let kwargs = options.kwargs.clone();
        let spec = match kind {
            ModelKind::TransformerDiffusion14 => ModelSpec::Diffusion(serde_json::from_value(kwargs)?),
            ModelKind::TransformerDiffusion14WithCheaterLatent => {
                ModelSpec::Cheater(serde_json::from_value(kwargs)?)
            }
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            ModelSpec::Diffusion(_) => ModelKind::TransformerDiffusion14,
            ModelSpec::Cheater(_) => ModelKind::TransformerDiffusion14WithCheaterLatent,
        }
    }

    pub fn diffusion_config(&self) -> &DiffusionConfig {
        match self {
            ModelSpec::Diffusion(config) => config,
            ModelSpec::Cheater(config) => &config.diffusion,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ModelSpec::Diffusion(config) => config.validate(),
            ModelSpec::Cheater(config) => config.validate(),
        }
    }

    /// Dtype the weights should be loaded in.
    pub fn dtype(&self) -> DType {
        self.diffusion_config().dtype()
    }

    pub fn build(&self, vb: VarBuilder) -> Result<Box<dyn Denoiser>> {
        tracing::info!(model = self.kind().name(), "building model");
        Ok(match self {
            ModelSpec::Diffusion(config) => Box::new(TransformerDiffusion::new(config, vb)?),
            ModelSpec::Cheater(config) => {
                Box::new(TransformerDiffusionWithCheaterLatent::new(config, vb)?)
            }
        })
    }
}
