//! Model configuration.
//!
//! Field names and defaults match the `kwargs` block of the training options
//! that produced the released checkpoints, so an options file can be
//! deserialized directly. Unknown keys are ignored.

use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for [`crate::model::diffusion::TransformerDiffusion`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Width of the sinusoidal timestep embedding.
    #[serde(default = "default_time_embed_dim")]
    pub time_embed_dim: usize,

    /// Trunk channel count.
    #[serde(default = "default_model_channels")]
    pub model_channels: usize,

    /// Channel count produced by each attention / feed-forward sub-block.
    #[serde(default = "default_contraction_dim")]
    pub contraction_dim: usize,

    /// Number of concat-attention blocks.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Channels of the noisy input sequence.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Channels of the conditioning prior.
    #[serde(default = "default_input_vec_dim")]
    pub input_vec_dim: usize,

    /// Output channels: mean and variance halves.
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,

    /// Attention heads per sub-block.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Dropout probability inside sub-blocks (training only).
    #[serde(default)]
    pub dropout: f32,

    /// Load weights and run the trunk in half precision.
    #[serde(default)]
    pub use_fp16: bool,

    /// Probability of replacing a batch element's conditioning with the
    /// learned unconditioned embedding during training.
    #[serde(default = "default_unconditioned_percentage")]
    pub unconditioned_percentage: f64,

    /// Freeze everything except `input_converter`.
    #[serde(default)]
    pub freeze_except_code_converters: bool,

    /// Half-width of the local self-attention window.
    #[serde(default = "default_attention_window")]
    pub attention_window: usize,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            time_embed_dim: default_time_embed_dim(),
            model_channels: default_model_channels(),
            contraction_dim: default_contraction_dim(),
            num_layers: default_num_layers(),
            in_channels: default_in_channels(),
            input_vec_dim: default_input_vec_dim(),
            out_channels: default_out_channels(),
            num_heads: default_num_heads(),
            dropout: 0.0,
            use_fp16: false,
            unconditioned_percentage: default_unconditioned_percentage(),
            freeze_except_code_converters: false,
            attention_window: default_attention_window(),
        }
    }
}

impl DiffusionConfig {
    /// Weight / activation dtype for the trunk.
    pub fn dtype(&self) -> DType {
        if self.use_fp16 {
            DType::F16
        } else {
            DType::F32
        }
    }

    /// Check the shape constraints the blocks rely on.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(Error::Config("num_heads must be > 0".into()));
        }
        if self.contraction_dim % self.num_heads != 0 {
            return Err(Error::Config(format!(
                "contraction_dim {} is not divisible by num_heads {}",
                self.contraction_dim, self.num_heads
            )));
        }
        // prenorm and attnorm/ffnorm use 8 groups.
        for (name, channels) in [
            ("model_channels", self.model_channels),
            ("contraction_dim", self.contraction_dim),
        ] {
            if channels == 0 || channels % 8 != 0 {
                return Err(Error::Config(format!(
                    "{name} ({channels}) must be a positive multiple of 8"
                )));
            }
        }
        if self.time_embed_dim == 0 {
            return Err(Error::Config("time_embed_dim must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.unconditioned_percentage) {
            return Err(Error::Config(format!(
                "unconditioned_percentage {} is outside [0, 1]",
                self.unconditioned_percentage
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout {} is outside [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Configuration for the 16x downsampling cheater-latent encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Mel bins of the input spectrogram.
    #[serde(default = "default_spec_dim")]
    pub spec_dim: usize,

    /// Channel count after the downsampling stack.
    #[serde(default = "default_encoder_hidden_dim")]
    pub hidden_dim: usize,

    /// Channels of the emitted latent.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    #[serde(default)]
    pub dropout: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            spec_dim: default_spec_dim(),
            hidden_dim: default_encoder_hidden_dim(),
            embedding_dim: default_embedding_dim(),
            dropout: 0.0,
        }
    }
}

/// Configuration for the diffusion model wrapped with its cheater encoder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheaterConfig {
    /// Diffusion model settings, flattened into the same object.
    #[serde(flatten)]
    pub diffusion: DiffusionConfig,

    /// Encoder gradients stay disabled until the training step exceeds this.
    /// `None` keeps the encoder frozen for the whole run.
    #[serde(default)]
    pub freeze_encoder_until: Option<u64>,

    #[serde(default)]
    pub encoder: EncoderConfig,
}

impl CheaterConfig {
    pub fn validate(&self) -> Result<()> {
        self.diffusion.validate()?;
        if self.encoder.embedding_dim != self.diffusion.input_vec_dim {
            return Err(Error::Config(format!(
                "encoder.embedding_dim ({}) must equal input_vec_dim ({})",
                self.encoder.embedding_dim, self.diffusion.input_vec_dim
            )));
        }
        Ok(())
    }
}

/// Network section of a training options file:
/// `{"which_model_G": "<registered name>", "kwargs": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(rename = "which_model_G")]
    pub which_model: String,

    #[serde(default = "empty_kwargs")]
    pub kwargs: serde_json::Value,
}

impl ModelOptions {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let options = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(options)
    }
}

fn empty_kwargs() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_time_embed_dim() -> usize {
    256
}
fn default_model_channels() -> usize {
    1024
}
fn default_contraction_dim() -> usize {
    256
}
fn default_num_layers() -> usize {
    8
}
fn default_in_channels() -> usize {
    256
}
fn default_input_vec_dim() -> usize {
    1024
}
fn default_out_channels() -> usize {
    512
}
fn default_num_heads() -> usize {
    4
}
fn default_unconditioned_percentage() -> f64 {
    0.1
}
fn default_attention_window() -> usize {
    48
}
fn default_spec_dim() -> usize {
    256
}
fn default_encoder_hidden_dim() -> usize {
    1024
}
fn default_embedding_dim() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_released_kwargs() {
        let config = DiffusionConfig::default();
        assert_eq!(config.time_embed_dim, 256);
        assert_eq!(config.model_channels, 1024);
        assert_eq!(config.contraction_dim, 256);
        assert_eq!(config.num_layers, 8);
        assert_eq!(config.out_channels, 2 * config.in_channels);
        assert!((config.unconditioned_percentage - 0.1).abs() < 1e-12);
        config.validate().unwrap();
    }

    #[test]
    fn deserialize_cheater_kwargs() {
        let json = r#"{
            "in_channels": 256, "out_channels": 512, "model_channels": 1024,
            "contraction_dim": 512, "num_heads": 8, "input_vec_dim": 256,
            "num_layers": 16, "dropout": 0.1, "new_code_expansion": true,
            "freeze_encoder_until": 2000
        }"#;
        let config: CheaterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.diffusion.num_layers, 16);
        assert_eq!(config.diffusion.num_heads, 8);
        assert_eq!(config.freeze_encoder_until, Some(2000));
        // Unspecified fields use defaults.
        assert_eq!(config.diffusion.time_embed_dim, 256);
        assert_eq!(config.encoder.spec_dim, 256);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = DiffusionConfig {
            contraction_dim: 256,
            num_heads: 3,
            ..DiffusionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_encoder_width() {
        let config = CheaterConfig::default();
        // default input_vec_dim is 1024, default encoder emits 256
        assert!(config.validate().is_err());
    }

    #[test]
    fn fp16_selects_half_dtype() {
        let config = DiffusionConfig {
            use_fp16: true,
            ..DiffusionConfig::default()
        };
        assert_eq!(config.dtype(), DType::F16);
    }

    #[test]
    fn model_options_keep_kwargs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.json");
        std::fs::write(
            &path,
            r#"{"which_model_G": "transformer_diffusion14", "kwargs": {"num_layers": 2}}"#,
        )
        .unwrap();
        let options = ModelOptions::from_json_file(&path).unwrap();
        assert_eq!(options.which_model, "transformer_diffusion14");
        assert_eq!(options.kwargs["num_layers"], 2);
    }
}
