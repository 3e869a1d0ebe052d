//! Cheater-latent encoder: mel spectrogram → 16x downsampled latent.
//!
//! ## Architecture
//!
//! ```text
//! mel [B, 256, T]
//!   4 × ResBlock(down)   channel ramp 256 → 1024 (multiples of 64), T → T/16
//!   3 × ResBlock         1024
//!   GroupNorm → SiLU → Conv1d(1024, 256, 1) → zero Conv1d(256, 256, 1)
//! latent [B, 256, T/16]
//! ```
//!
//! Each downsampling step is an average pool of width 2, so trailing frames
//! that do not fill a pool window are dropped.
//!
//! ## Weight key paths (under `encoder.`)
//!
//! The stage layout, the 64-rounded channel ramp and these keys are this
//! crate's own; checkpoints from other ResEncoder16x implementations are not
//! expected to load.
//!
//! ```text
//! downsampler.{0..3}.{in_layers.0, in_layers.2, out_layers.0, out_layers.3, skip_connection}
//! encoder.{0..2}.{...same...}
//! encoder.3.{weight,bias}      GroupNorm
//! encoder.5.{weight,bias}      Conv1d(hidden, embedding, 1)
//! encoder.6.{weight,bias}      Conv1d(embedding, embedding, 1), zero-initialised
//! ```

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{self as nn, Conv1d, Dropout, GroupNorm, VarBuilder};

use super::nn::{avg_pool1d_2x, conv1d_same, normalization, zero_conv1d};
use crate::config::EncoderConfig;

/// Number of 2x downsampling stages.
const DOWN_STAGES: usize = 4;

/// Total temporal compression of the encoder.
pub const DOWNSAMPLE_FACTOR: usize = 1 << DOWN_STAGES;

/// Residual conv block with optional 2x downsampling.
#[derive(Debug, Clone)]
pub struct ResBlock {
    in_norm: GroupNorm,
    in_conv: Conv1d,
    out_norm: GroupNorm,
    out_conv: Conv1d,
    skip: Option<Conv1d>,
    dropout: Dropout,
    down: bool,
}

impl ResBlock {
    pub fn new(
        channels: usize,
        out_channels: usize,
        down: bool,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_norm = normalization(channels, vb.pp("in_layers.0"))?;
        let in_conv = conv1d_same(channels, out_channels, 3, vb.pp("in_layers.2"))?;
        let out_norm = normalization(out_channels, vb.pp("out_layers.0"))?;
        let out_conv = zero_conv1d(
            out_channels,
            out_channels,
            3,
            nn::Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            true,
            vb.pp("out_layers.3"),
        )?;
        let skip = if channels != out_channels {
            Some(conv1d_same(
                channels,
                out_channels,
                3,
                vb.pp("skip_connection"),
            )?)
        } else {
            None
        };
        Ok(Self {
            in_norm,
            in_conv,
            out_norm,
            out_conv,
            skip,
            dropout: Dropout::new(dropout),
            down,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.in_norm.forward(x)?.silu()?;
        let (h, x) = if self.down {
            (avg_pool1d_2x(&h)?, avg_pool1d_2x(x)?)
        } else {
            (h, x.clone())
        };
        let h = self.in_conv.forward(&h)?;

        let h = self.out_norm.forward(&h)?.silu()?;
        let h = self.out_conv.forward(&self.dropout.forward_t(&h, train)?)?;

        match &self.skip {
            Some(skip) => skip.forward(&x)? + h,
            None => x + h,
        }
    }
}

/// Channel width after downsampling stage `stage` (1-based).
///
/// Linear ramp from `spec_dim` to `hidden_dim`, rounded up to a multiple of
/// 64 and clamped to the ramp's range; the last stage is exactly `hidden_dim`.
pub fn stage_channels(spec_dim: usize, hidden_dim: usize, stage: usize) -> usize {
    if stage >= DOWN_STAGES {
        return hidden_dim;
    }
    let target = spec_dim as f64 + (hidden_dim as f64 - spec_dim as f64) * stage as f64 / DOWN_STAGES as f64;
    let rounded = (target / 64.0).ceil() as usize * 64;
    rounded.clamp(spec_dim.min(hidden_dim), spec_dim.max(hidden_dim))
}

/// The 16x downsampling residual encoder.
#[derive(Debug, Clone)]
pub struct ResEncoder16x {
    downsampler: Vec<ResBlock>,
    blocks: Vec<ResBlock>,
    norm: GroupNorm,
    proj: Conv1d,
    proj_out: Conv1d,
    config: EncoderConfig,
}

impl ResEncoder16x {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let spec = config.spec_dim;
        let hidden = config.hidden_dim;

        let mut downsampler = Vec::with_capacity(DOWN_STAGES);
        let mut channels = spec;
        for stage in 0..DOWN_STAGES {
            let out = stage_channels(spec, hidden, stage + 1);
            downsampler.push(ResBlock::new(
                channels,
                out,
                true,
                config.dropout,
                vb.pp(format!("downsampler.{stage}")),
            )?);
            channels = out;
        }

        let vb_enc = vb.pp("encoder");
        let mut blocks = Vec::with_capacity(3);
        for i in 0..3 {
            blocks.push(ResBlock::new(
                hidden,
                hidden,
                false,
                config.dropout,
                vb_enc.pp(i.to_string()),
            )?);
        }
        let norm = normalization(hidden, vb_enc.pp("3"))?;
        let proj = nn::conv1d(
            hidden,
            config.embedding_dim,
            1,
            Default::default(),
            vb_enc.pp("5"),
        )?;
        let proj_out = zero_conv1d(
            config.embedding_dim,
            config.embedding_dim,
            1,
            Default::default(),
            true,
            vb_enc.pp("6"),
        )?;

        Ok(Self {
            downsampler,
            blocks,
            norm,
            proj,
            proj_out,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// `mel`: `[B, spec_dim, T]` → `[B, embedding_dim, T / 16]`.
    pub fn forward_t(&self, mel: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = mel.clone();
        for block in self.downsampler.iter().chain(self.blocks.iter()) {
            h = block.forward(&h, train)?;
        }
        let h = self.norm.forward(&h)?.silu()?;
        self.proj_out.forward(&self.proj.forward(&h)?)
    }

    pub fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        self.forward_t(mel, false)
    }
}
