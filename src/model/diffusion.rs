//! TransformerDiffusion: a denoiser built entirely from concat-attention blocks.
//!
//! ```text
//! prior [B, V, T'] → input_converter → (conditioning dropout) → nearest → code_emb [B, D, T]
//! t [B] → sinusoid(256) → Linear → SiLU → Linear(D) → blk_emb [B, D, 1]
//! x [B, I, T] → inp_block(k3) ─┐
//!                              ├→ cat_C → intg(1x1) → N × ConcatAttentionBlock(blk_emb)
//! code_emb ────────────────────┘
//!   → f32 → GroupNorm → SiLU → zero Conv1d(k3) → [B, O, T]
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! inp_block.{weight,bias}
//! time_embed.0.{weight,bias}, time_embed.2.{weight,bias}
//! input_converter.{weight,bias}
//! unconditioned_embedding             (1, D, 1)
//! intg.{weight,bias}
//! layers.{i}.prenorm / block1 / block2 / out
//! out.0.{weight,bias}                 GroupNorm
//! out.2.{weight,bias}                 Conv1d(D, O, 3)
//! ```

use candle_core::{DType, Module, Tensor};
use candle_nn::{self as nn, Conv1d, Conv1dConfig, GroupNorm, Init, Linear, VarBuilder};

use super::blocks::ConcatAttentionBlock;
use super::mask::local_attention_bias;
use super::nn::{conv1d_same, interpolate_nearest, normalization, timestep_embedding, zero_conv1d};
use crate::config::DiffusionConfig;
use crate::{Error, Result};

/// Random per-element replacement of the conditioning with a learned
/// unconditioned embedding.
#[derive(Debug, Clone, Copy)]
pub struct ConditioningDropout {
    probability: f64,
}

impl ConditioningDropout {
    pub fn new(probability: f64) -> Self {
        Self { probability }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Draw `u ~ U[0, 1)` per batch element and apply [`Self::apply_with_draw`].
    pub fn apply(&self, code_emb: &Tensor, unconditioned: &Tensor) -> Result<Tensor> {
        if self.probability <= 0.0 {
            return Ok(code_emb.clone());
        }
        let batch = code_emb.dim(0)?;
        let draw = Tensor::rand(0f32, 1f32, (batch, 1, 1), code_emb.device())?;
        self.apply_with_draw(code_emb, unconditioned, &draw)
    }

    /// Replace batch elements whose `draw < probability`.
    ///
    /// - `code_emb`: `[B, D, T]`
    /// - `unconditioned`: `[1, D, 1]`
    /// - `draw`: `[B, 1, 1]` uniform samples
    pub fn apply_with_draw(
        &self,
        code_emb: &Tensor,
        unconditioned: &Tensor,
        draw: &Tensor,
    ) -> Result<Tensor> {
        let shape = code_emb.shape();
        let dropped = draw
            .to_dtype(DType::F32)?
            .lt(self.probability)?
            .broadcast_as(shape)?;
        let unconditioned = unconditioned
            .to_dtype(code_emb.dtype())?
            .broadcast_as(shape)?;
        Ok(dropped.where_cond(&unconditioned, code_emb)?)
    }
}

/// The diffusion denoiser.
#[derive(Debug, Clone)]
pub struct TransformerDiffusion {
    config: DiffusionConfig,
    inp_block: Conv1d,
    time_embed_in: Linear,
    time_embed_out: Linear,
    input_converter: Conv1d,
    unconditioned_embedding: Tensor,
    intg: Conv1d,
    layers: Vec<ConcatAttentionBlock>,
    out_norm: GroupNorm,
    out_conv: Conv1d,
    conditioning_dropout: ConditioningDropout,
    dtype: DType,
}

impl TransformerDiffusion {
    pub fn new(config: &DiffusionConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let mc = config.model_channels;
        let ted = config.time_embed_dim;

        let inp_block = conv1d_same(config.in_channels, mc, 3, vb.pp("inp_block"))?;
        let time_embed_in = nn::linear(ted, ted, vb.pp("time_embed.0"))?;
        let time_embed_out = nn::linear(ted, mc, vb.pp("time_embed.2"))?;
        let input_converter = nn::conv1d(
            config.input_vec_dim,
            mc,
            1,
            Default::default(),
            vb.pp("input_converter"),
        )?;
        let unconditioned_embedding = vb.get_with_hints(
            (1, mc, 1),
            "unconditioned_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let intg = nn::conv1d(mc * 2, mc, 1, Default::default(), vb.pp("intg"))?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(ConcatAttentionBlock::new(
                mc,
                config.contraction_dim,
                config.num_heads,
                config.dropout,
                vb.pp(format!("layers.{i}")),
            )?);
        }

        // The output head always runs in F32.
        let out_norm = normalization(mc, vb.pp("out.0").set_dtype(DType::F32))?;
        let out_conv = zero_conv1d(
            mc,
            config.out_channels,
            3,
            Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            true,
            vb.pp("out.2").set_dtype(DType::F32),
        )?;

        tracing::debug!(
            layers = config.num_layers,
            model_channels = mc,
            contraction_dim = config.contraction_dim,
            "built TransformerDiffusion"
        );

        Ok(Self {
            config: config.clone(),
            inp_block,
            time_embed_in,
            time_embed_out,
            input_converter,
            unconditioned_embedding,
            intg,
            layers,
            out_norm,
            out_conv,
            conditioning_dropout: ConditioningDropout::new(config.unconditioned_percentage),
            dtype: vb.dtype(),
        })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    /// Learned embedding substituted for the conditioning, `[1, D, 1]`.
    pub fn unconditioned_embedding(&self) -> &Tensor {
        &self.unconditioned_embedding
    }

    /// Conditioning embedding aligned to `target_len`: `[B, D, target_len]`.
    ///
    /// Applies conditioning dropout when `train` is set.
    pub fn code_embedding(
        &self,
        prior: Option<&Tensor>,
        batch: usize,
        target_len: usize,
        conditioning_free: bool,
        train: bool,
    ) -> Result<Tensor> {
        let mc = self.config.model_channels;
        if conditioning_free {
            return Ok(self
                .unconditioned_embedding
                .broadcast_as((batch, mc, target_len))?
                .contiguous()?);
        }
        let prior = prior.ok_or_else(|| {
            Error::Config("a prior is required unless conditioning_free is set".into())
        })?;
        let prior_batch = prior.dim(0)?;
        if prior_batch != batch {
            return Err(Error::Config(format!(
                "prior batch {prior_batch} does not match input batch {batch}"
            )));
        }

        let code_emb = self.input_converter.forward(&prior.to_dtype(self.dtype)?)?;
        let code_emb = if train {
            self.conditioning_dropout
                .apply(&code_emb, &self.unconditioned_embedding)?
        } else {
            code_emb
        };
        Ok(interpolate_nearest(&code_emb, target_len)?)
    }

    /// Block embedding from diffusion timesteps: `[B]` → `[B, D, 1]`.
    pub fn block_embedding(&self, timesteps: &Tensor) -> Result<Tensor> {
        let emb = timestep_embedding(timesteps, self.config.time_embed_dim, 10000.0)?
            .to_dtype(self.dtype)?;
        let emb = emb
            .apply(&self.time_embed_in)?
            .silu()?
            .apply(&self.time_embed_out)?;
        Ok(emb.unsqueeze(2)?)
    }

    /// Denoiser forward pass.
    ///
    /// - `x`: `[B, in_channels, T]` noisy input
    /// - `timesteps`: `[B]`
    /// - `prior`: `[B, input_vec_dim, T']`; ignored when `conditioning_free`
    /// - `train`: enables dropout and conditioning dropout
    ///
    /// Returns `[B, out_channels, T]` in F32.
    pub fn forward_t(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        prior: Option<&Tensor>,
        conditioning_free: bool,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, channels, seq_len) = x.dims3()?;
        if channels != self.config.in_channels {
            return Err(Error::Config(format!(
                "input has {channels} channels, expected {}",
                self.config.in_channels
            )));
        }

        let code_emb = self.code_embedding(prior, batch, seq_len, conditioning_free, train)?;
        let blk_emb = self.block_embedding(timesteps)?;

        let h = self.inp_block.forward(&x.to_dtype(self.dtype)?)?;
        let mut h = self.intg.forward(&Tensor::cat(&[&h, &code_emb], 1)?)?;

        // The timestep token sits at position 0 and stays visible to every query.
        let prefix_len = blk_emb.dim(2)?;
        let mask = local_attention_bias(
            prefix_len + seq_len,
            self.config.attention_window,
            prefix_len,
            self.dtype,
            x.device(),
        )?;
        for layer in &self.layers {
            h = layer.forward(&h, &blk_emb, Some(&mask), train)?;
        }

        let h = h.to_dtype(DType::F32)?;
        let out = self.out_conv.forward(&self.out_norm.forward(&h)?.silu()?)?;

        // Keeps the unconditioned embedding in the autograd graph even when no
        // batch element dropped its conditioning.
        let anchor = (self
            .unconditioned_embedding
            .to_dtype(DType::F32)?
            .mean_all()?
            * 0.0)?;
        Ok(out.broadcast_add(&anchor)?)
    }

    /// Inference forward pass.
    pub fn forward(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        prior: Option<&Tensor>,
        conditioning_free: bool,
    ) -> Result<Tensor> {
        self.forward_t(x, timesteps, prior, conditioning_free, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_config() -> DiffusionConfig {
        DiffusionConfig {
            time_embed_dim: 16,
            model_channels: 32,
            contraction_dim: 16,
            num_layers: 2,
            in_channels: 8,
            input_vec_dim: 12,
            out_channels: 16,
            num_heads: 2,
            attention_window: 4,
            ..DiffusionConfig::default()
        }
    }

    #[test]
    fn forward_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = TransformerDiffusion::new(&small_config(), vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 8, 20), &dev).unwrap();
        let ts = Tensor::new(&[600u32, 600], &dev).unwrap();
        let prior = Tensor::randn(0f32, 1.0, (2, 12, 5), &dev).unwrap();
        let out = model.forward(&x, &ts, Some(&prior), false).unwrap();
        assert_eq!(out.dims(), &[2, 16, 20]);
        assert_eq!(out.dtype(), DType::F32);

        let uncond = model.forward(&x, &ts, None, true).unwrap();
        assert_eq!(uncond.dims(), &[2, 16, 20]);
    }

    #[test]
    fn missing_prior_is_an_error() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let model = TransformerDiffusion::new(&small_config(), vb).unwrap();
        let x = Tensor::zeros((1, 8, 4), DType::F32, &dev).unwrap();
        let ts = Tensor::new(&[1u32], &dev).unwrap();
        assert!(model.forward(&x, &ts, None, false).is_err());
    }

    #[test]
    fn fresh_model_predicts_zero() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = TransformerDiffusion::new(&small_config(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 8, 9), &dev).unwrap();
        let ts = Tensor::new(&[10u32], &dev).unwrap();
        let prior = Tensor::randn(0f32, 1.0, (1, 12, 3), &dev).unwrap();
        let out = model.forward(&x, &ts, Some(&prior), false).unwrap();
        let total: f32 = out.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn conditioning_free_uses_learned_embedding() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = TransformerDiffusion::new(&small_config(), vb).unwrap();
        let emb = model.code_embedding(None, 3, 7, true, false).unwrap();
        assert_eq!(emb.dims(), &[3, 32, 7]);
        let expected = model
            .unconditioned_embedding()
            .broadcast_as((3, 32, 7))
            .unwrap();
        let diff: f32 = (emb - expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn code_embedding_stretches_prior() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = TransformerDiffusion::new(&small_config(), vb).unwrap();
        let prior = Tensor::randn(0f32, 1.0, (1, 12, 4), &dev).unwrap();
        let emb = model.code_embedding(Some(&prior), 1, 16, false, false).unwrap();
        assert_eq!(emb.dims(), &[1, 32, 16]);
        // Every source frame covers four consecutive output frames.
        let a = emb.narrow(2, 0, 1).unwrap();
        let b = emb.narrow(2, 3, 1).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn conditioning_dropout_respects_draw() {
        let dev = Device::Cpu;
        let code = Tensor::ones((3, 4, 5), DType::F32, &dev).unwrap();
        let uncond = Tensor::full(-2f32, (1, 4, 1), &dev).unwrap();
        let draw = Tensor::new(&[[[0.05f32]], [[0.5]], [[0.09]]], &dev).unwrap();
        let out = ConditioningDropout::new(0.1)
            .apply_with_draw(&code, &uncond, &draw)
            .unwrap();
        let firsts: Vec<f32> = out
            .narrow(1, 0, 1)
            .unwrap()
            .narrow(2, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(firsts, vec![-2.0, 1.0, -2.0]);
    }

    #[test]
    fn conditioning_dropout_extremes() {
        let dev = Device::Cpu;
        let code = Tensor::ones((4, 2, 3), DType::F32, &dev).unwrap();
        let uncond = Tensor::zeros((1, 2, 1), DType::F32, &dev).unwrap();

        let kept = ConditioningDropout::new(0.0).apply(&code, &uncond).unwrap();
        let sum: f32 = kept.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 24.0);

        let dropped = ConditioningDropout::new(1.0).apply(&code, &uncond).unwrap();
        let sum: f32 = dropped.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn unconditioned_embedding_receives_gradient() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = DiffusionConfig {
            unconditioned_percentage: 0.0,
            ..small_config()
        };
        let model = TransformerDiffusion::new(&config, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 8, 6), &dev).unwrap();
        let ts = Tensor::new(&[5u32], &dev).unwrap();
        let prior = Tensor::randn(0f32, 1.0, (1, 12, 6), &dev).unwrap();
        let out = model.forward_t(&x, &ts, Some(&prior), false, true).unwrap();
        let grads = out.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(model.unconditioned_embedding()).is_some());
    }

    #[test]
    fn fp16_keeps_output_head_in_f32() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let config = DiffusionConfig {
            use_fp16: true,
            ..small_config()
        };
        let vb = VarBuilder::from_varmap(&varmap, config.dtype(), &dev);
        TransformerDiffusion::new(&config, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in ["out.0.weight", "out.0.bias", "out.2.weight", "out.2.bias"] {
            assert_eq!(data[name].dtype(), DType::F32, "{name}");
        }
        assert_eq!(data["inp_block.weight"].dtype(), DType::F16);
        assert_eq!(data["layers.0.out.weight"].dtype(), DType::F16);
    }
}
