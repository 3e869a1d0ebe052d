//! Channel-first multi-head self-attention block.
//!
//! ```text
//! x [B, C, T] → GroupNorm → Conv1d(C, 3·O, 1) → split heads → softmax(qᵀk/√d) → v
//!             → zero Conv1d(O, O, 1) → + x_proj(x)
//! ```
//!
//! The qkv projection uses the legacy layout: the `3·O` channels are viewed
//! as `[heads, 3, head_dim]`, so each head owns a contiguous q/k/v triple.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{self as nn, Conv1d, GroupNorm, VarBuilder};

use super::nn::{normalization, zero_conv1d};

/// Self-attention over the time axis with an optional additive mask.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
    norm: GroupNorm,
    qkv: Conv1d,
    /// Residual projection, present only when `out_channels != channels`.
    x_proj: Option<Conv1d>,
    proj_out: Conv1d,
    num_heads: usize,
    out_channels: usize,
}

impl AttentionBlock {
    pub fn new(
        channels: usize,
        out_channels: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 || out_channels % num_heads != 0 {
            candle_core::bail!(
                "attention width {out_channels} is not divisible by {num_heads} heads"
            );
        }
        let norm = normalization(channels, vb.pp("norm"))?;
        let qkv = nn::conv1d(
            channels,
            out_channels * 3,
            1,
            Default::default(),
            vb.pp("qkv"),
        )?;
        let x_proj = if out_channels != channels {
            Some(nn::conv1d(
                channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("x_proj"),
            )?)
        } else {
            None
        };
        let proj_out = zero_conv1d(
            out_channels,
            out_channels,
            1,
            Default::default(),
            true,
            vb.pp("proj_out"),
        )?;
        Ok(Self {
            norm,
            qkv,
            x_proj,
            proj_out,
            num_heads,
            out_channels,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, C, T]`
    /// - `bias`: optional additive mask `[T, T]` (query rows, key columns)
    ///
    /// Returns `[B, out_channels, T]`.
    pub fn forward(&self, x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (batch, _channels, seq_len) = x.dims3()?;
        let head_dim = self.out_channels / self.num_heads;

        let qkv = self.norm.forward(x)?.apply(&self.qkv)?; // [B, 3·O, T]
        let qkv = qkv.reshape((batch * self.num_heads, 3 * head_dim, seq_len))?;
        let q = qkv.narrow(1, 0, head_dim)?; // [BH, D, T]
        let k = qkv.narrow(1, head_dim, head_dim)?;
        let v = qkv.narrow(1, 2 * head_dim, head_dim)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        // weights[t, s] = Σ_d q[d, t] · k[d, s]
        let weights = (q.transpose(1, 2)?.contiguous()?.matmul(&k.contiguous()?)? * scale)?;
        let weights = match bias {
            Some(bias) => weights.broadcast_add(&bias.to_dtype(weights.dtype())?)?,
            None => weights,
        };

        // Softmax in f32 regardless of activation dtype.
        let dtype = weights.dtype();
        let weights = nn::ops::softmax_last_dim(&weights.to_dtype(DType::F32)?)?.to_dtype(dtype)?;

        // out[d, t] = Σ_s v[d, s] · weights[t, s]
        let out = v.contiguous()?.matmul(&weights.t()?.contiguous()?)?; // [BH, D, T]
        let out = out
            .reshape((batch, self.out_channels, seq_len))?
            .apply(&self.proj_out)?;

        match &self.x_proj {
            Some(proj) => x.apply(proj)? + out,
            None => x + out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::local_attention_bias;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn projects_to_out_channels() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = AttentionBlock::new(32, 16, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 32, 12), &device).unwrap();
        let y = attn.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[2, 16, 12]);
    }

    #[test]
    fn zero_output_projection_leaves_residual() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        // Same width: identity residual, and proj_out starts at zero.
        let attn = AttentionBlock::new(16, 16, 2, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 16, 9), &device).unwrap();
        let bias = local_attention_bias(9, 2, 1, DType::F32, &device).unwrap();
        let y = attn.forward(&x, Some(&bias)).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn mask_changes_output_only_when_restrictive() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let attn = AttentionBlock::new(16, 16, 2, vb).unwrap();
        // Give proj_out non-zero weights so attention reaches the output.
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.starts_with("proj_out") {
                let ones = var.ones_like().unwrap();
                var.set(&ones).unwrap();
            }
        }
        let x = Tensor::randn(0f32, 1.0, (1, 16, 8), &device).unwrap();
        let unmasked = attn.forward(&x, None).unwrap();

        let wide = local_attention_bias(8, 8, 0, DType::F32, &device).unwrap();
        let same = attn.forward(&x, Some(&wide)).unwrap();
        let diff: f32 = (&unmasked - &same)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);

        let narrow = local_attention_bias(8, 0, 0, DType::F32, &device).unwrap();
        let local = attn.forward(&x, Some(&narrow)).unwrap();
        let diff: f32 = (&unmasked - &local)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 1e-4);
    }
}
