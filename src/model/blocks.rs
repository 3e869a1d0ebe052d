//! Concatenation-based attention blocks that make up the diffusion trunk.
//!
//! The block embedding (projected timestep) is prepended to the sequence as
//! extra tokens, attention runs over `[prefix | x]`, and the prefix is
//! stripped afterwards so the output lines up with `x` again:
//!
//! ```text
//! SubBlock(x [B, I, T], blk [B, E, P]):
//!   a = attn(cat_T[proj(blk), x])[.., P..]       [B, C, T]
//!   a = gelu(norm(a))
//!   h = cat_C[a, x]                              [B, I+C, T]
//!   f = gelu(norm(conv3(h)))                     [B, C, T]
//!   → cat_C[h, f]                                [B, I+2C, T]
//!
//! ConcatAttentionBlock(x [B, D, T]):
//!   h = block2(block1(prenorm(x)))               [B, D+4C, T]
//!   → x + out(h[:, D..])
//! ```

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{self as nn, Conv1d, Conv1dConfig, Dropout, GroupNorm, VarBuilder};

use super::attention::AttentionBlock;
use super::nn::zero_conv1d;

/// Attention + convolutional feed-forward, each appending channels.
#[derive(Debug, Clone)]
pub struct SubBlock {
    blk_emb_proj: Conv1d,
    attn: AttentionBlock,
    attnorm: GroupNorm,
    ff: Conv1d,
    ffnorm: GroupNorm,
    dropout: Dropout,
}

impl SubBlock {
    pub fn new(
        inp_dim: usize,
        contraction_dim: usize,
        blk_dim: usize,
        heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let blk_emb_proj = nn::conv1d(
            blk_dim,
            inp_dim,
            1,
            Default::default(),
            vb.pp("blk_emb_proj"),
        )?;
        let attn = AttentionBlock::new(inp_dim, contraction_dim, heads, vb.pp("attn"))?;
        let attnorm = nn::group_norm(8, contraction_dim, 1e-5, vb.pp("attnorm"))?;
        let ff_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let ff = nn::conv1d(inp_dim + contraction_dim, contraction_dim, 3, ff_cfg, vb.pp("ff"))?;
        let ffnorm = nn::group_norm(8, contraction_dim, 1e-5, vb.pp("ffnorm"))?;
        Ok(Self {
            blk_emb_proj,
            attn,
            attnorm,
            ff,
            ffnorm,
            dropout: Dropout::new(dropout),
        })
    }

    /// - `x`: `[B, inp_dim, T]`
    /// - `blk_emb`: `[B, blk_dim, P]`
    /// - `mask`: additive `[P + T, P + T]`
    ///
    /// Returns `[B, inp_dim + 2 * contraction_dim, T]`.
    pub fn forward(
        &self,
        x: &Tensor,
        blk_emb: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let prefix_len = blk_emb.dim(2)?;
        let seq_len = x.dim(2)?;

        let blk_enc = self.blk_emb_proj.forward(blk_emb)?;
        let ah = self
            .attn
            .forward(&Tensor::cat(&[&blk_enc, x], 2)?, mask)?;
        let ah = self.dropout.forward_t(&ah, train)?;
        // Strip the block-embedding prefix to realign with x.
        let ah = ah.narrow(2, prefix_len, seq_len)?;
        let ah = self.attnorm.forward(&ah)?.gelu_erf()?;

        let h = Tensor::cat(&[&ah, x], 1)?;
        let hf = self.dropout.forward_t(&self.ff.forward(&h)?, train)?;
        let hf = self.ffnorm.forward(&hf)?.gelu_erf()?;
        Tensor::cat(&[&h, &hf], 1)
    }
}

/// Two stacked sub-blocks with a zero-initialised residual projection.
#[derive(Debug, Clone)]
pub struct ConcatAttentionBlock {
    prenorm: GroupNorm,
    block1: SubBlock,
    block2: SubBlock,
    out: Conv1d,
    trunk_dim: usize,
}

impl ConcatAttentionBlock {
    pub fn new(
        trunk_dim: usize,
        contraction_dim: usize,
        heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let prenorm = nn::group_norm(8, trunk_dim, 1e-5, vb.pp("prenorm"))?;
        let block1 = SubBlock::new(
            trunk_dim,
            contraction_dim,
            trunk_dim,
            heads,
            dropout,
            vb.pp("block1"),
        )?;
        let block2 = SubBlock::new(
            trunk_dim + contraction_dim * 2,
            contraction_dim,
            trunk_dim,
            heads,
            dropout,
            vb.pp("block2"),
        )?;
        let out = zero_conv1d(
            contraction_dim * 4,
            trunk_dim,
            1,
            Default::default(),
            false,
            vb.pp("out"),
        )?;
        Ok(Self {
            prenorm,
            block1,
            block2,
            out,
            trunk_dim,
        })
    }

    /// `x`: `[B, trunk_dim, T]`, `blk_emb`: `[B, trunk_dim, P]` → `[B, trunk_dim, T]`.
    pub fn forward(
        &self,
        x: &Tensor,
        blk_emb: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let h = self.prenorm.forward(x)?;
        let h = self.block1.forward(&h, blk_emb, mask, train)?;
        let h = self.block2.forward(&h, blk_emb, mask, train)?;
        // Only the channels appended by the sub-blocks feed the projection.
        let appended = h.dim(1)? - self.trunk_dim;
        let h = self.out.forward(&h.narrow(1, self.trunk_dim, appended)?)?;
        h + x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::local_attention_bias;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn sub_block_appends_two_contractions() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let block = SubBlock::new(32, 16, 24, 2, 0.0, vb.pp("sub")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 32, 10), &dev).unwrap();
        let blk = Tensor::randn(0f32, 1.0, (2, 24, 1), &dev).unwrap();
        let mask = local_attention_bias(11, 3, 1, DType::F32, &dev).unwrap();
        let y = block.forward(&x, &blk, Some(&mask), false).unwrap();
        assert_eq!(y.dims(), &[2, 32 + 2 * 16, 10]);
    }

    #[test]
    fn sub_block_passes_input_through() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = SubBlock::new(16, 8, 16, 2, 0.0, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 16, 6), &dev).unwrap();
        let blk = Tensor::randn(0f32, 1.0, (1, 16, 1), &dev).unwrap();
        let y = block.forward(&x, &blk, None, false).unwrap();
        // Channels [8, 24) are the untouched input.
        let passthrough = y.narrow(1, 8, 16).unwrap();
        let diff: f32 = (passthrough - &x)
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
    fn fresh_block_is_identity() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = ConcatAttentionBlock::new(32, 16, 2, 0.0, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 32, 7), &dev).unwrap();
        let blk = Tensor::randn(0f32, 1.0, (2, 32, 1), &dev).unwrap();
        let mask = local_attention_bias(8, 48, 1, DType::F32, &dev).unwrap();
        let y = block.forward(&x, &blk, Some(&mask), true).unwrap();
        assert_eq!(y.dims(), x.dims());
        // The output projection starts at zero, so the block is a residual no-op.
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
