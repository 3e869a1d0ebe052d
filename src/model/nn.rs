//! Shared building blocks: timestep embedding, group-norm sizing,
//! zero-initialised convolutions and nearest-neighbour resampling.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{self as nn, Conv1d, Conv1dConfig, GroupNorm, Init, VarBuilder};

/// Sinusoidal timestep embedding.
///
/// `t`: `[B]` (any numeric dtype) → `[B, dim]` F32 laid out as `[cos | sin]`.
/// Odd `dim` gets one trailing zero column.
pub fn timestep_embedding(t: &Tensor, dim: usize, max_period: f64) -> Result<Tensor> {
    let dev = t.device();
    let half = dim / 2;

    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::new(freqs.as_slice(), dev)?;

    let t = t.to_dtype(DType::F32)?;
    let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[&args.cos()?, &args.sin()?], 1)?;

    if dim % 2 == 1 {
        emb.pad_with_zeros(1, 0, 1)
    } else {
        Ok(emb)
    }
}

/// Group count used by the diffusion normalization layers.
///
/// 32 groups, 8 for tiny layers and 16 for small ones, halved until it
/// divides `channels`.
pub fn normalization_groups(channels: usize) -> usize {
    let mut groups = if channels <= 16 {
        8
    } else if channels <= 64 {
        16
    } else {
        32
    };
    while groups > 1 && channels % groups != 0 {
        groups /= 2;
    }
    groups
}

/// GroupNorm sized by [`normalization_groups`], eps 1e-5.
pub fn normalization(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    nn::group_norm(normalization_groups(channels), channels, 1e-5, vb)
}

/// Conv1d whose parameters start at zero when freshly created.
///
/// Weights present in a loaded checkpoint override the hint as usual.
pub fn zero_conv1d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv1dConfig,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let weight = vb.get_with_hints(
        (out_channels, in_channels / cfg.groups, kernel_size),
        "weight",
        Init::Const(0.0),
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Conv1d::new(weight, bias, cfg))
}

/// Conv1d with "same" padding for odd kernels.
pub fn conv1d_same(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding: kernel_size / 2,
        ..Default::default()
    };
    nn::conv1d(in_channels, out_channels, kernel_size, cfg, vb)
}

/// Nearest-neighbour resampling of `[B, C, T]` to `[B, C, size]`.
///
/// Source index for output `i` is `floor(i * T / size)`.
pub fn interpolate_nearest(x: &Tensor, size: usize) -> Result<Tensor> {
    let (_b, _c, len) = x.dims3()?;
    if len == size {
        return Ok(x.clone());
    }
    if len == 0 {
        candle_core::bail!("cannot interpolate an empty sequence to length {size}");
    }
    let index = nearest_indices(len, size, x.device())?;
    x.index_select(&index, 2)
}

fn nearest_indices(len: usize, size: usize, device: &Device) -> Result<Tensor> {
    let index: Vec<u32> = (0..size)
        .map(|i| ((i * len) / size).min(len - 1) as u32)
        .collect();
    Tensor::from_vec(index, size, device)
}

/// 1D average pool with kernel and stride 2 over `[B, C, T]`; odd tails drop.
pub fn avg_pool1d_2x(x: &Tensor) -> Result<Tensor> {
    x.unsqueeze(2)?.avg_pool2d((1, 2))?.squeeze(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestep_embedding_layout() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[0u32, 600], &dev).unwrap();
        let emb = timestep_embedding(&t, 8, 10000.0).unwrap();
        assert_eq!(emb.dims(), &[2, 8]);
        let rows: Vec<Vec<f32>> = emb.to_vec2().unwrap();
        // t = 0: cos half is 1, sin half is 0.
        assert_eq!(&rows[0][..4], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&rows[0][4..], &[0.0, 0.0, 0.0, 0.0]);
        // First frequency is 1.
        assert!((rows[1][0] - 600f32.cos()).abs() < 1e-4);
        assert!((rows[1][4] - 600f32.sin()).abs() < 1e-4);
    }

    #[test]
    fn timestep_embedding_odd_dim_pads() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[3.0f32], &dev).unwrap();
        let emb = timestep_embedding(&t, 7, 10000.0).unwrap();
        assert_eq!(emb.dims(), &[1, 7]);
        let row: Vec<f32> = emb.squeeze(0).unwrap().to_vec1().unwrap();
        assert_eq!(row[6], 0.0);
    }

    #[test]
    fn group_counts() {
        assert_eq!(normalization_groups(1024), 32);
        assert_eq!(normalization_groups(64), 16);
        assert_eq!(normalization_groups(16), 8);
        assert_eq!(normalization_groups(48), 16);
        assert_eq!(normalization_groups(96), 32);
        assert_eq!(normalization_groups(40), 8);
    }

    #[test]
    fn nearest_upsample_repeats() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[[1f32, 2., 3.]]], &dev).unwrap();
        let y = interpolate_nearest(&x, 6).unwrap();
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![1., 1., 2., 2., 3., 3.]);
    }

    #[test]
    fn nearest_non_integer_ratio() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[[10f32, 20., 30., 40.]]], &dev).unwrap();
        let y = interpolate_nearest(&x, 6).unwrap();
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        // floor(i * 4 / 6) = 0, 0, 1, 2, 2, 3
        assert_eq!(vals, vec![10., 10., 20., 30., 30., 40.]);
        let down = interpolate_nearest(&x, 2).unwrap();
        let vals: Vec<f32> = down.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![10., 30.]);
    }

    #[test]
    fn zero_conv_outputs_zero() {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let conv = zero_conv1d(4, 3, 3, Conv1dConfig { padding: 1, ..Default::default() }, true, vb)
            .unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 5), &dev).unwrap();
        let y = candle_core::Module::forward(&conv, &x).unwrap();
        assert_eq!(y.dims(), &[2, 3, 5]);
        let total: f32 = y.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn avg_pool_halves() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[[1f32, 3., 5., 7., 9.]]], &dev).unwrap();
        let y = avg_pool1d_2x(&x).unwrap();
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![2., 6.]);
    }
}
