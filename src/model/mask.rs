//! Local attention masks.
//!
//! Additive masks with 0.0 for visible positions and the dtype minimum for
//! masked ones. Attention is bidirectional within a window, and every query
//! can always see the first `fixed_region` keys (the block embedding prefix).

use candle_core::{DType, Device, Result, Tensor};

/// Most negative finite value of `dtype`, used as the masked bias.
pub fn mask_min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Whether query `i` may attend to key `j`.
pub fn is_visible(i: usize, j: usize, window: usize, fixed_region: usize) -> bool {
    j < fixed_region || i.abs_diff(j) <= window
}

/// Build a `[seq_len, seq_len]` additive local attention mask.
pub fn local_attention_bias(
    seq_len: usize,
    window: usize,
    fixed_region: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let min_val = mask_min_value(dtype);
    let mut mask_data = vec![0.0f64; seq_len * seq_len];
    for i in 0..seq_len {
        for j in 0..seq_len {
            if !is_visible(i, j, window, fixed_region) {
                mask_data[i * seq_len + j] = min_val;
            }
        }
    }
    Tensor::from_vec(mask_data, (seq_len, seq_len), device)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_region_always_visible() {
        let mask = local_attention_bias(8, 1, 1, DType::F32, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        for row in &rows {
            assert_eq!(row[0], 0.0);
        }
        // Row 7 sees 6, 7 and the prefix, nothing else.
        assert_eq!(rows[7][6], 0.0);
        assert_eq!(rows[7][7], 0.0);
        assert!(rows[7][5] < -1e30);
        assert!(rows[7][1] < -1e30);
    }

    #[test]
    fn window_is_symmetric() {
        let mask = local_attention_bias(10, 2, 0, DType::F32, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        for i in 0..10 {
            for j in 0..10 {
                assert_eq!(rows[i][j], rows[j][i]);
            }
        }
        assert_eq!(rows[4][2], 0.0);
        assert!(rows[4][1] < -1e30);
    }

    #[test]
    fn wide_window_masks_nothing() {
        let mask = local_attention_bias(5, 48, 1, DType::F32, &Device::Cpu).unwrap();
        let sum: f32 = mask.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
