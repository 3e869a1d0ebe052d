//! Log-mel front end feeding the cheater encoder.
//!
//! - Sample rate: 22050 Hz
//! - FFT size and window: 1024, Hann
//! - Hop length: 256
//! - Mel bins: 256, range 0–11025 Hz, Slaney scale and norm
//! - Centered frames: reflect padding of `n_fft / 2` on both sides
//! - Power spectrum, then `ln(clamp(mel, min=1e-5))`

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Log floor before `ln`.
const LOG_CLAMP: f64 = 1e-5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MelConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,
    #[serde(default)]
    pub f_min: f64,
    #[serde(default = "default_f_max")]
    pub f_max: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            n_fft: default_n_fft(),
            hop_length: default_hop_length(),
            n_mels: default_n_mels(),
            f_min: 0.0,
            f_max: default_f_max(),
        }
    }
}

fn default_sample_rate() -> u32 {
    22050
}
fn default_n_fft() -> usize {
    1024
}
fn default_hop_length() -> usize {
    256
}
fn default_n_mels() -> usize {
    256
}
fn default_f_max() -> f64 {
    11025.0
}

impl MelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_fft < 2 || self.hop_length == 0 || self.n_mels == 0 {
            return Err(Error::Config(
                "n_fft must be >= 2, hop_length and n_mels > 0".into(),
            ));
        }
        let nyquist = self.sample_rate as f64 / 2.0;
        if !(0.0..self.f_max).contains(&self.f_min) || self.f_max > nyquist {
            return Err(Error::Config(format!(
                "mel range {}..{} Hz invalid for {} Hz audio",
                self.f_min, self.f_max, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Mel spectrogram processor.
///
/// Pre-computes the Hann window, FFT plan and filterbank on construction.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: Arc<dyn rustfft::Fft<f64>>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Result<Self> {
        config.validate()?;
        let window = hann_window(config.n_fft);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);
        Ok(Self {
            config,
            window,
            filterbank,
            fft,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of frames produced for `num_samples` input samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        num_samples / self.config.hop_length + 1
    }

    /// Log-mel spectrogram `[n_mels][num_frames]` of mono samples.
    pub fn process(&self, samples: &[f32]) -> Result<Vec<Vec<f64>>> {
        if samples.len() < 2 {
            return Err(Error::Audio(format!(
                "need at least 2 samples, got {}",
                samples.len()
            )));
        }
        let samples: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&samples, pad, pad);
        let power = self.stft_power(&padded);

        let mut mel = vec![vec![0.0; power.len()]; self.config.n_mels];
        for (frame_idx, frame) in power.iter().enumerate() {
            for (mel_idx, filter) in self.filterbank.iter().enumerate() {
                let sum: f64 = filter
                    .iter()
                    .zip(frame)
                    .filter(|(w, _)| **w > 0.0)
                    .map(|(w, p)| w * p)
                    .sum();
                mel[mel_idx][frame_idx] = sum.max(LOG_CLAMP).ln();
            }
        }
        Ok(mel)
    }

    /// Log-mel spectrogram as a `[1, n_mels, frames]` F32 tensor.
    pub fn mel_tensor(&self, samples: &[f32], device: &Device) -> Result<Tensor> {
        let mel = self.process(samples)?;
        let frames = mel.first().map_or(0, Vec::len);
        let flat: Vec<f32> = mel.into_iter().flatten().map(|v| v as f32).collect();
        Ok(Tensor::from_vec(
            flat,
            (1, self.config.n_mels, frames),
            device,
        )?)
    }

    /// One-sided power spectra, one per frame.
    fn stft_power(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;
        let num_frames = padded.len().saturating_sub(n_fft) / hop + 1;

        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        (0..num_frames)
            .map(|frame_idx| {
                let start = frame_idx * hop;
                for (i, slot) in buffer.iter_mut().enumerate() {
                    *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
                }
                self.fft.process(&mut buffer);
                buffer[..num_bins].iter().map(|c| c.norm_sqr()).collect()
            })
            .collect()
    }
}

/// Periodic Hann window.
fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad without repeating the edge sample. Pads longer than the
/// signal bounce back and forth.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len() as isize;
    let period = 2 * (len - 1).max(1);
    let reflect = |i: isize| -> f64 {
        let m = i.rem_euclid(period);
        let idx = if m < len { m } else { period - m };
        signal[idx as usize]
    };
    (-(pad_left as isize)..len + pad_right as isize)
        .map(reflect)
        .collect()
}

/// Slaney-normalized triangular filters, `n_mels` × `n_fft/2 + 1`.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let (f_left, f_center, f_right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
            let norm = 2.0 / (f_right - f_left);
            bin_freqs
                .iter()
                .map(|&f| {
                    let up = (f - f_left) / (f_center - f_left);
                    let down = (f_right - f) / (f_right - f_center);
                    norm * up.min(down).max(0.0)
                })
                .collect()
        })
        .collect()
}

/// Hz → Slaney mel: linear below 1 kHz, logarithmic above.
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}
