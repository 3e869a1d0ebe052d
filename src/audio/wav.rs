//! WAV input, mixed down to mono.

use crate::Result;
use std::path::Path;

/// Read a WAV file, return (samples, sample_rate, num_channels).
///
/// Samples are interleaved f32 in [-1, 1].
pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32, u16)> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok((samples, spec.sample_rate, spec.channels))
}

/// Average interleaved channels into one.
pub fn mixdown(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampling of a mono signal.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as f64 * ratio).ceil() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 / ratio;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            let s0 = samples.get(idx).copied().unwrap_or(0.0);
            let s1 = samples.get(idx + 1).copied().unwrap_or(s0);
            (s0 as f64 * (1.0 - frac) + s1 as f64 * frac) as f32
        })
        .collect()
}

/// Read a WAV file as mono at `sample_rate`.
pub fn read_mono(path: impl AsRef<Path>, sample_rate: u32) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let (samples, sr, channels) = read_wav(path)?;
    let mono = mixdown(&samples, channels);
    if sr != sample_rate {
        tracing::debug!(from = sr, to = sample_rate, "resampling {}", path.display());
    }
    Ok(resample_linear(&mono, sr, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_stereo_i16(path: &Path, frames: &[(i16, i16)], sample_rate: u32) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &(l, r) in frames {
            writer.write_sample(l).unwrap();
            writer.write_sample(r).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn reads_int_wav_and_mixes_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        write_stereo_i16(&path, &[(16384, 0), (-16384, -16384), (0, 32767)], 22050);

        let (samples, sr, ch) = read_wav(&path).unwrap();
        assert_eq!(sr, 22050);
        assert_eq!(ch, 2);
        assert_eq!(samples.len(), 6);
        assert!((samples[0] - 0.5).abs() < 1e-4);

        let mono = read_mono(&path, 22050).unwrap();
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.25).abs() < 1e-4);
        assert!((mono[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn mixdown_mono_is_identity() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(mixdown(&samples, 1), samples);
    }

    #[test]
    fn resample_changes_length() {
        let samples: Vec<f32> = (0..441).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 44100, 22050);
        assert_eq!(out.len(), 221);
        assert!((out[10] - 20.0).abs() < 1e-4);
        assert_eq!(resample_linear(&samples, 22050, 22050), samples);
    }
}
