//! Audio input: WAV decoding and the log-mel front end.

mod mel;
mod wav;

pub use mel::{MelConfig, MelSpectrogram};
pub use wav::{mixdown, read_mono, read_wav, resample_linear};
