//! Cheater-latent transformer diffusion for music mel spectrograms.
//!
//! A candle-based denoiser that predicts noise for 256-channel mel-like
//! sequences, conditioned on a latent code extracted from the clean mel by a
//! 16x residual encoder.
//!
//! ## Architecture
//!
//! ```text
//! truth mel → ResEncoder16x ──→ cheater latent (T/16)
//!                                     ↓ input_converter, nearest stretch
//! noisy x → inp_block ──→ intg(concat) ──→ N × ConcatAttentionBlock ──→ out
//!                                            ↑ timestep prefix token
//! ```
//!
//! ## Modules
//!
//! - [`audio`] — WAV input and log-mel front end
//! - [`config`] — model configuration and training-options parsing
//! - [`model`] — denoiser, encoder, cheater wrapper and training bookkeeping
//! - [`scheduler`] — Gaussian diffusion schedule and DDIM steps
//! - [`pipeline`] — classifier-free guided sampling
//! - [`train`] — noise-prediction training step

pub mod audio;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod train;

mod error;

pub use error::{Error, Result};
