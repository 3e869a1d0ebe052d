//! tfd: inspect, train and sample the cheater-latent music diffusion models.
//!
//! Every command takes the network section of a training options file
//! (`{"which_model_G": "...", "kwargs": {...}}`) via `--options`.
//!
//! ```text
//! tfd inspect --options net.json
//! tfd train --options net.json --wav a.wav --wav b.wav --steps 200 --output model.safetensors
//! tfd encode --options net.json --weights encoder.safetensors --wav ref.wav --output latent.safetensors
//! tfd sample --options net.json --weights model.safetensors --wav ref.wav --output mel.safetensors
//! tfd extract-encoder --weights model.safetensors --output encoder.safetensors
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};

use tfd_cheater::{
    audio::{read_mono, MelConfig, MelSpectrogram},
    config::{CheaterConfig, ModelOptions},
    model::{
        cheater::ENCODER_PREFIX,
        encoder::{ResEncoder16x, DOWNSAMPLE_FACTOR},
        params::{count_elements, extract_prefixed_tensors},
        registry::ModelSpec,
        Denoiser,
    },
    pipeline::{SamplingParams, Sampler, DEFAULT_GUIDANCE_SCALE},
    scheduler::SchedulerConfig,
    train::{Trainer, TrainerConfig, TrainingBatch},
};

/// Tensor name used for latents and mels written by this tool.
const LATENT_KEY: &str = "latent";
const MEL_KEY: &str = "mel";

#[derive(Parser, Debug)]
#[command(name = "tfd", about = "Cheater-latent transformer diffusion for music mels")]
struct Args {
    /// Run on the CPU even when an accelerator is available.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print parameter counts per group.
    Inspect {
        #[arg(long)]
        options: PathBuf,
    },

    /// Train the cheater model on wav clips.
    Train {
        #[arg(long)]
        options: PathBuf,

        /// Training clips; may be repeated.
        #[arg(long, required = true)]
        wav: Vec<PathBuf>,

        /// Checkpoint to resume from.
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Training step the resumed run continues from; drives encoder freezing.
        #[arg(long, default_value_t = 0)]
        start_step: u64,

        #[arg(long, default_value_t = 100)]
        steps: u64,

        /// Mel frames per training example; rounded down to a multiple of 16.
        #[arg(long, default_value_t = 256)]
        clip_frames: usize,

        #[arg(long, default_value_t = 1e-4)]
        lr: f64,

        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Encode a wav into its cheater latent.
    Encode {
        #[arg(long)]
        options: PathBuf,

        /// Encoder weights (as written by `extract-encoder`) or a full checkpoint.
        #[arg(long)]
        weights: PathBuf,

        #[arg(long)]
        wav: PathBuf,

        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Sample a mel with guided DDIM.
    Sample {
        #[arg(long)]
        options: PathBuf,

        /// Model checkpoint. Omit to sample from a freshly initialised model.
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Reference wav conditioning the cheater model.
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Prior latent (`latent` tensor) conditioning the plain model.
        #[arg(long)]
        prior: Option<PathBuf>,

        /// Output frames; defaults to the reference length.
        #[arg(long)]
        frames: Option<usize>,

        #[arg(long, default_value_t = 50)]
        steps: usize,

        #[arg(long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
        guidance_scale: f64,

        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Copy the encoder tensors of a cheater checkpoint into their own file.
    ExtractEncoder {
        #[arg(long)]
        weights: PathBuf,

        #[arg(long, short = 'o')]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    tracing::info!("Using device: {:?}", device);

    match args.command {
        Command::Inspect { options } => inspect(&options),
        Command::Train {
            options,
            wav,
            resume,
            start_step,
            steps,
            clip_frames,
            lr,
            output,
        } => train(
            &options,
            &wav,
            resume.as_deref(),
            start_step,
            steps,
            clip_frames,
            lr,
            &output,
            &device,
        ),
        Command::Encode {
            options,
            weights,
            wav,
            output,
        } => encode(&options, &weights, &wav, &output, &device),
        Command::Sample {
            options,
            weights,
            wav,
            prior,
            frames,
            steps,
            guidance_scale,
            output,
        } => {
            let params = SamplingParams {
                steps,
                guidance_scale,
            };
            sample(
                &options,
                weights.as_deref(),
                wav.as_deref(),
                prior.as_deref(),
                frames,
                &params,
                &output,
                &device,
            )
        }
        Command::ExtractEncoder { weights, output } => {
            let count = extract_prefixed_tensors(&weights, &output, ENCODER_PREFIX)?;
            println!("{count} tensors -> {}", output.display());
            Ok(())
        }
    }
}

fn load_spec(path: &Path) -> anyhow::Result<ModelSpec> {
    let options = ModelOptions::from_json_file(path)
        .with_context(|| format!("reading options {}", path.display()))?;
    Ok(ModelSpec::from_options(&options)?)
}

fn cheater_config(spec: &ModelSpec) -> anyhow::Result<&CheaterConfig> {
    match spec {
        ModelSpec::Cheater(config) => Ok(config),
        ModelSpec::Diffusion(_) => anyhow::bail!(
            "{} has no cheater encoder",
            spec.kind().name()
        ),
    }
}

fn mmaped(weights: &Path, dtype: DType, device: &Device) -> anyhow::Result<VarBuilder<'static>> {
    tracing::info!("Loading weights from {}", weights.display());
    // SAFETY: the checkpoint is not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
    Ok(vb)
}

/// Log-mel of a wav with `n_mels` bins, cropped to a multiple of 16 frames.
fn wav_mel(path: &Path, n_mels: usize, device: &Device) -> anyhow::Result<Tensor> {
    let mel = MelSpectrogram::new(MelConfig {
        n_mels,
        ..MelConfig::default()
    })?;
    let samples = read_mono(path, mel.config().sample_rate)
        .with_context(|| format!("reading {}", path.display()))?;
    let mel = mel.mel_tensor(&samples, device)?;
    let frames = mel.dim(2)? / DOWNSAMPLE_FACTOR * DOWNSAMPLE_FACTOR;
    if frames == 0 {
        anyhow::bail!("{} is shorter than {DOWNSAMPLE_FACTOR} mel frames", path.display());
    }
    Ok(mel.narrow(2, 0, frames)?)
}

fn inspect(options: &Path) -> anyhow::Result<()> {
    let spec = load_spec(options)?;
    let varmap = VarMap::new();
    let model = spec.build(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu))?;

    println!("model: {}", spec.kind().name());
    println!("total: {}", count_elements(&varmap.all_vars()));
    println!("trainable: {}", count_elements(&model.trainable_vars(&varmap)?));
    for (group, vars) in model.parameter_groups(&varmap)? {
        println!("  {group}: {} ({} tensors)", count_elements(&vars), vars.len());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn train(
    options: &Path,
    wavs: &[PathBuf],
    resume: Option<&Path>,
    start_step: u64,
    steps: u64,
    clip_frames: usize,
    lr: f64,
    output: &Path,
    device: &Device,
) -> anyhow::Result<()> {
    let spec = load_spec(options)?;
    let config = cheater_config(&spec)?;
    let spec_dim = config.encoder.spec_dim;
    if spec_dim != config.diffusion.in_channels {
        anyhow::bail!(
            "training on mels needs spec_dim ({spec_dim}) == in_channels ({})",
            config.diffusion.in_channels
        );
    }
    let clip_frames = clip_frames / DOWNSAMPLE_FACTOR * DOWNSAMPLE_FACTOR;
    if clip_frames == 0 {
        anyhow::bail!("clip_frames must be at least {DOWNSAMPLE_FACTOR}");
    }

    let mut clips = Vec::new();
    for path in wavs {
        let mel = wav_mel(path, spec_dim, device)?;
        let frames = mel.dim(2)?;
        for start in (0..frames.saturating_sub(clip_frames - 1)).step_by(clip_frames) {
            clips.push(mel.narrow(2, start, clip_frames)?);
        }
    }
    if clips.is_empty() {
        anyhow::bail!("no clip of {clip_frames} frames in the given wavs");
    }
    tracing::info!(clips = clips.len(), clip_frames, "loaded training data");

    let trainer_config = TrainerConfig {
        learning_rate: lr,
        ..TrainerConfig::default()
    };
    let mut trainer = Trainer::new(&spec, &trainer_config, device)?;
    if let Some(resume) = resume {
        trainer.load_weights(resume)?;
    }
    trainer.set_step_count(start_step);

    for i in 0..steps {
        let mel = &clips[i as usize % clips.len()];
        let batch = TrainingBatch {
            x0: mel.clone(),
            cond: mel.clone(),
        };
        let report = trainer.step(&batch)?;
        if report.step % 10 == 0 || i + 1 == steps {
            let out_norm = report.grad_norms.get("out").copied().unwrap_or(0.0);
            tracing::info!(step = report.step, loss = report.loss, out_grad = out_norm, "train");
        }
    }

    trainer.save_weights(output)?;
    println!("{} steps -> {}", trainer.step_count(), output.display());
    Ok(())
}

fn encode(
    options: &Path,
    weights: &Path,
    wav: &Path,
    output: &Path,
    device: &Device,
) -> anyhow::Result<()> {
    let spec = load_spec(options)?;
    let config = cheater_config(&spec)?;
    let vb = mmaped(weights, spec.dtype(), device)?;
    let encoder = ResEncoder16x::new(&config.encoder, vb.pp("encoder"))?;

    let mel = wav_mel(wav, config.encoder.spec_dim, device)?.to_dtype(spec.dtype())?;
    let latent = encoder.forward(&mel)?.to_dtype(DType::F32)?;
    tracing::info!(shape = ?latent.dims(), "encoded");

    let tensors = HashMap::from([(LATENT_KEY.to_string(), latent)]);
    candle_core::safetensors::save(&tensors, output)?;
    println!("{}", output.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn sample(
    options: &Path,
    weights: Option<&Path>,
    wav: Option<&Path>,
    prior: Option<&Path>,
    frames: Option<usize>,
    params: &SamplingParams,
    output: &Path,
    device: &Device,
) -> anyhow::Result<()> {
    let spec = load_spec(options)?;
    let dtype = spec.dtype();

    let varmap = VarMap::new();
    let vb = match weights {
        Some(weights) => mmaped(weights, dtype, device)?,
        None => {
            tracing::warn!("no weights given, sampling from a freshly initialised model");
            VarBuilder::from_varmap(&varmap, dtype, device)
        }
    };
    let model = spec.build(vb)?;

    let (cond, reference_frames) = match &spec {
        ModelSpec::Cheater(config) => {
            let wav = wav.context("the cheater model is conditioned on --wav")?;
            let mel = wav_mel(wav, config.encoder.spec_dim, device)?;
            let frames = mel.dim(2)?;
            (mel, frames)
        }
        ModelSpec::Diffusion(_) => {
            let prior = prior.context("the plain model is conditioned on --prior")?;
            let tensors = candle_core::safetensors::load(prior, device)?;
            let latent = tensors
                .get(LATENT_KEY)
                .with_context(|| format!("no {LATENT_KEY:?} tensor in {}", prior.display()))?
                .clone();
            let frames = latent.dim(2)? * DOWNSAMPLE_FACTOR;
            (latent, frames)
        }
    };
    let frames = frames.unwrap_or(reference_frames);

    let mut sampler = Sampler::new(&SchedulerConfig::default())?;
    let mel = sampler.sample(model.as_ref(), &cond, 1, frames, params)?;
    tracing::info!(shape = ?mel.dims(), steps = params.steps, "sampled");

    let tensors = HashMap::from([(MEL_KEY.to_string(), mel)]);
    candle_core::safetensors::save(&tensors, output)?;
    println!("{}", output.display());
    Ok(())
}
