//! Training step for the denoisers.
//!
//! Each step noises the clean batch at uniformly drawn timesteps, predicts
//! the noise with the model in training mode and minimises the MSE on the
//! mean half of the output. Between backward and the optimizer step the
//! gradients of frozen variables are dropped and the model's own gradient
//! adjustments are applied.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::model::params::ParameterGroups;
use crate::model::registry::ModelSpec;
use crate::model::Denoiser;
use crate::scheduler::{GaussianDiffusion, SchedulerConfig};
use crate::{Error, Result};

/// Optimizer settings.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    0.01
}

/// One training example batch.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// Clean target `[B, in_channels, T]`.
    pub x0: Tensor,
    /// Conditioning input (prior latent or clean mel).
    pub cond: Tensor,
}

/// Result of one optimizer step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: u64,
    pub loss: f32,
    /// L2 norm of the gradients in each parameter group.
    pub grad_norms: BTreeMap<&'static str, f32>,
}

/// Owns the model variables, the model and its optimizer.
pub struct Trainer {
    varmap: VarMap,
    model: Box<dyn Denoiser>,
    diffusion: GaussianDiffusion,
    optimizer: AdamW,
    device: Device,
    step: u64,
}

impl Trainer {
    pub fn new(spec: &ModelSpec, config: &TrainerConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, spec.dtype(), device);
        let model = spec.build(vb)?;
        let diffusion = GaussianDiffusion::new(&config.scheduler)?;
        // Frozen variables are excluded per step by dropping their gradients.
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        tracing::info!(
            variables = varmap.all_vars().len(),
            lr = config.learning_rate,
            "trainer ready"
        );
        Ok(Self {
            varmap,
            model,
            diffusion,
            optimizer,
            device: device.clone(),
            step: 0,
        })
    }

    pub fn model(&self) -> &dyn Denoiser {
        self.model.as_ref()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Continue counting from `step`, e.g. when resuming from a checkpoint.
    /// Step-gated freezing follows this counter.
    pub fn set_step_count(&mut self, step: u64) {
        self.step = step;
        self.model.set_step(step);
    }

    /// Overwrite the variables from a safetensors checkpoint.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap
            .load(path.as_ref())
            .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.as_ref().display())))
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        Ok(self.varmap.save(path.as_ref())?)
    }

    /// Noise-prediction loss for `batch` at random timesteps.
    pub fn loss(&self, batch: &TrainingBatch) -> Result<Tensor> {
        let (b, channels, _t) = batch.x0.dims3()?;
        if channels != self.model.in_channels() {
            return Err(Error::Config(format!(
                "batch has {channels} channels, model expects {}",
                self.model.in_channels()
            )));
        }
        let timesteps = sample_timesteps(b, self.diffusion.num_timesteps(), &self.device)?;
        let steps: Vec<usize> = timesteps
            .to_vec1::<u32>()?
            .into_iter()
            .map(|t| t as usize)
            .collect();

        let x0 = batch.x0.to_dtype(DType::F32)?;
        let noise = x0.randn_like(0.0, 1.0)?;
        let x_t = self.diffusion.q_sample(&x0, &steps, &noise)?;

        let out = self
            .model
            .forward_t(&x_t, &timesteps, Some(&batch.cond), false, true)?;
        let eps = out.narrow(1, 0, channels)?;
        Ok(candle_nn::loss::mse(&eps, &noise)?)
    }

    /// One optimizer step.
    pub fn step(&mut self, batch: &TrainingBatch) -> Result<StepReport> {
        self.model.set_step(self.step);
        let loss = self.loss(batch)?;
        let mut grads = loss.backward()?;

        let trainable: HashSet<_> = self
            .model
            .trainable_vars(&self.varmap)?
            .iter()
            .map(|var| var.id())
            .collect();
        for var in self.varmap.all_vars() {
            if !trainable.contains(&var.id()) {
                grads.remove(var.as_tensor());
            }
        }

        self.model.before_step(&mut grads, &self.varmap)?;
        let groups = self.model.parameter_groups(&self.varmap)?;
        let grad_norms = group_grad_norms(&groups, &grads)?;
        self.optimizer.step(&grads)?;

        let loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        tracing::debug!(step = self.step, loss, "train step");
        let report = StepReport {
            step: self.step,
            loss,
            grad_norms,
        };
        self.step += 1;
        Ok(report)
    }
}

/// Uniform integer timesteps in `[0, num_timesteps)`, `[batch]` U32.
fn sample_timesteps(batch: usize, num_timesteps: usize, device: &Device) -> Result<Tensor> {
    let upper = num_timesteps as f32;
    let t = Tensor::rand(0f32, upper, batch, device)?
        .floor()?
        .clamp(0f32, upper - 1.0)?;
    Ok(t.to_dtype(DType::U32)?)
}

/// L2 norm of the available gradients in each group.
pub fn group_grad_norms(
    groups: &ParameterGroups,
    grads: &GradStore,
) -> Result<BTreeMap<&'static str, f32>> {
    let mut norms = BTreeMap::new();
    for (&name, vars) in groups {
        let mut sum_sq = 0f32;
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                sum_sq += grad
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f32>()?;
            }
        }
        norms.insert(name, sum_sq.sqrt());
    }
    Ok(norms)
}
