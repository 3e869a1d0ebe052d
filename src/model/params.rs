//! Parameter bookkeeping for training: named groups for gradient-norm
//! logging, freezing filters, block gradient down-scaling and checkpoint
//! surgery.
//!
//! Everything here works on the variable names a [`VarMap`] records, which
//! mirror the checkpoint key paths (`layers.3.block1.attn.qkv.weight`, ...).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

use crate::{Error, Result};

/// Group name → member variables, ordered by name for stable reporting.
pub type ParameterGroups = BTreeMap<&'static str, Vec<Var>>;

/// Gradient multiplier applied to block output projections and prenorms.
pub const BLOCK_GRADIENT_SCALE: f64 = 0.2;

/// All variables of `varmap`, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::WeightLoad("variable map lock poisoned".into()))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Split `layers.{i}.{rest}` into `rest`.
fn layer_member(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("layers.")?;
    let (index, member) = rest.split_once('.')?;
    index.parse::<usize>().ok()?;
    Some(member)
}

/// Groups a diffusion-model parameter belongs to. `name` is relative to the
/// diffusion model root.
pub fn diffusion_groups(name: &str) -> Vec<&'static str> {
    let mut groups = Vec::new();
    if let Some(member) = layer_member(name) {
        groups.push("layers");
        if member.starts_with("prenorm.") {
            groups.push("prenorms");
        } else if member.starts_with("block1.attn.") {
            groups.extend(["blk1_attention_layers", "attention_layers"]);
        } else if member.starts_with("block2.attn.") {
            groups.extend(["blk2_attention_layers", "attention_layers"]);
        } else if member.starts_with("block1.ff.") {
            groups.extend(["blk1_ff_layers", "ff_layers"]);
        } else if member.starts_with("block2.ff.") {
            groups.extend(["blk2_ff_layers", "ff_layers"]);
        } else if member.starts_with("out.") {
            groups.push("block_out_layers");
        }
    } else if name.starts_with("out.") {
        groups.push("out");
    } else if name.starts_with("inp_block.") {
        groups.push("x_proj");
    } else if name.starts_with("time_embed.") {
        groups.push("time_embed");
    }
    groups
}

/// Whether a diffusion parameter gets its gradient down-scaled before the
/// optimizer step: block output projections and block prenorms.
pub fn is_scaled_block_parameter(name: &str) -> bool {
    matches!(layer_member(name), Some(member) if member.starts_with("out.") || member.starts_with("prenorm."))
}

/// Collect the diffusion parameter groups of variables under `prefix`.
pub fn collect_groups(varmap: &VarMap, prefix: &str) -> Result<ParameterGroups> {
    let mut groups = ParameterGroups::new();
    for (name, var) in named_vars(varmap)? {
        let Some(relative) = name.strip_prefix(prefix) else {
            continue;
        };
        for group in diffusion_groups(relative) {
            groups.entry(group).or_default().push(var.clone());
        }
    }
    Ok(groups)
}

/// Variables whose name passes `keep`.
pub fn filter_vars(varmap: &VarMap, keep: impl Fn(&str) -> bool) -> Result<Vec<Var>> {
    Ok(named_vars(varmap)?
        .into_iter()
        .filter(|(name, _)| keep(name))
        .map(|(_, var)| var)
        .collect())
}

/// Multiply the gradients of block output projections and prenorms under
/// `prefix` by `factor`. Returns how many gradients were rescaled.
pub fn scale_block_gradients(
    grads: &mut GradStore,
    varmap: &VarMap,
    prefix: &str,
    factor: f64,
) -> Result<usize> {
    let mut scaled = 0;
    for (name, var) in named_vars(varmap)? {
        let Some(relative) = name.strip_prefix(prefix) else {
            continue;
        };
        if !is_scaled_block_parameter(relative) {
            continue;
        }
        if let Some(grad) = grads.get(var.as_tensor()) {
            let grad = (grad * factor)?;
            grads.insert(var.as_tensor(), grad);
            scaled += 1;
        }
    }
    Ok(scaled)
}

/// Total element count of `vars`.
pub fn count_elements(vars: &[Var]) -> usize {
    vars.iter().map(|var| var.elem_count()).sum()
}

/// Copy the tensors of a safetensors checkpoint whose key starts with
/// `prefix` into a new file. Keys keep their prefix. Returns the number of
/// tensors written.
pub fn extract_prefixed_tensors(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    prefix: &str,
) -> Result<usize> {
    let tensors = candle_core::safetensors::load(input.as_ref(), &Device::Cpu)?;
    let kept: HashMap<String, Tensor> = tensors
        .into_iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .collect();
    if kept.is_empty() {
        return Err(Error::WeightLoad(format!(
            "no tensors with prefix {prefix:?} in {}",
            input.as_ref().display()
        )));
    }
    candle_core::safetensors::save(&kept, output.as_ref())?;
    tracing::info!(
        count = kept.len(),
        "extracted {prefix:?} tensors to {}",
        output.as_ref().display()
    );
    Ok(kept.len())
}
