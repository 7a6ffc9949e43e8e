//! Distributed data parallel wrapper and SGD optimizer
//!
//! `DistributedDataParallel` makes every replica start from rank 0's weights
//! and averages gradients across ranks after each backward pass.
//! `DistributedSgd` applies the averaged gradients with momentum SGD.
//!
//! The optimizer can only be obtained from a wrapped model, so weights are
//! always synchronized before the first update.
//!
//! # Collective Order
//!
//! Variables are visited in sorted-name order and every trainable variable
//! contributes to the gradient buffer even when it received no gradient on
//! this rank (zeros are sent instead). Each step therefore issues exactly one
//! all-reduce of the same length on every rank.
//!
//! # SGD Update
//!
//! ```text
//! d = g + λ * θ            # λ only for weight kernels (rank >= 2)
//! v = μ * v + d            # v = d on the first step
//! θ = θ - lr * v
//! ```

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::group::ProcessGroup;

/// Synchronized gradient: parameter name, its variable and the averaged gradient
pub type SyncedGradient = (String, Var, Tensor);

/// Batch-norm running statistics are state, not trainable parameters
pub fn is_buffer(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn tensor_values(tensor: &Tensor) -> Result<Vec<f32>> {
    tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()
}

/// Take the next `like.elem_count()` values of `flat` as a tensor shaped like `like`
fn take_like(flat: &[f32], offset: &mut usize, like: &Tensor) -> Result<Tensor> {
    let n = like.elem_count();
    let end = *offset + n;
    if end > flat.len() {
        return Err(candle_core::Error::Msg(format!(
            "flat buffer too short: need {} values, have {}",
            end,
            flat.len()
        )));
    }
    let tensor = Tensor::from_slice(&flat[*offset..end], like.shape(), like.device())?.to_dtype(like.dtype())?;
    *offset = end;
    Ok(tensor)
}

/// A model's variables bound to a process group
#[derive(Clone)]
pub struct DistributedDataParallel {
    varmap: VarMap,
    group: Arc<dyn ProcessGroup>,
    /// Trainable variables, sorted by name
    params: Vec<(String, Var)>,
    /// Non-trainable state (batch-norm statistics), sorted by name
    buffers: Vec<(String, Var)>,
}

impl DistributedDataParallel {
    /// Wrap a model's variables, overwriting them with rank 0's values.
    ///
    /// Every variable, buffers included, is broadcast in one fused call.
    pub fn wrap(varmap: &VarMap, group: Arc<dyn ProcessGroup>) -> Result<Self> {
        let vars = sorted_vars(varmap)?;

        if group.is_distributed() {
            let mut flat = Vec::new();
            for (_, var) in &vars {
                flat.extend(tensor_values(var.as_tensor())?);
            }
            group.broadcast(&mut flat, 0)?;

            let mut offset = 0;
            for (_, var) in &vars {
                let value = take_like(&flat, &mut offset, var.as_tensor())?;
                var.set(&value)?;
            }
            log::debug!(
                "rank {}: synchronized {} variables ({} values) from rank 0",
                group.rank(),
                vars.len(),
                flat.len()
            );
        }

        let (buffers, params): (Vec<_>, Vec<_>) = vars.into_iter().partition(|(name, _)| is_buffer(name));

        Ok(Self {
            varmap: varmap.clone(),
            group,
            params,
            buffers,
        })
    }

    /// Build the optimizer for the wrapped variables
    pub fn optimizer(&self, config: SgdConfig) -> DistributedSgd {
        DistributedSgd {
            ddp: self.clone(),
            velocity: HashMap::new(),
            config,
            step_count: 0,
        }
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    pub fn num_params(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Average the gradients of every trainable variable across ranks
    pub fn synchronize_gradients(&self, grads: &GradStore) -> Result<Vec<SyncedGradient>> {
        let mut flat = Vec::with_capacity(self.num_params());
        for (_, var) in &self.params {
            match grads.get(var.as_tensor()) {
                Some(grad) => flat.extend(tensor_values(grad)?),
                None => flat.resize(flat.len() + var.elem_count(), 0.0),
            }
        }

        if self.group.is_distributed() {
            self.group.all_reduce_sum(&mut flat)?;
            let scale = 1.0 / self.group.world_size() as f32;
            for v in &mut flat {
                *v *= scale;
            }
        }

        let mut offset = 0;
        let mut result = Vec::with_capacity(self.params.len());
        for (name, var) in &self.params {
            let grad = take_like(&flat, &mut offset, var.as_tensor())?;
            result.push((name.clone(), var.clone(), grad));
        }
        Ok(result)
    }
}

/// Momentum SGD configuration
#[derive(Debug, Clone)]
pub struct SgdConfig {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor (0 disables the velocity buffer)
    pub momentum: f64,
    /// L2 coefficient added to the gradient of weight kernels
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

/// SGD optimizer over a `DistributedDataParallel` model
pub struct DistributedSgd {
    ddp: DistributedDataParallel,
    velocity: HashMap<String, Tensor>,
    config: SgdConfig,
    step_count: usize,
}

impl DistributedSgd {
    /// Backward pass, gradient averaging and update.
    ///
    /// Returns the norm of the averaged gradient.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f64> {
        let grads = loss.backward()?;
        let synced = self.ddp.synchronize_gradients(&grads)?;
        let grad_norm = compute_grad_norm(&synced)?;
        self.step(&synced)?;
        Ok(grad_norm)
    }

    /// Apply already synchronized gradients
    pub fn step(&mut self, synced_grads: &[SyncedGradient]) -> Result<()> {
        self.step_count += 1;
        let SgdConfig {
            lr,
            momentum,
            weight_decay,
        } = self.config.clone();

        for (name, var, grad) in synced_grads {
            let param = var.as_tensor();

            let mut d = grad.clone();
            if weight_decay != 0.0 && param.rank() >= 2 {
                d = (d + (param * weight_decay)?)?;
            }

            let update = if momentum != 0.0 {
                let v = match self.velocity.get(name) {
                    Some(prev) => ((prev * momentum)? + &d)?,
                    None => d,
                }
                .detach();
                self.velocity.insert(name.clone(), v.clone());
                v
            } else {
                d
            };

            let new_param = param.sub(&(update * lr)?)?;
            var.set(&new_param)?;
        }

        Ok(())
    }

    pub fn ddp(&self) -> &DistributedDataParallel {
        &self.ddp
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    /// Set the learning rate (for learning rate scheduling)
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    /// Save the momentum buffers as safetensors
    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        candle_core::safetensors::save(&self.velocity, path)
    }

    /// Restore momentum buffers written by [`DistributedSgd::save_state`]
    pub fn load_state<P: AsRef<Path>>(&mut self, path: P, device: &Device) -> Result<()> {
        let loaded = candle_core::safetensors::load(path, device)?;
        for (name, _) in &self.ddp.params {
            if let Some(v) = loaded.get(name) {
                self.velocity.insert(name.clone(), v.clone());
            }
        }
        Ok(())
    }
}

/// Compute gradient norm from synchronized gradients
pub fn compute_grad_norm(synced_grads: &[SyncedGradient]) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;

    for (_, _, grad) in synced_grads {
        let grad_norm_sq = grad.sqr()?
            .sum_all()?
            .to_dtype(DType::F64)?
            .to_vec0::<f64>()?;
        total_norm_sq += grad_norm_sq;
    }

    Ok(total_norm_sq.sqrt())
}
