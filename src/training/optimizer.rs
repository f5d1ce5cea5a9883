// Optimizers, gradient clipping and the learning-rate schedule
//
// AdamW keeps its moments as named tensors so they can be written into a
// checkpoint and restored on resume.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, SGD};
use std::collections::HashMap;

use crate::config::{LrScheduler, TrainingConfiguration};
use crate::errors::{FinetuneError, FinetuneResult};

/// Which update rule to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    AdamW,
    Sgd,
}

impl OptimizerKind {
    pub fn parse(name: &str) -> FinetuneResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "adamw" | "adamw_torch" => Ok(OptimizerKind::AdamW),
            "adamw_8bit" | "adamw_bnb_8bit" | "paged_adamw_8bit" => {
                tracing::warn!(
                    "Optimizer '{}' requested; moments are kept in f32 on this backend",
                    name
                );
                Ok(OptimizerKind::AdamW)
            }
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(FinetuneError::Config(format!(
                "unknown optimizer '{}' (expected adamw, adamw_torch, adamw_8bit or sgd)",
                other
            ))),
        }
    }
}

struct Moments {
    name: String,
    param: Var,
    exp_avg: Var,
    exp_avg_sq: Var,
}

/// Decoupled-weight-decay Adam over named variables
pub struct AdamW {
    moments: Vec<Moments>,
    params: ParamsAdamW,
    step_t: usize,
}

impl AdamW {
    pub fn new(vars: Vec<(String, Var)>, params: ParamsAdamW) -> Result<Self> {
        let moments = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, param)| {
                let exp_avg = Var::zeros(param.shape(), DType::F32, param.device())?;
                let exp_avg_sq = Var::zeros(param.shape(), DType::F32, param.device())?;
                Ok(Moments {
                    name,
                    param,
                    exp_avg,
                    exp_avg_sq,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            moments,
            params,
            step_t: 0,
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let lr_lambda = lr * self.params.weight_decay;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));

        for m in &self.moments {
            let theta = m.param.as_tensor();
            let Some(g) = grads.get(theta) else {
                continue;
            };
            let g = g.to_dtype(DType::F32)?;
            let next_m = ((m.exp_avg.as_tensor() * beta1)? + (&g * (1.0 - beta1))?)?;
            let next_v = ((m.exp_avg_sq.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let update = (m_hat / (v_hat.sqrt()? + self.params.eps)?)?;
            let next_theta = ((theta.to_dtype(DType::F32)? * (1.0 - lr_lambda))? - (update * lr)?)?;

            m.exp_avg.set(&next_m)?;
            m.exp_avg_sq.set(&next_v)?;
            m.param.set(&next_theta.to_dtype(theta.dtype())?)?;
        }
        Ok(())
    }

    /// Moments as `<name>.exp_avg` / `<name>.exp_avg_sq`
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        for m in &self.moments {
            state.insert(format!("{}.exp_avg", m.name), m.exp_avg.as_tensor().clone());
            state.insert(format!("{}.exp_avg_sq", m.name), m.exp_avg_sq.as_tensor().clone());
        }
        state
    }

    pub fn load_state(&mut self, state: &HashMap<String, Tensor>, step_t: usize) -> Result<()> {
        for m in &self.moments {
            for (suffix, var) in [("exp_avg", &m.exp_avg), ("exp_avg_sq", &m.exp_avg_sq)] {
                let key = format!("{}.{}", m.name, suffix);
                let saved = state
                    .get(&key)
                    .with_context(|| format!("optimizer state {} is missing", key))?;
                if saved.dims() != var.dims() {
                    bail!(
                        "optimizer state {} has shape {:?}, expected {:?}",
                        key,
                        saved.dims(),
                        var.dims()
                    );
                }
                var.set(&saved.to_dtype(DType::F32)?.to_device(var.device())?)?;
            }
        }
        self.step_t = step_t;
        Ok(())
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// The optimizer a trainer runs
pub enum TrainerOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl TrainerOptimizer {
    pub fn new(config: &TrainingConfiguration, vars: Vec<(String, Var)>) -> Result<Self> {
        let kind = OptimizerKind::parse(&config.optimizer).map_err(|e| anyhow!("{}", e))?;
        match kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: config.learning_rate,
                    weight_decay: config.weight_decay,
                    ..Default::default()
                };
                Ok(TrainerOptimizer::AdamW(AdamW::new(vars, params)?))
            }
            OptimizerKind::Sgd => {
                let vars = vars.into_iter().map(|(_, v)| v).collect();
                Ok(TrainerOptimizer::Sgd(SGD::new(vars, config.learning_rate)?))
            }
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            TrainerOptimizer::AdamW(opt) => opt.step(grads),
            TrainerOptimizer::Sgd(opt) => Ok(opt.step(grads)?),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            TrainerOptimizer::AdamW(opt) => opt.set_learning_rate(lr),
            TrainerOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }

    /// Tensors to checkpoint; SGD has none
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        match self {
            TrainerOptimizer::AdamW(opt) => opt.state_tensors(),
            TrainerOptimizer::Sgd(_) => HashMap::new(),
        }
    }

    pub fn load_state(&mut self, state: &HashMap<String, Tensor>, step_t: usize) -> Result<()> {
        match self {
            TrainerOptimizer::AdamW(opt) => opt.load_state(state, step_t),
            TrainerOptimizer::Sgd(_) => Ok(()),
        }
    }
}

/// Add `grads` into `total` for every trainable variable
pub fn accumulate(total: &mut Option<GradStore>, grads: GradStore, vars: &[(String, Var)]) -> Result<()> {
    match total {
        None => *total = Some(grads),
        Some(acc) => {
            for (_, var) in vars {
                let t = var.as_tensor();
                if let Some(g) = grads.get(t) {
                    let summed = match acc.get(t) {
                        Some(prev) => (prev + g)?,
                        None => g.clone(),
                    };
                    acc.insert(t, summed);
                }
            }
        }
    }
    Ok(())
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[(String, Var)], max_norm: Option<f64>) -> Result<f64> {
    let mut sq_sum = 0f64;
    for (_, var) in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq_sum += g
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()? as f64;
        }
    }
    let norm = sq_sum.sqrt();

    if let Some(max_norm) = max_norm {
        if norm.is_finite() && norm > max_norm {
            let factor = max_norm / (norm + 1e-6);
            for (_, var) in vars {
                let t = var.as_tensor();
                if let Some(g) = grads.get(t) {
                    let scaled = (g * factor)?;
                    grads.insert(t, scaled);
                }
            }
        }
    }
    Ok(norm)
}

/// Learning rate for optimizer step `step` (0-based) out of `total_steps`
pub fn learning_rate_at(config: &TrainingConfiguration, step: usize, total_steps: usize) -> f64 {
    let base = config.learning_rate;
    let warmup = config.warmup_steps;
    if warmup > 0 && step < warmup {
        return base * (step + 1) as f64 / warmup as f64;
    }
    match config.lr_scheduler {
        LrScheduler::Constant => base,
        LrScheduler::Linear => {
            let decay_steps = total_steps.saturating_sub(warmup).max(1);
            let progress = (step.saturating_sub(warmup)) as f64 / decay_steps as f64;
            base * (1.0 - progress).max(0.0)
        }
    }
}
