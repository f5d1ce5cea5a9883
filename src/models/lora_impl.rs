// LoRA (Low-Rank Adaptation) Implementation
// Frozen projection weights plus trainable low-rank A/B matrices

use anyhow::{anyhow, Context, Result};
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Init, Linear, VarMap};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

use super::lora::{BiasMode, LoRAConfig};

/// Prefix PEFT puts in front of module paths in adapter files
pub const ADAPTER_PREFIX: &str = "base_model.model.";

pub fn lora_a_name(module_path: &str) -> String {
    format!("{}{}.lora_A.weight", ADAPTER_PREFIX, module_path)
}

pub fn lora_b_name(module_path: &str) -> String {
    format!("{}{}.lora_B.weight", ADAPTER_PREFIX, module_path)
}

pub fn bias_name(module_path: &str) -> String {
    format!("{}{}.bias", ADAPTER_PREFIX, module_path)
}

/// Base weight of a projection; never receives gradients
#[derive(Debug, Clone)]
pub enum FrozenWeight {
    Dense(Tensor),
    /// Q4_0 blocks, expanded for every matmul
    Quantized(Arc<QTensor>),
}

impl FrozenWeight {
    /// Quantize when asked and the row length fits whole Q4_0 blocks,
    /// otherwise store in `dtype`
    pub fn new(weight: Tensor, quantize: bool, dtype: DType) -> Result<Self> {
        let in_dim = weight.dim(1)?;
        if quantize && in_dim % GgmlDType::Q4_0.block_size() == 0 {
            let weight = weight.to_dtype(DType::F32)?;
            let q = QTensor::quantize(&weight, GgmlDType::Q4_0)
                .context("Failed to quantize projection weight")?;
            Ok(FrozenWeight::Quantized(Arc::new(q)))
        } else {
            if quantize {
                tracing::warn!(
                    "Input dim {} is not a multiple of the Q4_0 block size, keeping weight dense",
                    in_dim
                );
            }
            Ok(FrozenWeight::Dense(weight.to_dtype(dtype)?))
        }
    }

    /// Weight in `dtype`, (out, in)
    pub fn materialize(&self, dtype: DType) -> Result<Tensor> {
        match self {
            FrozenWeight::Dense(w) => Ok(w.to_dtype(dtype)?),
            FrozenWeight::Quantized(q) => Ok(q.dequantize(&q.device())?.to_dtype(dtype)?),
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        match self {
            FrozenWeight::Dense(w) => w.dims().to_vec(),
            FrozenWeight::Quantized(q) => q.shape().dims().to_vec(),
        }
    }

    pub fn elem_count(&self) -> usize {
        self.dims().iter().product()
    }
}

/// Trainable low-rank update: scaling * B(A(dropout(x)))
#[derive(Debug)]
pub struct LoraBranch {
    /// (rank, in)
    lora_a: Tensor,
    /// (out, rank)
    lora_b: Tensor,
    scaling: f64,
    dropout: f64,
    rng: Mutex<StdRng>,
}

impl LoraBranch {
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let dtype = x.dtype();
        let mut x = x.to_dtype(self.lora_a.dtype())?;

        if train && self.dropout > 0.0 {
            let keep = 1.0 - self.dropout;
            let mask: Vec<f32> = {
                let mut rng = self
                    .rng
                    .lock()
                    .map_err(|_| anyhow!("dropout RNG lock poisoned"))?;
                (0..x.elem_count())
                    .map(|_| {
                        if rng.gen::<f64>() < keep {
                            (1.0 / keep) as f32
                        } else {
                            0.0
                        }
                    })
                    .collect()
            };
            let mask = Tensor::from_vec(mask, x.shape(), x.device())?.to_dtype(x.dtype())?;
            x = (x * mask)?;
        }

        let down = Linear::new(self.lora_a.clone(), None).forward(&x)?;
        let up = Linear::new(self.lora_b.clone(), None).forward(&down)?;
        Ok((up * self.scaling)?.to_dtype(dtype)?)
    }
}

/// Projection layer with an optional LoRA branch
#[derive(Debug)]
pub struct LoraLinear {
    weight: FrozenWeight,
    bias: Option<Tensor>,
    adapter: Option<LoraBranch>,
    compute_dtype: DType,
}

impl LoraLinear {
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let weight = self.weight.materialize(self.compute_dtype)?;
        let bias = match &self.bias {
            Some(b) => Some(b.to_dtype(self.compute_dtype)?),
            None => None,
        };
        let base = Linear::new(weight, bias).forward(x)?;

        match &self.adapter {
            Some(adapter) => Ok((base + adapter.forward(x, train)?)?),
            None => Ok(base),
        }
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// Frozen parameters held by this layer
    pub fn frozen_params(&self) -> usize {
        self.weight.elem_count()
    }
}

/// Creates adapter variables in a VarMap while the base model is built.
///
/// All randomness comes from one seeded RNG so two builds with the same seed
/// produce identical adapters.
pub struct LoraBuilder<'a> {
    varmap: &'a mut VarMap,
    config: &'a LoRAConfig,
    rng: StdRng,
    device: Device,
    compute_dtype: DType,
    quantize: bool,
}

impl<'a> LoraBuilder<'a> {
    pub fn new(
        varmap: &'a mut VarMap,
        config: &'a LoRAConfig,
        seed: u64,
        device: &Device,
        compute_dtype: DType,
        quantize: bool,
    ) -> Self {
        Self {
            varmap,
            config,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
            compute_dtype,
            quantize,
        }
    }

    fn new_var(&mut self, name: &str, init: Tensor) -> Result<Tensor> {
        let var = self
            .varmap
            .get(init.dims().to_vec(), name, Init::Const(0.), DType::F32, &self.device)
            .with_context(|| format!("Failed to create variable {}", name))?;
        self.varmap.set_one(name, &init)?;
        Ok(var)
    }

    /// Wrap a loaded projection.
    ///
    /// `projection` is the short name ("q_proj"), `module_path` the full
    /// weight prefix ("model.layers.0.self_attn.q_proj").
    pub fn linear(
        &mut self,
        module_path: &str,
        projection: &str,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> Result<LoraLinear> {
        let (out_dim, in_dim) = weight.dims2()?;
        let adapted = self.config.targets(projection);

        let trainable_bias = match self.config.bias {
            BiasMode::None => false,
            BiasMode::All => true,
            BiasMode::LoraOnly => adapted,
        };
        let bias = match bias {
            Some(b) if trainable_bias => {
                let init = b.to_dtype(DType::F32)?.to_device(&self.device)?;
                Some(self.new_var(&bias_name(module_path), init)?)
            }
            Some(b) => Some(b.to_dtype(self.compute_dtype)?),
            None => None,
        };

        let adapter = if adapted {
            let rank = self.config.rank;
            // kaiming-uniform bound for A, zeros for B so the update starts at zero
            let bound = 1.0 / (in_dim as f32).sqrt();
            let dist = Uniform::new(-bound, bound);
            let values: Vec<f32> = (0..rank * in_dim).map(|_| dist.sample(&mut self.rng)).collect();
            let a_init = Tensor::from_vec(values, (rank, in_dim), &self.device)?;
            let b_init = Tensor::zeros((out_dim, rank), DType::F32, &self.device)?;

            let lora_a = self.new_var(&lora_a_name(module_path), a_init)?;
            let lora_b = self.new_var(&lora_b_name(module_path), b_init)?;
            Some(LoraBranch {
                lora_a,
                lora_b,
                scaling: self.config.scaling(),
                dropout: self.config.dropout,
                rng: Mutex::new(StdRng::seed_from_u64(self.rng.gen())),
            })
        } else {
            None
        };

        Ok(LoraLinear {
            weight: FrozenWeight::new(weight, self.quantize, self.compute_dtype)?,
            bias,
            adapter,
            compute_dtype: self.compute_dtype,
        })
    }
}
