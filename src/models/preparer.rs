// Model Preparer - loads a base model and attaches fresh LoRA adapters
//
// Cheap checks run first: the architecture config is read and the adapter
// targets are validated before the tokenizer or any weights are touched.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use sysinfo::System;
use tokenizers::Tokenizer;

use super::download::ModelSource;
use super::lora::LoRAConfig;
use super::lora_impl::LoraBuilder;
use super::templates::PromptTemplate;
use super::transformer::{ArchitectureConfig, DecoderModel};
use crate::config::{ModelSettings, Precision};
use crate::errors::{FinetuneError, FinetuneResult};

/// Base model located and its architecture parsed, weights not yet read
pub struct ResolvedModel {
    source: ModelSource,
    architecture: ArchitectureConfig,
}

impl ResolvedModel {
    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.architecture
    }

    pub fn model_id(&self) -> String {
        self.source.id()
    }
}

/// Loaded base weights, tokenizer and adapter parameters.
///
/// Exactly one owner at a time: the preparer hands it to the trainer or to
/// the inference service by value.
pub struct ModelHandle {
    model: DecoderModel,
    tokenizer: Tokenizer,
    varmap: VarMap,
    adapter: LoRAConfig,
    base_model: String,
    template: PromptTemplate,
    max_seq_length: usize,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("base_model", &self.base_model)
            .field("architecture", &self.model.config().fingerprint())
            .field("adapter", &self.adapter)
            .field("device", self.model.device())
            .field("varmap", &"<VarMap>")
            .finish()
    }
}

impl ModelHandle {
    pub fn model(&self) -> &DecoderModel {
        &self.model
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        self.model.device()
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        self.model.config()
    }

    pub fn adapter_config(&self) -> &LoRAConfig {
        &self.adapter
    }

    pub fn base_model(&self) -> &str {
        &self.base_model
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    /// Tokenize text that already carries its template markers
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Id used to fill padded positions; never attended to or scored
    pub fn pad_token_id(&self) -> u32 {
        self.token_id(self.template.template().eos_token())
            .unwrap_or(0)
    }

    /// Trainable variables sorted by name
    pub fn trainable_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("adapter variable map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    pub fn trainable_params(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum()
    }

    pub fn total_params(&self) -> usize {
        self.model.frozen_params() + self.trainable_params()
    }

    /// Snapshot of every trainable tensor, keyed by adapter name
    pub fn adapter_tensors(&self) -> Result<HashMap<String, Tensor>> {
        self.trainable_vars()?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite the adapter with saved tensors. Names and shapes must match
    /// exactly.
    pub fn load_adapter_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let vars = self.trainable_vars()?;
        if vars.len() != tensors.len() {
            anyhow::bail!(
                "expected {} adapter tensors, found {}",
                vars.len(),
                tensors.len()
            );
        }
        for (name, var) in &vars {
            let tensor = tensors
                .get(name)
                .with_context(|| format!("adapter tensor {} is missing", name))?;
            if tensor.dims() != var.dims() {
                anyhow::bail!(
                    "adapter tensor {} has shape {:?}, expected {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                );
            }
            let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&value)
                .with_context(|| format!("Failed to set adapter tensor {}", name))?;
        }
        Ok(())
    }
}

pub struct ModelPreparer {
    settings: ModelSettings,
    seed: u64,
}

impl ModelPreparer {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            settings,
            seed: crate::config::constants::DEFAULT_SEED,
        }
    }

    /// Seed for adapter initialization and dropout
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Locate the model and parse its architecture config
    pub fn resolve(&self) -> FinetuneResult<ResolvedModel> {
        let model_id = &self.settings.base_model;
        let source =
            ModelSource::open(&self.settings).map_err(|e| FinetuneError::model_load(model_id, &e))?;
        let architecture = source
            .config()
            .and_then(|path| ArchitectureConfig::from_file(&path))
            .map_err(|e| FinetuneError::model_load(model_id, &e))?;

        tracing::info!(
            "Resolved {} ({}, {} layers, hidden {})",
            source.id(),
            architecture.model_type,
            architecture.num_hidden_layers,
            architecture.hidden_size
        );
        Ok(ResolvedModel {
            source,
            architecture,
        })
    }

    /// Resolve, validate the adapter, then load weights and inject adapters
    pub fn prepare(&self, adapter: &LoRAConfig) -> FinetuneResult<ModelHandle> {
        let resolved = self.resolve()?;
        self.load(resolved, adapter)
    }

    pub fn load(&self, resolved: ResolvedModel, adapter: &LoRAConfig) -> FinetuneResult<ModelHandle> {
        adapter.validate()?;
        adapter.validate_targets(&resolved.architecture.projection_names())?;

        let model_id = resolved.source.id();
        let handle = self
            .load_weights(&resolved, adapter)
            .map_err(|e| FinetuneError::model_load(&model_id, &e))?;

        let trainable = handle.trainable_params();
        let total = handle.total_params();
        tracing::info!(
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            trainable,
            total,
            100.0 * trainable as f64 / total.max(1) as f64
        );
        Ok(handle)
    }

    fn load_weights(&self, resolved: &ResolvedModel, adapter: &LoRAConfig) -> Result<ModelHandle> {
        let architecture = &resolved.architecture;
        let precision = self.settings.precision;

        if adapter.gradient_checkpointing {
            tracing::warn!(
                "Gradient checkpointing requested but not available on this backend; all activations are kept"
            );
        }
        warn_if_memory_short(architecture, precision);

        let device = self.settings.device.device()?;
        let compute_dtype = precision.compute_dtype_on(&device);
        if compute_dtype != precision.compute_dtype() {
            tracing::warn!(
                "{} precision requested but {:?} arithmetic is not available on {:?}; computing in {:?}",
                precision.name(),
                precision.compute_dtype(),
                device,
                compute_dtype
            );
        }

        let tokenizer_path = resolved.source.tokenizer()?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        // Quantization starts from full-precision rows
        let load_dtype = if precision.is_quantized() {
            DType::F32
        } else {
            compute_dtype
        };

        let weights = resolved.source.weights()?;
        tracing::info!(
            "Loading {} weight file(s) on {:?} with {} precision",
            weights.len(),
            device,
            precision.name()
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weights, load_dtype, &device)
                .context("Failed to load model weights")?
        };

        let mut varmap = VarMap::new();
        let model = {
            let mut lora = LoraBuilder::new(
                &mut varmap,
                adapter,
                self.seed,
                &device,
                compute_dtype,
                precision.is_quantized(),
            );
            DecoderModel::load(architecture, vb, &mut lora, compute_dtype)?
        };

        Ok(ModelHandle {
            model,
            tokenizer,
            varmap,
            adapter: adapter.clone(),
            base_model: resolved.source.id(),
            template: self.settings.template,
            max_seq_length: self.settings.max_seq_length,
        })
    }
}

fn warn_if_memory_short(architecture: &ArchitectureConfig, precision: Precision) {
    let bytes_per_param = match precision {
        Precision::Full => 4.0,
        Precision::Half => 2.0,
        // 4.5 bits per weight for Q4_0 plus dense embeddings, roughly
        Precision::Quantized4Bit { .. } => 0.75,
    };
    let needed = architecture.parameter_count() as f64 * bytes_per_param;

    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory() as f64;

    if available > 0.0 && needed > available {
        tracing::warn!(
            "Model needs about {:.1} GB but only {:.1} GB of memory is available",
            needed / 1_073_741_824.0,
            available / 1_073_741_824.0
        );
    }
}
