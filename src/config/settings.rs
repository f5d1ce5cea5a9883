// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::backend::{ExecutionTarget, Precision};
use super::constants::*;
use crate::errors::{FinetuneError, FinetuneResult};
use crate::models::lora::LoRAConfig;
use crate::models::sampling::SamplingParams;
use crate::models::templates::PromptTemplate;

/// Base model acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Hub repo id (e.g. "unsloth/mistral-7b-v0.3") or a local directory
    #[serde(default = "default_base_model")]
    pub base_model: String,

    /// Truncation and packing window in tokens
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,

    #[serde(default = "default_precision")]
    pub precision: Precision,

    #[serde(default)]
    pub device: ExecutionTarget,

    /// Prompt layout for the model family
    #[serde(default)]
    pub template: PromptTemplate,

    /// Hub token for gated repos (falls back to $HF_TOKEN)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_token: Option<String>,

    /// Hub revision (branch, tag or commit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_model: DEFAULT_BASE_MODEL.to_string(),
            max_seq_length: DEFAULT_MAX_SEQ_LENGTH,
            precision: default_precision(),
            device: ExecutionTarget::Auto,
            template: PromptTemplate::Mistral,
            hf_token: None,
            revision: None,
        }
    }
}

impl ModelSettings {
    /// Token from the config, else from the environment
    pub fn resolved_token(&self) -> Option<String> {
        self.hf_token
            .clone()
            .or_else(|| std::env::var(HF_TOKEN_ENV).ok())
            .filter(|t| !t.trim().is_empty())
    }
}

/// Learning-rate schedule after warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduler {
    /// Linear warmup then linear decay to zero
    #[default]
    Linear,
    /// Linear warmup then flat
    Constant,
}

/// Hyperparameters of one training run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfiguration {
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_batch_size")]
    pub per_device_batch_size: usize,

    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// "adamw" (aliases "adamw_torch", "adamw_8bit") or "sgd"
    #[serde(default = "default_optimizer")]
    pub optimizer: String,

    #[serde(default)]
    pub weight_decay: f64,

    #[serde(default)]
    pub warmup_steps: usize,

    #[serde(default)]
    pub lr_scheduler: LrScheduler,

    /// Global-norm clipping threshold; None disables clipping
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,

    /// Log the running loss every N optimizer steps
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,

    /// Checkpoint every N optimizer steps
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,

    /// Concatenate short examples into shared windows
    #[serde(default)]
    pub packing: bool,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Checkpoints and the final adapter artifact land here
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Explicit resume point (a checkpoint-<step> directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<PathBuf>,
}

impl Default for TrainingConfiguration {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            per_device_batch_size: DEFAULT_BATCH_SIZE,
            gradient_accumulation_steps: DEFAULT_GRADIENT_ACCUMULATION,
            learning_rate: DEFAULT_LEARNING_RATE,
            optimizer: DEFAULT_OPTIMIZER.to_string(),
            weight_decay: 0.0,
            warmup_steps: 0,
            lr_scheduler: LrScheduler::Linear,
            max_grad_norm: Some(DEFAULT_MAX_GRAD_NORM),
            logging_steps: DEFAULT_LOGGING_STEPS,
            save_steps: DEFAULT_SAVE_STEPS,
            packing: false,
            seed: DEFAULT_SEED,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            resume_from: None,
        }
    }
}

impl TrainingConfiguration {
    /// Shorter variant: one epoch, packed windows, sparser logging
    pub fn single_epoch_packed() -> Self {
        Self {
            epochs: 1,
            logging_steps: 10,
            save_steps: 50,
            packing: true,
            ..Default::default()
        }
    }

    /// Examples consumed per optimizer step
    pub fn effective_batch_size(&self, device_count: usize) -> usize {
        self.per_device_batch_size * self.gradient_accumulation_steps * device_count
    }

    pub fn validate(&self) -> FinetuneResult<()> {
        let fail = |msg: String| Err(FinetuneError::Config(msg));

        if self.epochs == 0 {
            return fail("training.epochs must be > 0".into());
        }
        if self.effective_batch_size(1) == 0 {
            return fail(format!(
                "effective batch size must be > 0 (batch size {} x accumulation {})",
                self.per_device_batch_size, self.gradient_accumulation_steps
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return fail(format!(
                "training.learning_rate must be a positive number, got {}",
                self.learning_rate
            ));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return fail("training.weight_decay must be >= 0".into());
        }
        if self.logging_steps == 0 || self.save_steps == 0 {
            return fail("training.logging_steps and training.save_steps must be > 0".into());
        }
        if let Some(norm) = self.max_grad_norm {
            if !norm.is_finite() || norm <= 0.0 {
                return fail("training.max_grad_norm must be > 0 when set".into());
            }
        }
        crate::training::optimizer::OptimizerKind::parse(&self.optimizer)?;
        Ok(())
    }
}

/// Dataset locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    #[serde(default = "default_train_path")]
    pub train_path: PathBuf,

    /// Held-out evaluation set; the training file is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_path: Option<PathBuf>,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            train_path: PathBuf::from(DEFAULT_TRAIN_PATH),
            eval_path: None,
        }
    }
}

/// Where the before/after metrics record is written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_path")]
    pub path: PathBuf,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_METRICS_PATH),
        }
    }
}

/// Inference service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// Adapter artifact directory; defaults to training.output_dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_path: Option<PathBuf>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(flatten)]
    pub sampling: SamplingParams,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            adapter_path: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            sampling: SamplingParams::default(),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinetuneConfig {
    #[serde(default)]
    pub model: ModelSettings,

    #[serde(default)]
    pub adapter: LoRAConfig,

    #[serde(default)]
    pub training: TrainingConfiguration,

    #[serde(default)]
    pub data: DataSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub inference: InferenceSettings,
}

impl FinetuneConfig {
    /// Validate everything that can be checked without touching the model
    pub fn validate(&self) -> FinetuneResult<()> {
        if self.model.base_model.trim().is_empty() {
            return Err(FinetuneError::Config("model.base_model is empty".into()));
        }
        if self.model.max_seq_length < 2 {
            return Err(FinetuneError::Config(
                "model.max_seq_length must be at least 2".into(),
            ));
        }
        self.adapter.validate()?;
        if self.adapter.target_modules.is_empty() {
            return Err(FinetuneError::AdapterTarget(
                "target_modules must name at least one projection layer".into(),
            ));
        }
        self.training.validate()?;
        self.inference.sampling.validate()?;
        Ok(())
    }

    /// Adapter artifact the inference service reads
    pub fn adapter_path(&self) -> PathBuf {
        self.inference
            .adapter_path
            .clone()
            .unwrap_or_else(|| self.training.output_dir.clone())
    }
}

fn default_base_model() -> String {
    DEFAULT_BASE_MODEL.to_string()
}
fn default_max_seq_length() -> usize {
    DEFAULT_MAX_SEQ_LENGTH
}
fn default_precision() -> Precision {
    Precision::default()
}
fn default_epochs() -> usize {
    DEFAULT_EPOCHS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_accumulation() -> usize {
    DEFAULT_GRADIENT_ACCUMULATION
}
fn default_learning_rate() -> f64 {
    DEFAULT_LEARNING_RATE
}
fn default_optimizer() -> String {
    DEFAULT_OPTIMIZER.to_string()
}
fn default_max_grad_norm() -> Option<f64> {
    Some(DEFAULT_MAX_GRAD_NORM)
}
fn default_logging_steps() -> usize {
    DEFAULT_LOGGING_STEPS
}
fn default_save_steps() -> usize {
    DEFAULT_SAVE_STEPS
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}
fn default_train_path() -> PathBuf {
    PathBuf::from(DEFAULT_TRAIN_PATH)
}
fn default_metrics_path() -> PathBuf {
    PathBuf::from(DEFAULT_METRICS_PATH)
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
