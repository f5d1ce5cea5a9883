// LoRA configuration
//
// Which projection layers receive low-rank adapters, and how they are scaled.

use serde::{Deserialize, Serialize};

use crate::config::constants::{DEFAULT_LORA_ALPHA, DEFAULT_LORA_RANK, DEFAULT_TARGET_MODULES};
use crate::errors::{FinetuneError, FinetuneResult};

/// Attention projections of a decoder layer
pub const ATTENTION_PROJECTIONS: [&str; 4] = ["q_proj", "k_proj", "v_proj", "o_proj"];

/// MLP projections of a decoder layer
pub const MLP_PROJECTIONS: [&str; 3] = ["gate_proj", "up_proj", "down_proj"];

/// Which biases are trainable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    /// Every bias stays frozen
    #[default]
    None,
    /// Every bias in the model is trained
    All,
    /// Only biases of adapted projections are trained
    LoraOnly,
}

/// LoRA configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    /// Rank of the A/B matrices
    #[serde(default = "default_rank")]
    pub rank: usize,

    /// Scaling numerator; the update is multiplied by alpha / rank
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Dropout applied to the adapter input while training
    #[serde(default)]
    pub dropout: f64,

    /// Projection names, in order, e.g. ["q_proj", "v_proj"]
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    #[serde(default)]
    pub bias: BiasMode,

    /// Recorded for reproducibility; the candle backend keeps all activations
    #[serde(default = "default_true")]
    pub gradient_checkpointing: bool,
}

/// The adapter hyperparameters under their pipeline-level name
pub type AdapterConfiguration = LoRAConfig;

fn default_rank() -> usize {
    DEFAULT_LORA_RANK
}

fn default_alpha() -> f64 {
    DEFAULT_LORA_ALPHA
}

fn default_target_modules() -> Vec<String> {
    DEFAULT_TARGET_MODULES.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

impl Default for LoRAConfig {
    fn default() -> Self {
        Self {
            rank: DEFAULT_LORA_RANK,
            alpha: DEFAULT_LORA_ALPHA,
            dropout: 0.0,
            target_modules: default_target_modules(),
            bias: BiasMode::None,
            gradient_checkpointing: true,
        }
    }
}

impl LoRAConfig {
    /// Adapter on the given projections, other fields at their defaults
    pub fn with_targets(rank: usize, alpha: f64, targets: &[&str]) -> Self {
        Self {
            rank,
            alpha,
            target_modules: targets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// alpha / rank
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn targets(&self, name: &str) -> bool {
        self.target_modules.iter().any(|t| t == name)
    }

    /// Check the targets against the projection names an architecture has.
    ///
    /// Runs before any weights are read so a typo never costs a model load.
    pub fn validate_targets(&self, available: &[&str]) -> FinetuneResult<()> {
        if self.target_modules.is_empty() {
            return Err(FinetuneError::AdapterTarget(
                "target_modules must name at least one projection layer".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.target_modules.len());
        for target in &self.target_modules {
            if !available.contains(&target.as_str()) {
                return Err(FinetuneError::AdapterTarget(format!(
                    "'{}' is not a projection layer of this architecture (available: {})",
                    target,
                    available.join(", ")
                )));
            }
            if seen.contains(&target) {
                return Err(FinetuneError::AdapterTarget(format!(
                    "'{}' is listed more than once",
                    target
                )));
            }
            seen.push(target);
        }
        Ok(())
    }

    /// Hyperparameter sanity; targets are checked separately
    pub fn validate(&self) -> FinetuneResult<()> {
        if self.rank == 0 {
            return Err(FinetuneError::Config("adapter rank must be > 0".into()));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(FinetuneError::Config("adapter alpha must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FinetuneError::Config(format!(
                "adapter dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}
