// Sampling parameters for generation

use anyhow::Result;
use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::{Deserialize, Serialize};

use crate::config::constants::{
    DEFAULT_MAX_NEW_TOKENS, DEFAULT_REPETITION_PENALTY, DEFAULT_SEED, DEFAULT_TEMPERATURE,
    DEFAULT_TOP_P,
};
use crate::errors::{FinetuneError, FinetuneResult};

/// How the next token is picked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// false forces greedy decoding regardless of temperature
    #[serde(default = "default_do_sample")]
    pub do_sample: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus mass; 1.0 samples from the full distribution
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// 1.0 disables the penalty
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            repetition_penalty: DEFAULT_REPETITION_PENALTY,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            seed: DEFAULT_SEED,
        }
    }
}

impl SamplingParams {
    /// Deterministic argmax decoding
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            do_sample: false,
            repetition_penalty: 1.0,
            max_new_tokens,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.temperature <= 0.0
    }

    pub fn sampling(&self) -> Sampling {
        if self.is_greedy() {
            Sampling::ArgMax
        } else if self.top_p < 1.0 {
            Sampling::TopP {
                p: self.top_p,
                temperature: self.temperature,
            }
        } else {
            Sampling::All {
                temperature: self.temperature,
            }
        }
    }

    pub fn logits_processor(&self) -> LogitsProcessor {
        LogitsProcessor::from_sampling(self.seed, self.sampling())
    }

    /// Penalize every token already present in `context`
    pub fn apply_repetition_penalty(&self, logits: &Tensor, context: &[u32]) -> Result<Tensor> {
        if (self.repetition_penalty - 1.0).abs() < f32::EPSILON || context.is_empty() {
            return Ok(logits.clone());
        }
        Ok(candle_transformers::utils::apply_repeat_penalty(
            logits,
            self.repetition_penalty,
            context,
        )?)
    }

    pub fn validate(&self) -> FinetuneResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(FinetuneError::Config(format!(
                "inference.temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(FinetuneError::Config(format!(
                "inference.top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            return Err(FinetuneError::Config(
                "inference.repetition_penalty must be > 0".into(),
            ));
        }
        if self.max_new_tokens == 0 {
            return Err(FinetuneError::Config(
                "inference.max_new_tokens must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_do_sample() -> bool {
    true
}
fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}
fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}
fn default_repetition_penalty() -> f32 {
    DEFAULT_REPETITION_PENALTY
}
fn default_max_new_tokens() -> usize {
    DEFAULT_MAX_NEW_TOKENS
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_sampling_mode_selection() {
        let params = SamplingParams::default();
        assert!(matches!(params.sampling(), Sampling::TopP { .. }));

        let params = SamplingParams {
            top_p: 1.0,
            ..Default::default()
        };
        assert!(matches!(params.sampling(), Sampling::All { .. }));

        let params = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(params.is_greedy());
        assert!(matches!(params.sampling(), Sampling::ArgMax));

        assert!(SamplingParams::greedy(8).is_greedy());
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let logits = Tensor::new(&[0.1f32, 2.0, 0.3, 1.9], &Device::Cpu).unwrap();
        let mut processor = SamplingParams::greedy(4).logits_processor();
        assert_eq!(processor.sample(&logits).unwrap(), 1);
    }

    #[test]
    fn test_repetition_penalty_lowers_seen_tokens() {
        let params = SamplingParams {
            repetition_penalty: 2.0,
            ..Default::default()
        };
        let logits = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let penalized = params.apply_repetition_penalty(&logits, &[2]).unwrap();
        let values = penalized.to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 1.5]);
    }

    #[test]
    fn test_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        let bad = SamplingParams {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = SamplingParams {
            max_new_tokens: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
