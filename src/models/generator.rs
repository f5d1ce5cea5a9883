// Text generation - the seam between the inference service and a model

use anyhow::{anyhow, Result};
use candle_core::Tensor;

use super::preparer::ModelHandle;
use super::sampling::SamplingParams;
use super::transformer::KvCache;

/// Text generation trait - abstraction over generator backends
pub trait TextGeneration {
    /// Continue `input_ids`; returns only the new tokens, without the stop token
    fn generate(
        &mut self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop_token: Option<u32>,
    ) -> Result<Vec<u32>>;

    /// Encode text (template markers included) into token IDs
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs back into a text string
    fn decode_tokens(&self, tokens: &[u32]) -> Result<String>;

    fn token_id(&self, token: &str) -> Option<u32>;

    /// Longest prompt plus continuation the backend accepts
    fn context_limit(&self) -> usize;

    /// Get model name/description
    fn name(&self) -> &str;
}

impl TextGeneration for ModelHandle {
    fn generate(
        &mut self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop_token: Option<u32>,
    ) -> Result<Vec<u32>> {
        if input_ids.is_empty() {
            return Err(anyhow!("cannot generate from an empty prompt"));
        }

        let model = self.model();
        let device = model.device().clone();
        let mut cache = KvCache::new(model.num_layers());
        let mut processor = params.logits_processor();
        let mut context = input_ids.to_vec();
        let mut output_ids = Vec::new();
        let budget = self
            .context_limit()
            .saturating_sub(input_ids.len())
            .min(params.max_new_tokens);

        for index in 0..budget {
            let step_input = if index == 0 {
                &context[..]
            } else {
                &context[context.len() - 1..]
            };
            let input = Tensor::new(step_input, &device)?.unsqueeze(0)?;
            let logits = model.forward_cached(&input, &mut cache)?.squeeze(0)?;
            let logits = params.apply_repetition_penalty(&logits, &context)?;

            let next_token = processor.sample(&logits)?;
            if Some(next_token) == stop_token {
                break;
            }
            context.push(next_token);
            output_ids.push(next_token);
        }

        tracing::debug!("Generated {} tokens", output_ids.len());
        Ok(output_ids)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        self.encode(text)
    }

    fn decode_tokens(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer()
            .decode(tokens, false)
            .map_err(|e| anyhow!("Decode failed: {}", e))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        ModelHandle::token_id(self, token)
    }

    fn context_limit(&self) -> usize {
        self.max_seq_length()
    }

    fn name(&self) -> &str {
        self.base_model()
    }
}
