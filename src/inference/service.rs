// Inference Service - answers prompts with a base model plus a trained adapter

use serde::{Deserialize, Serialize};

use crate::config::FinetuneConfig;
use crate::errors::{FinetuneError, FinetuneResult};
use crate::models::{
    AdapterArtifact, ModelHandle, ModelPreparer, PromptTemplate, SamplingParams, TextGeneration,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Generated answer with template markers and prompt echoes removed
    pub text: String,
    pub generated_tokens: usize,
}

/// Remove verbatim copies of `prompt` from the start of `text`, as many
/// times as they repeat. Rephrased echoes are left alone.
pub fn strip_prompt_echo(text: &str, prompt: &str) -> String {
    let prompt = prompt.trim();
    let mut rest = text.trim_start();
    if prompt.is_empty() {
        return rest.trim_end().to_string();
    }
    while let Some(stripped) = rest.strip_prefix(prompt) {
        rest = stripped.trim_start();
    }
    rest.trim_end().to_string()
}

/// Holds one generator for its whole lifetime
pub struct InferenceService<G: TextGeneration> {
    generator: G,
    template: PromptTemplate,
    system_prompt: String,
    sampling: SamplingParams,
}

impl<G: TextGeneration> InferenceService<G> {
    pub fn new(
        generator: G,
        template: PromptTemplate,
        system_prompt: impl Into<String>,
        sampling: SamplingParams,
    ) -> Self {
        Self {
            generator,
            template,
            system_prompt: system_prompt.into(),
            sampling,
        }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    /// Render, generate, decode and clean one answer
    pub fn respond(&mut self, request: &InferenceRequest) -> FinetuneResult<InferenceResponse> {
        let fail = |e: anyhow::Error| FinetuneError::Generation(format!("{:#}", e));

        if request.prompt.trim().is_empty() {
            return Err(FinetuneError::Generation("prompt is empty".to_string()));
        }

        let template = self.template.template();
        let rendered = template.format_chat_prompt(&self.system_prompt, &request.prompt);
        let mut input_ids = self.generator.tokenize(&rendered).map_err(fail)?;

        // Keep room for the answer; the end of the prompt matters most
        let limit = self.generator.context_limit();
        let reserve = self.sampling.max_new_tokens.min(limit / 2);
        let keep = limit.saturating_sub(reserve).max(1);
        if input_ids.len() > keep {
            tracing::warn!(
                "Prompt is {} tokens; keeping the last {} to fit the {}-token context",
                input_ids.len(),
                keep,
                limit
            );
            input_ids.drain(..input_ids.len() - keep);
        }

        let stop_token = self.generator.token_id(template.eos_token());
        let output_ids = self
            .generator
            .generate(&input_ids, &self.sampling, stop_token)
            .map_err(fail)?;
        let raw = self.generator.decode_tokens(&output_ids).map_err(fail)?;

        let cleaned = template.clean_output(&raw);
        let text = strip_prompt_echo(&cleaned, &request.prompt);

        tracing::debug!(
            "{} generated {} tokens ({} chars after cleanup)",
            self.generator.name(),
            output_ids.len(),
            text.len()
        );
        Ok(InferenceResponse {
            text,
            generated_tokens: output_ids.len(),
        })
    }
}

impl InferenceService<ModelHandle> {
    /// Load the base model and the trained adapter named by `config`.
    ///
    /// The artifact is read and checked against the base architecture before
    /// any weights are loaded.
    pub fn load(config: &FinetuneConfig) -> FinetuneResult<Self> {
        config.inference.sampling.validate()?;

        let adapter_dir = config.adapter_path();
        let artifact = AdapterArtifact::load(&adapter_dir)?;
        let manifest = artifact.manifest();

        let mut settings = config.model.clone();
        if manifest.template != settings.template {
            tracing::warn!(
                "Adapter was trained with the {} template; using it instead of the configured {}",
                manifest.template.template().family_name(),
                settings.template.template().family_name()
            );
            settings.template = manifest.template;
        }

        let preparer = ModelPreparer::new(settings);
        let resolved = preparer.resolve()?;
        artifact.validate_for(resolved.architecture(), &resolved.model_id())?;

        let mut handle = preparer.load(resolved, &manifest.lora)?;
        artifact.apply(&mut handle)?;

        tracing::info!(
            "Inference service ready: {} with adapter {} (run {})",
            handle.base_model(),
            adapter_dir.display(),
            manifest.run_id
        );
        Ok(Self::new(
            handle,
            manifest.template,
            config.inference.system_prompt.clone(),
            config.inference.sampling.clone(),
        ))
    }
}
