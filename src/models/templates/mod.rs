// Prompt templates
//
// Each model family wraps instructions and responses in its own markers. The
// same template must be used for training and for inference, so it is a
// configuration option rather than something guessed from the data.

mod chatml;
mod llama3;
mod mistral;

pub use chatml::ChatMlTemplate;
pub use llama3::Llama3Template;
pub use mistral::MistralTemplate;

use serde::{Deserialize, Serialize};

/// Template behaviour shared by training and generation
pub trait ChatTemplate: Send + Sync {
    /// Full training text: instruction segment followed by the response segment
    fn format_example(&self, prompt: &str, output: &str) -> String;

    /// Inference prompt ending where the model should start answering
    fn format_chat_prompt(&self, system: &str, user_message: &str) -> String;

    /// Token that ends a response
    fn eos_token(&self) -> &'static str;

    /// Strip template markers from generated text
    fn clean_output(&self, raw_output: &str) -> String;

    fn family_name(&self) -> &'static str;
}

/// Configurable template choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptTemplate {
    /// `<s>[INST] ... [/INST] ...</s>`
    #[default]
    Mistral,
    /// Qwen family
    ChatMl,
    Llama3,
}

impl PromptTemplate {
    pub fn template(&self) -> &'static dyn ChatTemplate {
        match self {
            PromptTemplate::Mistral => &MistralTemplate,
            PromptTemplate::ChatMl => &ChatMlTemplate,
            PromptTemplate::Llama3 => &Llama3Template,
        }
    }
}

/// Instruction text with the optional input appended on its own line
pub fn join_prompt(instruction: &str, input: &str) -> String {
    if input.trim().is_empty() {
        instruction.to_string()
    } else {
        format!("{}\n{}", instruction, input)
    }
}
