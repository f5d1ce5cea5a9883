// Inference module
// Adapter-aware prompt answering on top of a TextGeneration backend

mod service;

pub use service::{strip_prompt_echo, InferenceRequest, InferenceResponse, InferenceService};
