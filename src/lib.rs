// instruct-lora - LoRA fine-tuning of causal language models on instruction
// data, with an adapter-aware inference service
// Library exports

pub mod config;
pub mod errors;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod training;

pub use errors::{FinetuneError, FinetuneResult, Stage};
