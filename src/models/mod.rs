// Models
// Base model loading, LoRA injection, adapter artifacts and generation

pub mod artifact;
pub mod download;
pub mod generator;
pub mod lora;
pub mod lora_impl;
pub mod preparer;
pub mod sampling;
pub mod templates;
pub mod transformer;

pub use artifact::{AdapterArtifact, AdapterManifest, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
pub use generator::TextGeneration;
pub use lora::{AdapterConfiguration, BiasMode, LoRAConfig};
pub use preparer::{ModelHandle, ModelPreparer, ResolvedModel};
pub use sampling::SamplingParams;
pub use templates::{ChatTemplate, PromptTemplate};
pub use transformer::{ArchitectureConfig, KvCache, ModelFamily, SequenceLayout};
