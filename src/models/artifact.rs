// Adapter artifact - the persisted output of a training run
//
// A directory holding adapter_model.safetensors and adapter_config.json. The
// config is renamed into place last, so a directory with a config always has
// complete weights next to it.

use anyhow::Context;
use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::lora::{BiasMode, LoRAConfig};
use super::lora_impl::{bias_name, lora_a_name, lora_b_name};
use super::preparer::ModelHandle;
use super::templates::PromptTemplate;
use super::transformer::ArchitectureConfig;
use crate::errors::{FinetuneError, FinetuneResult};

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
const FORMAT_VERSION: u32 = 1;

/// Contents of adapter_config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterManifest {
    pub format_version: u32,
    /// Repo id or path the adapter was trained against
    pub base_model: String,
    /// ArchitectureConfig::fingerprint of that model
    pub architecture: String,
    pub lora: LoRAConfig,
    pub template: PromptTemplate,
    /// Hex SHA-256 of adapter_model.safetensors
    pub weights_sha256: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

/// Hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Every tensor name an adapter for `lora` on `architecture` must contain
pub fn expected_adapter_shapes(
    architecture: &ArchitectureConfig,
    lora: &LoRAConfig,
) -> BTreeMap<String, Vec<usize>> {
    let mut shapes = BTreeMap::new();
    for layer in 0..architecture.num_hidden_layers {
        for name in architecture.projection_names() {
            let Some((out_dim, in_dim)) = architecture.projection_dims(name) else {
                continue;
            };
            let path = architecture.module_path(layer, name);
            let adapted = lora.targets(name);
            if adapted {
                shapes.insert(lora_a_name(&path), vec![lora.rank, in_dim]);
                shapes.insert(lora_b_name(&path), vec![out_dim, lora.rank]);
            }
            let trainable_bias = match lora.bias {
                BiasMode::None => false,
                BiasMode::All => true,
                BiasMode::LoraOnly => adapted,
            };
            if trainable_bias && architecture.projection_has_bias(name) {
                shapes.insert(bias_name(&path), vec![out_dim]);
            }
        }
    }
    shapes
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes)
        .with_context(|| format!("Failed to write to {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })
}

/// Serialize tensors in safetensors format with PEFT's metadata
pub fn serialize_tensors(tensors: &HashMap<String, Tensor>) -> anyhow::Result<Vec<u8>> {
    let metadata: HashMap<String, String> = [("format".to_string(), "pt".to_string())].into();
    let mut entries: Vec<(&str, &Tensor)> = tensors.iter().map(|(k, v)| (k.as_str(), v)).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    safetensors::serialize(entries, &Some(metadata)).context("Failed to serialize tensors")
}

/// A loaded, checksum-verified adapter
#[derive(Debug)]
pub struct AdapterArtifact {
    dir: PathBuf,
    manifest: AdapterManifest,
    tensors: HashMap<String, Tensor>,
}

impl AdapterArtifact {
    /// Write the handle's adapter into `dir`
    pub fn save(dir: &Path, handle: &ModelHandle, run_id: &str) -> FinetuneResult<AdapterManifest> {
        let persist_err = |e: anyhow::Error| FinetuneError::ArtifactPersist {
            path: dir.to_path_buf(),
            reason: format!("{:#}", e),
        };

        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))
            .map_err(persist_err)?;

        let tensors = handle.adapter_tensors().map_err(persist_err)?;
        let bytes = serialize_tensors(&tensors).map_err(persist_err)?;

        let manifest = AdapterManifest {
            format_version: FORMAT_VERSION,
            base_model: handle.base_model().to_string(),
            architecture: handle.architecture().fingerprint(),
            lora: handle.adapter_config().clone(),
            template: handle.template(),
            weights_sha256: sha256_hex(&bytes),
            run_id: run_id.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&manifest)
            .context("Failed to serialize adapter config")
            .map_err(persist_err)?;

        write_atomic(&dir.join(ADAPTER_WEIGHTS_FILE), &bytes).map_err(persist_err)?;
        write_atomic(&dir.join(ADAPTER_CONFIG_FILE), json.as_bytes()).map_err(persist_err)?;

        tracing::info!(
            "Saved adapter ({} tensors) to {}",
            tensors.len(),
            dir.display()
        );
        Ok(manifest)
    }

    /// Read and verify an artifact directory
    pub fn load(dir: &Path) -> FinetuneResult<Self> {
        let fail = |reason: String| FinetuneError::adapter_load(dir, reason);

        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        if !config_path.is_file() {
            return Err(fail(format!("{} not found", ADAPTER_CONFIG_FILE)));
        }
        if !weights_path.is_file() {
            return Err(fail(format!("{} not found", ADAPTER_WEIGHTS_FILE)));
        }

        let json = fs::read_to_string(&config_path)
            .map_err(|e| fail(format!("cannot read {}: {}", ADAPTER_CONFIG_FILE, e)))?;
        let manifest: AdapterManifest = serde_json::from_str(&json)
            .map_err(|e| fail(format!("malformed {}: {}", ADAPTER_CONFIG_FILE, e)))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(fail(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }
        manifest
            .lora
            .validate()
            .map_err(|e| fail(format!("invalid adapter hyperparameters: {}", e)))?;

        let bytes = fs::read(&weights_path)
            .map_err(|e| fail(format!("cannot read {}: {}", ADAPTER_WEIGHTS_FILE, e)))?;
        let checksum = sha256_hex(&bytes);
        if checksum != manifest.weights_sha256 {
            return Err(fail(format!(
                "checksum mismatch for {} (expected {}, found {})",
                ADAPTER_WEIGHTS_FILE, manifest.weights_sha256, checksum
            )));
        }

        let tensors = candle_core::safetensors::load_buffer(&bytes, &Device::Cpu)
            .map_err(|e| fail(format!("malformed {}: {}", ADAPTER_WEIGHTS_FILE, e)))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            tensors,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &AdapterManifest {
        &self.manifest
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    /// Check the adapter fits a base model before its weights are loaded
    pub fn validate_for(&self, architecture: &ArchitectureConfig, base_model: &str) -> FinetuneResult<()> {
        let fail = |reason: String| FinetuneError::adapter_load(&self.dir, reason);

        self.manifest
            .lora
            .validate_targets(&architecture.projection_names())
            .map_err(|e| {
                fail(format!(
                    "target modules {:?} do not match the base model: {}",
                    self.manifest.lora.target_modules, e
                ))
            })?;

        let fingerprint = architecture.fingerprint();
        if fingerprint != self.manifest.architecture {
            return Err(fail(format!(
                "trained for architecture {} but the base model is {}",
                self.manifest.architecture, fingerprint
            )));
        }

        let expected = expected_adapter_shapes(architecture, &self.manifest.lora);
        for (name, shape) in &expected {
            match self.tensors.get(name) {
                Some(t) if t.dims() == shape.as_slice() => {}
                Some(t) => {
                    return Err(fail(format!(
                        "tensor {} has shape {:?}, expected {:?}",
                        name,
                        t.dims(),
                        shape
                    )))
                }
                None => return Err(fail(format!("tensor {} is missing", name))),
            }
        }
        if let Some(extra) = self.tensors.keys().find(|k| !expected.contains_key(*k)) {
            return Err(fail(format!(
                "tensor {} does not belong to the configured target modules",
                extra
            )));
        }

        if base_model != self.manifest.base_model {
            tracing::warn!(
                "Adapter was trained on '{}' but is being applied to '{}' (same architecture)",
                self.manifest.base_model,
                base_model
            );
        }
        Ok(())
    }

    /// Copy the adapter weights into a handle built with the same LoRA config
    pub fn apply(&self, handle: &mut ModelHandle) -> FinetuneResult<()> {
        handle
            .load_adapter_tensors(&self.tensors)
            .map_err(|e| FinetuneError::adapter_load(&self.dir, format!("{:#}", e)))
    }
}
