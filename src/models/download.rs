// Model file resolution - local directories or the Hugging Face Hub
// Hub downloads are cached under ~/.cache/huggingface/ by hf-hub

use anyhow::{bail, Context, Result};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::ModelSettings;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Shard file names listed in a safetensors index, in stable order
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;
    let index: WeightIndex =
        serde_json::from_str(&contents).context("Failed to parse safetensors index")?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        bail!("{} lists no weight files", index_path.display());
    }
    Ok(shards.into_iter().collect())
}

/// Where a base model's files come from.
///
/// Files are fetched one at a time so the small config can be checked before
/// the weights are downloaded.
pub enum ModelSource {
    Local(PathBuf),
    Hub { model_id: String, repo: ApiRepo },
}

impl ModelSource {
    /// An existing directory is used as-is; anything else is a Hub repo id
    pub fn open(settings: &ModelSettings) -> Result<Self> {
        let local = Path::new(&settings.base_model);
        if local.is_dir() {
            tracing::debug!("Using local model at {}", local.display());
            return Ok(ModelSource::Local(local.to_path_buf()));
        }

        let model_id = settings.base_model.clone();
        let mut builder = ApiBuilder::new();
        if let Some(token) = settings.resolved_token() {
            builder = builder.with_token(Some(token));
        }
        let api = builder
            .build()
            .context("Failed to create Hugging Face Hub client")?;
        let repo = match &settings.revision {
            Some(rev) => Repo::with_revision(model_id.clone(), RepoType::Model, rev.clone()),
            None => Repo::new(model_id.clone(), RepoType::Model),
        };
        tracing::info!("Fetching {} (cached after first download)", model_id);
        Ok(ModelSource::Hub {
            model_id,
            repo: api.repo(repo),
        })
    }

    pub fn id(&self) -> String {
        match self {
            ModelSource::Local(dir) => dir.display().to_string(),
            ModelSource::Hub { model_id, .. } => model_id.clone(),
        }
    }

    pub fn config(&self) -> Result<PathBuf> {
        self.file(CONFIG_FILE)
    }

    pub fn tokenizer(&self) -> Result<PathBuf> {
        self.file(TOKENIZER_FILE)
    }

    /// The single weights file, or every shard named by the index
    pub fn weights(&self) -> Result<Vec<PathBuf>> {
        if let Some(single) = self.optional_file(SINGLE_WEIGHTS_FILE) {
            return Ok(vec![single]);
        }
        let index = self.optional_file(WEIGHTS_INDEX_FILE).with_context(|| {
            format!(
                "{} has neither {} nor {}",
                self.id(),
                SINGLE_WEIGHTS_FILE,
                WEIGHTS_INDEX_FILE
            )
        })?;
        let shards = shard_names(&index)?;

        let pb = ProgressBar::new(shards.len() as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }

        let mut paths = Vec::with_capacity(shards.len());
        for shard in &shards {
            pb.set_message(shard.clone());
            paths.push(self.file(shard)?);
            pb.inc(1);
        }
        pb.finish_with_message("weights ready");
        Ok(paths)
    }

    fn file(&self, name: &str) -> Result<PathBuf> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(name);
                if !path.is_file() {
                    bail!("{} is missing {}", dir.display(), name);
                }
                Ok(path)
            }
            ModelSource::Hub { model_id, repo } => repo
                .get(name)
                .with_context(|| format!("Failed to download {} from {}", name, model_id)),
        }
    }

    fn optional_file(&self, name: &str) -> Option<PathBuf> {
        match self.file(name) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!("Skipped {} ({:#})", name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn settings_for(dir: &Path) -> ModelSettings {
        ModelSettings {
            base_model: dir.display().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_single_file() {
        let dir = TempDir::new().unwrap();
        for name in [CONFIG_FILE, TOKENIZER_FILE, SINGLE_WEIGHTS_FILE] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        let source = ModelSource::open(&settings_for(dir.path())).unwrap();
        assert_eq!(source.config().unwrap(), dir.path().join(CONFIG_FILE));
        assert_eq!(
            source.weights().unwrap(),
            vec![dir.path().join(SINGLE_WEIGHTS_FILE)]
        );
    }

    #[test]
    fn test_local_sharded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        fs::write(dir.path().join(TOKENIZER_FILE), "{}").unwrap();
        fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join("model-00001.safetensors"), "").unwrap();
        fs::write(dir.path().join("model-00002.safetensors"), "").unwrap();

        let source = ModelSource::open(&settings_for(dir.path())).unwrap();
        assert_eq!(
            source.weights().unwrap(),
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_local_missing_tokenizer() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        let source = ModelSource::open(&settings_for(dir.path())).unwrap();
        assert!(source.config().is_ok());
        let err = source.tokenizer().unwrap_err();
        assert!(err.to_string().contains(TOKENIZER_FILE));
        assert!(source.weights().is_err());
    }
}
