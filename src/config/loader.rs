// Configuration loader
// Reads a TOML file into FinetuneConfig and validates it before anything expensive runs

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

use super::constants::CONFIG_PATH_ENV;
use super::settings::FinetuneConfig;
use crate::errors::{FinetuneError, FinetuneResult};

/// Pick the config file: explicit path, then $INSTRUCT_LORA_CONFIG
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
}

/// Load configuration from a TOML file.
///
/// `None` yields the built-in defaults. Missing sections fall back to their
/// defaults; unknown values and invalid combinations are configuration errors.
pub fn load_config(path: Option<&Path>) -> FinetuneResult<FinetuneConfig> {
    let config = match path {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))
                .map_err(|e| FinetuneError::Config(format!("{:#}", e)))?;
            let config: FinetuneConfig = toml::from_str(&contents).map_err(|e| {
                FinetuneError::Config(format!("{}: {}", path.display(), e))
            })?;
            tracing::info!("Loaded configuration from {}", path.display());
            config
        }
        None => {
            tracing::debug!("No config file given, using defaults");
            FinetuneConfig::default()
        }
    };

    config.validate()?;
    Ok(config)
}
