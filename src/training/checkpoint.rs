// Periodic training checkpoints
//
// Layout of <output_dir>/checkpoint-<step>/:
//   adapter_model.safetensors   trainable tensors
//   optimizer.safetensors       optimizer moments (absent for sgd)
//   trainer_state.json          progress counters
//
// A checkpoint is written into checkpoint-<step>.partial and renamed when
// complete, so a checkpoint-<step> directory is always whole.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::artifact::{serialize_tensors, ADAPTER_WEIGHTS_FILE};

pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Progress counters stored next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps completed
    pub global_step: usize,
    /// Epoch the next micro-batch belongs to
    pub epoch: usize,
    /// Micro-batches of that epoch already consumed
    pub micro_batches_done: usize,
    pub run_id: String,
    /// Mean training loss over the most recent logging window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_loss: Option<f64>,
}

/// A checkpoint read back from disk
#[derive(Debug)]
pub struct Checkpoint {
    pub dir: PathBuf,
    pub state: TrainerState,
    pub adapter: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, Tensor>,
}

pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
}

/// Write one checkpoint and return its directory
pub fn save_checkpoint(
    output_dir: &Path,
    state: &TrainerState,
    adapter: &HashMap<String, Tensor>,
    optimizer: &HashMap<String, Tensor>,
) -> Result<PathBuf> {
    let final_dir = checkpoint_dir(output_dir, state.global_step);
    let partial = final_dir.with_extension("partial");

    if partial.exists() {
        fs::remove_dir_all(&partial)
            .with_context(|| format!("Failed to clear {}", partial.display()))?;
    }
    fs::create_dir_all(&partial)
        .with_context(|| format!("Failed to create directory {}", partial.display()))?;

    fs::write(partial.join(ADAPTER_WEIGHTS_FILE), serialize_tensors(adapter)?)
        .context("Failed to write adapter weights")?;
    if !optimizer.is_empty() {
        fs::write(partial.join(OPTIMIZER_FILE), serialize_tensors(optimizer)?)
            .context("Failed to write optimizer state")?;
    }
    let json = serde_json::to_string_pretty(state)?;
    fs::write(partial.join(TRAINER_STATE_FILE), json).context("Failed to write trainer state")?;

    if final_dir.exists() {
        fs::remove_dir_all(&final_dir)
            .with_context(|| format!("Failed to replace {}", final_dir.display()))?;
    }
    fs::rename(&partial, &final_dir).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            partial.display(),
            final_dir.display()
        )
    })?;

    tracing::debug!("Checkpoint written to {}", final_dir.display());
    Ok(final_dir)
}

/// Read a checkpoint directory
pub fn load_checkpoint(dir: &Path) -> Result<Checkpoint> {
    let state_path = dir.join(TRAINER_STATE_FILE);
    let json = fs::read_to_string(&state_path)
        .with_context(|| format!("cannot read {}", state_path.display()))?;
    let state: TrainerState = serde_json::from_str(&json)
        .with_context(|| format!("malformed {}", state_path.display()))?;

    let adapter = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILE), &Device::Cpu)
        .with_context(|| format!("cannot read {}", ADAPTER_WEIGHTS_FILE))?;

    let optimizer_path = dir.join(OPTIMIZER_FILE);
    let optimizer = if optimizer_path.is_file() {
        candle_core::safetensors::load(&optimizer_path, &Device::Cpu)
            .with_context(|| format!("cannot read {}", OPTIMIZER_FILE))?
    } else {
        HashMap::new()
    };

    Ok(Checkpoint {
        dir: dir.to_path_buf(),
        state,
        adapter,
        optimizer,
    })
}

/// Highest-numbered complete checkpoint under `output_dir`
pub fn latest_checkpoint(output_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(output_dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let step = name.strip_prefix(CHECKPOINT_PREFIX)?.parse::<usize>().ok()?;
            Some((step, entry.path()))
        })
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(step: usize) -> TrainerState {
        TrainerState {
            global_step: step,
            epoch: 1,
            micro_batches_done: 4,
            run_id: "run".into(),
            last_loss: Some(1.25),
        }
    }

    fn tensors() -> HashMap<String, Tensor> {
        let mut map = HashMap::new();
        map.insert(
            "a.lora_A.weight".to_string(),
            Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap(),
        );
        map
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = save_checkpoint(dir.path(), &state(10), &tensors(), &HashMap::new()).unwrap();
        assert_eq!(path, dir.path().join("checkpoint-10"));
        assert!(!dir.path().join("checkpoint-10.partial").exists());

        let checkpoint = load_checkpoint(&path).unwrap();
        assert_eq!(checkpoint.state, state(10));
        assert!(checkpoint.optimizer.is_empty());
        assert_eq!(
            checkpoint.adapter["a.lora_A.weight"].to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
    }

    #[test]
    fn test_latest_ignores_partial_and_stray_entries() {
        let dir = TempDir::new().unwrap();
        save_checkpoint(dir.path(), &state(5), &tensors(), &HashMap::new()).unwrap();
        save_checkpoint(dir.path(), &state(20), &tensors(), &HashMap::new()).unwrap();
        fs::create_dir_all(dir.path().join("checkpoint-30.partial")).unwrap();
        fs::write(dir.path().join("checkpoint-40"), b"not a dir").unwrap();

        assert_eq!(
            latest_checkpoint(dir.path()),
            Some(dir.path().join("checkpoint-20"))
        );
    }

    #[test]
    fn test_missing_state_fails() {
        let dir = TempDir::new().unwrap();
        assert!(load_checkpoint(dir.path()).is_err());
    }
}
