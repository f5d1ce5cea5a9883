// End-to-end training pipeline
//
// configure -> format -> load -> evaluate/train/evaluate -> persist.
// Cheap validation runs before the model is touched.

use std::path::PathBuf;

use crate::config::FinetuneConfig;
use crate::errors::{FinetuneError, FinetuneResult};
use crate::metrics::{MetricsRecorder, TrainingRunResult};
use crate::models::ModelPreparer;
use crate::training::{latest_checkpoint, InstructionDataset, Trainer};

/// Run one fine-tuning job described by `config`.
///
/// A metrics write failure is logged and the computed result is still
/// returned; every other failure aborts the run.
pub fn run_training(config: &FinetuneConfig) -> FinetuneResult<TrainingRunResult> {
    config.validate()?;
    let template = config.model.template;

    let train_data = InstructionDataset::open(&config.data.train_path, template)?;
    let eval_data = match &config.data.eval_path {
        Some(path) => InstructionDataset::open(path, template)?,
        None => {
            tracing::info!("No eval_path configured; evaluating on the training set");
            train_data.clone()
        }
    };

    let handle = ModelPreparer::new(config.model.clone())
        .with_seed(config.training.seed)
        .prepare(&config.adapter)?;

    let mut trainer = Trainer::new(handle, config.training.clone(), train_data, eval_data)?;
    let recorder = MetricsRecorder::new(&config.metrics.path);

    match recorder.record(&mut trainer) {
        Ok(result) => Ok(result),
        Err(FinetuneError::MetricsPersist { path, source, result }) => {
            tracing::warn!(
                "Training finished but metrics could not be written to {}: {}",
                path.display(),
                source
            );
            Ok(*result)
        }
        Err(e) => Err(e),
    }
}

/// Override the resume point from the command line
pub fn with_resume(mut config: FinetuneConfig, resume: Option<PathBuf>) -> FinetuneConfig {
    if let Some(path) = resume {
        config.training.resume_from = Some(path);
    }
    config
}

/// Newest complete checkpoint under the configured output directory
pub fn latest_resume_point(config: &FinetuneConfig) -> FinetuneResult<PathBuf> {
    let output_dir = &config.training.output_dir;
    latest_checkpoint(output_dir).ok_or_else(|| {
        FinetuneError::Config(format!(
            "no checkpoint to resume from under {}",
            output_dir.display()
        ))
    })
}
