// Error taxonomy
//
// Every failure surfaced by a pipeline stage is a FinetuneError. Display
// messages start with the stage name because the stages differ wildly in
// how expensive they are to re-run.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::metrics::TrainingRunResult;

pub type FinetuneResult<T> = std::result::Result<T, FinetuneError>;

/// Pipeline stage a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuring,
    Formatting,
    Loading,
    Training,
    Evaluating,
    Persisting,
    Serving,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Configuring => "configuring",
            Stage::Formatting => "formatting",
            Stage::Loading => "loading",
            Stage::Training => "training",
            Stage::Evaluating => "evaluating",
            Stage::Persisting => "persisting",
            Stage::Serving => "serving",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a training run stopped early. None of these are retried.
#[derive(Debug, Error)]
pub enum TrainingFailure {
    #[error("loss became non-finite ({loss}) at step {step}")]
    Diverged { step: usize, loss: f64 },

    #[error("out of memory: {0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Compute(String),

    #[error("checkpoint {} could not be written: {reason}", .path.display())]
    Checkpoint { path: PathBuf, reason: String },

    #[error("cannot resume from {}: {reason}", .path.display())]
    Resume { path: PathBuf, reason: String },
}

impl TrainingFailure {
    /// Classify a backend error raised inside a training or evaluation step
    pub fn from_compute(err: &anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let lowered = message.to_lowercase();
        if lowered.contains("out of memory")
            || lowered.contains("out_of_memory")
            || lowered.contains("failed to allocate")
        {
            TrainingFailure::ResourceExhausted(message)
        } else {
            TrainingFailure::Compute(message)
        }
    }
}

#[derive(Debug, Error)]
pub enum FinetuneError {
    #[error("configuring failed: {0}")]
    Config(String),

    #[error("formatting failed: {}{}: {reason}", .path.display(), .line.map(|l| format!(":{}", l)).unwrap_or_default())]
    DataFormat {
        path: PathBuf,
        line: Option<usize>,
        reason: String,
    },

    #[error("loading failed for model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("loading failed: adapter target error: {0}")]
    AdapterTarget(String),

    #[error("{stage} failed: {source}")]
    Training {
        stage: Stage,
        #[source]
        source: TrainingFailure,
    },

    #[error("persisting failed: could not write metrics to {}: {source}", .path.display())]
    MetricsPersist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        /// The computed result survives a failed write
        result: Box<TrainingRunResult>,
    },

    #[error("persisting failed: could not write adapter artifact to {}: {reason}", .path.display())]
    ArtifactPersist { path: PathBuf, reason: String },

    #[error("loading failed: adapter artifact {} is unusable: {reason}", .path.display())]
    AdapterLoad { path: PathBuf, reason: String },

    #[error("serving failed: {0}")]
    Generation(String),
}

impl FinetuneError {
    pub fn stage(&self) -> Stage {
        match self {
            FinetuneError::Config(_) => Stage::Configuring,
            FinetuneError::DataFormat { .. } => Stage::Formatting,
            FinetuneError::ModelLoad { .. }
            | FinetuneError::AdapterTarget(_)
            | FinetuneError::AdapterLoad { .. } => Stage::Loading,
            FinetuneError::Training { stage, .. } => *stage,
            FinetuneError::MetricsPersist { .. } | FinetuneError::ArtifactPersist { .. } => {
                Stage::Persisting
            }
            FinetuneError::Generation(_) => Stage::Serving,
        }
    }

    pub fn training(source: TrainingFailure) -> Self {
        FinetuneError::Training {
            stage: Stage::Training,
            source,
        }
    }

    pub fn evaluating(source: TrainingFailure) -> Self {
        FinetuneError::Training {
            stage: Stage::Evaluating,
            source,
        }
    }

    pub fn model_load(model: impl Into<String>, err: &anyhow::Error) -> Self {
        FinetuneError::ModelLoad {
            model: model.into(),
            reason: format!("{:#}", err),
        }
    }

    pub fn adapter_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FinetuneError::AdapterLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_lead_with_stage() {
        let err = FinetuneError::DataFormat {
            path: PathBuf::from("data/train.jsonl"),
            line: Some(3),
            reason: "missing field `output`".to_string(),
        };
        assert_eq!(err.stage(), Stage::Formatting);
        assert_eq!(
            err.to_string(),
            "formatting failed: data/train.jsonl:3: missing field `output`"
        );

        let err = FinetuneError::training(TrainingFailure::Diverged {
            step: 7,
            loss: f64::NAN,
        });
        assert_eq!(err.stage(), Stage::Training);
        assert!(err.to_string().starts_with("training failed: loss became non-finite"));

        let err = FinetuneError::evaluating(TrainingFailure::Compute("boom".into()));
        assert!(err.to_string().starts_with("evaluating failed"));
    }

    #[test]
    fn test_out_of_memory_is_classified() {
        let err = anyhow::anyhow!("CUDA_ERROR_OUT_OF_MEMORY: out of memory");
        assert!(matches!(
            TrainingFailure::from_compute(&err),
            TrainingFailure::ResourceExhausted(_)
        ));

        let err = anyhow::anyhow!("shape mismatch in matmul");
        assert!(matches!(
            TrainingFailure::from_compute(&err),
            TrainingFailure::Compute(_)
        ));
    }
}
