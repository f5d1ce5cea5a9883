// Metrics data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::{FinetuneError, FinetuneResult, TrainingFailure};

pub const EVAL_LOSS: &str = "eval_loss";
pub const EVAL_PERPLEXITY: &str = "eval_perplexity";
pub const EVAL_SAMPLES: &str = "eval_samples";
pub const EVAL_TOKENS: &str = "eval_tokens";
pub const EVAL_RUNTIME: &str = "eval_runtime";

/// Metric name to value, as produced by one evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationMetrics(BTreeMap<String, f64>);

impl EvaluationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// The evaluation loss, if this pass produced one
    pub fn loss(&self) -> Option<f64> {
        self.get(EVAL_LOSS)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for EvaluationMetrics {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a training pass did, reported by the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Optimizer steps taken in total (including resumed ones)
    pub global_steps: usize,
    pub epochs_completed: usize,
    /// Examples seen by this process
    pub examples_trained: usize,
    /// Mean loss over the last logging window
    pub final_train_loss: Option<f64>,
    pub duration_secs: f64,
    /// Adapter artifact written at the end of training
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<PathBuf>,
    /// Identifier shared by checkpoints, the artifact and the metrics record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Before/after comparison of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRunResult {
    /// initial loss - final loss; negative when training made things worse
    pub loss_reduction: f64,
    pub initial_metrics: EvaluationMetrics,
    pub final_metrics: EvaluationMetrics,
    pub training: TrainingStats,
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
}

impl TrainingRunResult {
    pub fn new(
        initial_metrics: EvaluationMetrics,
        final_metrics: EvaluationMetrics,
        training: TrainingStats,
    ) -> FinetuneResult<Self> {
        let missing = || {
            FinetuneError::evaluating(TrainingFailure::Compute(format!(
                "evaluation did not report '{}'",
                EVAL_LOSS
            )))
        };
        let initial = initial_metrics.loss().ok_or_else(missing)?;
        let final_loss = final_metrics.loss().ok_or_else(missing)?;

        let run_id = training
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            loss_reduction: initial - final_loss,
            initial_metrics,
            final_metrics,
            training,
            run_id,
            recorded_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss: f64) -> EvaluationMetrics {
        let mut m = EvaluationMetrics::new();
        m.insert(EVAL_LOSS, loss);
        m.insert(EVAL_PERPLEXITY, loss.exp());
        m
    }

    #[test]
    fn test_loss_reduction_is_exact_difference() {
        let result =
            TrainingRunResult::new(metrics(2.75), metrics(1.5), TrainingStats::default()).unwrap();
        assert_eq!(result.loss_reduction, 2.75 - 1.5);
    }

    #[test]
    fn test_loss_reduction_may_be_negative() {
        let result =
            TrainingRunResult::new(metrics(1.0), metrics(1.25), TrainingStats::default()).unwrap();
        assert!(result.loss_reduction < 0.0);
        assert_eq!(result.loss_reduction, 1.0 - 1.25);
    }

    #[test]
    fn test_missing_loss_is_an_evaluation_error() {
        let err = TrainingRunResult::new(
            EvaluationMetrics::new(),
            metrics(1.0),
            TrainingStats::default(),
        )
        .unwrap_err();
        assert_eq!(err.stage(), crate::errors::Stage::Evaluating);
    }

    #[test]
    fn test_metrics_serialize_as_flat_object() {
        let json = serde_json::to_value(metrics(0.5)).unwrap();
        assert_eq!(json["eval_loss"], 0.5);
        let back: EvaluationMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(back.loss(), Some(0.5));
    }
}
