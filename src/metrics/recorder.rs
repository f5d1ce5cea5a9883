// Metrics recorder - wraps a training session with before/after evaluation

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::types::{EvaluationMetrics, TrainingRunResult, TrainingStats};
use crate::errors::{FinetuneError, FinetuneResult};

/// Something that can be evaluated, trained, and evaluated again.
///
/// Both evaluations must use the same protocol so the losses are comparable.
pub trait TrainingSession {
    fn evaluate(&mut self) -> FinetuneResult<EvaluationMetrics>;
    fn train(&mut self) -> FinetuneResult<TrainingStats>;
}

pub struct MetricsRecorder {
    path: PathBuf,
}

impl MetricsRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Evaluate, train, evaluate, then persist the comparison.
    ///
    /// A failed write returns `MetricsPersist`, which still carries the result.
    pub fn record<S: TrainingSession + ?Sized>(
        &self,
        session: &mut S,
    ) -> FinetuneResult<TrainingRunResult> {
        tracing::info!("Evaluating before training");
        let initial = session.evaluate()?;
        log_metrics("initial", &initial);

        let stats = session.train()?;

        tracing::info!("Evaluating after training");
        let final_metrics = session.evaluate()?;
        log_metrics("final", &final_metrics);

        let result = TrainingRunResult::new(initial, final_metrics, stats)?;
        tracing::info!("Loss reduction: {:.6}", result.loss_reduction);

        if let Err(source) = self.persist(&result) {
            tracing::error!(
                "Failed to write metrics to {}: {}",
                self.path.display(),
                source
            );
            return Err(FinetuneError::MetricsPersist {
                path: self.path.clone(),
                source,
                result: Box::new(result),
            });
        }

        tracing::info!("Metrics saved to {}", self.path.display());
        Ok(result)
    }

    /// Write the result as pretty JSON (atomic write)
    pub fn persist(&self, result: &TrainingRunResult) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(result)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path).inspect_err(|_| {
            let _ = fs::remove_file(&temp_path);
        })
    }

    /// Read a previously written result
    pub fn load(path: &Path) -> anyhow::Result<TrainingRunResult> {
        use anyhow::Context;
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read metrics file: {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse metrics file")
    }
}

fn log_metrics(label: &str, metrics: &EvaluationMetrics) {
    for (name, value) in metrics.iter() {
        tracing::info!("{} {} = {:.6}", label, name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TrainingFailure;
    use crate::metrics::types::EVAL_LOSS;
    use tempfile::TempDir;

    /// Session whose loss drops by a fixed amount per train() call
    struct ScriptedSession {
        loss: f64,
        drop: f64,
        fail_training: bool,
        calls: Vec<&'static str>,
    }

    impl ScriptedSession {
        fn new(loss: f64, drop: f64) -> Self {
            Self {
                loss,
                drop,
                fail_training: false,
                calls: Vec::new(),
            }
        }
    }

    impl TrainingSession for ScriptedSession {
        fn evaluate(&mut self) -> FinetuneResult<EvaluationMetrics> {
            self.calls.push("evaluate");
            let mut m = EvaluationMetrics::new();
            m.insert(EVAL_LOSS, self.loss);
            Ok(m)
        }

        fn train(&mut self) -> FinetuneResult<TrainingStats> {
            self.calls.push("train");
            if self.fail_training {
                return Err(FinetuneError::training(TrainingFailure::Diverged {
                    step: 1,
                    loss: f64::INFINITY,
                }));
            }
            self.loss -= self.drop;
            Ok(TrainingStats {
                global_steps: 3,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_record_evaluates_around_training() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outputs/nested/metrics.json");
        let recorder = MetricsRecorder::new(&path);
        let mut session = ScriptedSession::new(2.0, 0.5);

        let result = recorder.record(&mut session).unwrap();
        assert_eq!(session.calls, vec!["evaluate", "train", "evaluate"]);
        assert_eq!(result.loss_reduction, 0.5);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["loss_reduction"], 0.5);
        assert_eq!(json["initial_metrics"]["eval_loss"], 2.0);
        assert_eq!(json["final_metrics"]["eval_loss"], 1.5);

        let loaded = MetricsRecorder::load(&path).unwrap();
        assert_eq!(loaded, result);
    }

    #[test]
    fn test_persist_failure_keeps_result() {
        let dir = TempDir::new().unwrap();
        // A regular file where a directory is expected
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let recorder = MetricsRecorder::new(blocker.join("metrics.json"));
        let mut session = ScriptedSession::new(3.0, 1.0);

        match recorder.record(&mut session) {
            Err(FinetuneError::MetricsPersist { result, .. }) => {
                assert_eq!(result.loss_reduction, 1.0);
                assert_eq!(result.training.global_steps, 3);
            }
            other => panic!("expected MetricsPersist, got {:?}", other),
        }
    }

    #[test]
    fn test_training_failure_skips_final_evaluation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let recorder = MetricsRecorder::new(&path);
        let mut session = ScriptedSession::new(1.0, 0.1);
        session.fail_training = true;

        assert!(recorder.record(&mut session).is_err());
        assert_eq!(session.calls, vec!["evaluate", "train"]);
        assert!(!path.exists());
    }
}
