// Metrics module
// Before/after evaluation records for training runs

mod recorder;
mod types;

pub use recorder::{MetricsRecorder, TrainingSession};
pub use types::{
    EvaluationMetrics, TrainingRunResult, TrainingStats, EVAL_LOSS, EVAL_PERPLEXITY,
    EVAL_RUNTIME, EVAL_SAMPLES, EVAL_TOKENS,
};
