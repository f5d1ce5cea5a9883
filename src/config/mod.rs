// Configuration module
// Public interface for configuration loading

mod backend;
pub mod constants;
mod loader;
mod settings;

pub use backend::{ComputeDType, ExecutionTarget, Precision};
pub use loader::{load_config, resolve_config_path};
pub use settings::{
    DataSettings, FinetuneConfig, InferenceSettings, LrScheduler, MetricsSettings,
    ModelSettings, TrainingConfiguration,
};
