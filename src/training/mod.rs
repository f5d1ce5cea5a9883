// Training module
// Dataset formatting, window planning, optimization and checkpointing

pub mod batching;
pub mod checkpoint;
pub mod dataset;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::{latest_checkpoint, TrainerState};
pub use dataset::{FormattedExample, InstructionDataset, TrainingExample};
pub use optimizer::OptimizerKind;
pub use trainer::Trainer;
