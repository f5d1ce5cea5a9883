// Project-wide constants
//
// Defaults for the canonical fine-tuning run live here so the config structs,
// the CLI and the tests agree on one source of truth.

/// Base model used when the config does not name one (unquantized Mistral 7B v0.3 mirror).
pub const DEFAULT_BASE_MODEL: &str = "unsloth/mistral-7b-v0.3";

/// Truncation / packing window in tokens.
pub const DEFAULT_MAX_SEQ_LENGTH: usize = 2048;

pub const DEFAULT_LORA_RANK: usize = 16;
pub const DEFAULT_LORA_ALPHA: f64 = 16.0;

/// Projection layers adapted by default: all attention and MLP projections.
pub const DEFAULT_TARGET_MODULES: [&str; 7] = [
    "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj",
];

pub const DEFAULT_EPOCHS: usize = 3;
pub const DEFAULT_BATCH_SIZE: usize = 2;
pub const DEFAULT_GRADIENT_ACCUMULATION: usize = 4;
pub const DEFAULT_LEARNING_RATE: f64 = 2e-4;
pub const DEFAULT_OPTIMIZER: &str = "adamw";
pub const DEFAULT_LOGGING_STEPS: usize = 1;
pub const DEFAULT_SAVE_STEPS: usize = 500;
pub const DEFAULT_MAX_GRAD_NORM: f64 = 1.0;
pub const DEFAULT_SEED: u64 = 42;

pub const DEFAULT_TRAIN_PATH: &str = "data/training_data.jsonl";
pub const DEFAULT_OUTPUT_DIR: &str = "finetuned_model";
pub const DEFAULT_METRICS_PATH: &str = "outputs/metrics.json";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a friendly data analyst who explains blockchain analytics clearly while staying accurate.";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.1;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 560;

/// Environment variable consulted for a Hugging Face Hub token.
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";

/// Environment variable naming the config file when `--config` is omitted.
pub const CONFIG_PATH_ENV: &str = "INSTRUCT_LORA_CONFIG";
