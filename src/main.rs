// instruct-lora - command line entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use instruct_lora::config::{load_config, resolve_config_path};
use instruct_lora::inference::{InferenceRequest, InferenceService};
use instruct_lora::pipeline::{latest_resume_point, run_training, with_resume};

/// Fine-tune a causal language model with LoRA adapters and query the result
#[derive(Parser)]
#[command(name = "instruct-lora")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML); falls back to $INSTRUCT_LORA_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate, fine-tune, evaluate again and record the loss reduction
    Train {
        /// Continue from a checkpoint-<step> directory
        #[arg(long, conflicts_with = "resume_latest")]
        resume: Option<PathBuf>,

        /// Continue from the newest checkpoint in the output directory
        #[arg(long)]
        resume_latest: bool,
    },

    /// Answer one prompt with the base model plus the trained adapter
    Infer {
        /// The question or instruction to answer
        prompt: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    instruct_lora::logging::init(cli.verbose);

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = load_config(config_path.as_deref())?;

    match cli.command {
        Commands::Train {
            resume,
            resume_latest,
        } => {
            let resume = if resume_latest {
                Some(latest_resume_point(&config)?)
            } else {
                resume
            };
            let config = with_resume(config, resume);
            let result = run_training(&config)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Infer { prompt } => {
            let mut service = InferenceService::load(&config)?;
            let response = service.respond(&InferenceRequest::new(prompt))?;
            println!("{}", response.text);
        }
    }

    Ok(())
}
