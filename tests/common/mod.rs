// Shared fixtures: a tiny Mistral-shaped model written to a temp directory

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use instruct_lora::config::{ExecutionTarget, FinetuneConfig, Precision};
use instruct_lora::models::LoRAConfig;

pub const VOCAB_SIZE: usize = 64;
pub const HIDDEN_SIZE: usize = 32;

const SPECIAL_TOKENS: [&str; 5] = ["<unk>", "<s>", "</s>", "[INST]", "[/INST]"];

const WORDS: [&str; 48] = [
    "what", "is", "tvl", "total", "value", "locked", "define", "summarize", "the", "a", "of",
    "volume", "rose", "grew", "by", "percent", "blockchain", "data", "bunny", "analytics",
    "explain", "token", "price", "liquidity", "pool", "swap", "fee", "market", "cap", "supply",
    "wallet", "address", "gas", "transaction", "block", "hash", "yes", "no", "you", "are",
    "helpful", "friendly", "analyst", "hi", "ok", "?", ".", ",",
];

/// Word-level tokenizer over a fixed vocabulary with the Mistral markers
pub fn tokenizer_json() -> serde_json::Value {
    let mut vocab = serde_json::Map::new();
    let mut id = 0;
    for token in SPECIAL_TOKENS.iter().chain(WORDS.iter()) {
        vocab.insert(token.to_string(), json!(id));
        id += 1;
    }
    while id < VOCAB_SIZE {
        vocab.insert(format!("w{}", id), json!(id));
        id += 1;
    }

    let added: Vec<serde_json::Value> = SPECIAL_TOKENS
        .iter()
        .enumerate()
        .map(|(id, content)| {
            json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();

    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    })
}

pub fn config_json(hidden_size: usize) -> serde_json::Value {
    json!({
        "architectures": ["MistralForCausalLM"],
        "model_type": "mistral",
        "vocab_size": VOCAB_SIZE,
        "hidden_size": hidden_size,
        "intermediate_size": hidden_size * 2,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "max_position_embeddings": 256,
        "tie_word_embeddings": false
    })
}

fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> Tensor {
    let n: usize = dims.iter().product();
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.2f32..0.2)).collect();
    Tensor::from_vec(values, dims, &Device::Cpu).unwrap()
}

/// Write config.json, tokenizer.json and model.safetensors into `dir`
pub fn write_model(dir: &Path, hidden_size: usize) {
    fs::create_dir_all(dir).unwrap();
    let intermediate = hidden_size * 2;
    let head_dim = hidden_size / 4;
    let kv = 2 * head_dim;
    let mut rng = StdRng::seed_from_u64(11);

    let mut weights: HashMap<String, Tensor> = HashMap::new();
    weights.insert(
        "model.embed_tokens.weight".into(),
        random_tensor(&mut rng, &[VOCAB_SIZE, hidden_size]),
    );
    weights.insert(
        "lm_head.weight".into(),
        random_tensor(&mut rng, &[VOCAB_SIZE, hidden_size]),
    );
    weights.insert(
        "model.norm.weight".into(),
        Tensor::ones(hidden_size, DType::F32, &Device::Cpu).unwrap(),
    );
    for layer in 0..2 {
        let shapes = [
            ("self_attn.q_proj", [hidden_size, hidden_size]),
            ("self_attn.k_proj", [kv, hidden_size]),
            ("self_attn.v_proj", [kv, hidden_size]),
            ("self_attn.o_proj", [hidden_size, hidden_size]),
            ("mlp.gate_proj", [intermediate, hidden_size]),
            ("mlp.up_proj", [intermediate, hidden_size]),
            ("mlp.down_proj", [hidden_size, intermediate]),
        ];
        for (name, dims) in shapes {
            weights.insert(
                format!("model.layers.{}.{}.weight", layer, name),
                random_tensor(&mut rng, &dims),
            );
        }
        for norm in ["input_layernorm", "post_attention_layernorm"] {
            weights.insert(
                format!("model.layers.{}.{}.weight", layer, norm),
                Tensor::ones(hidden_size, DType::F32, &Device::Cpu).unwrap(),
            );
        }
    }

    candle_core::safetensors::save(&weights, dir.join("model.safetensors")).unwrap();
    fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(&config_json(hidden_size)).unwrap(),
    )
    .unwrap();
    fs::write(
        dir.join("tokenizer.json"),
        serde_json::to_string_pretty(&tokenizer_json()).unwrap(),
    )
    .unwrap();
}

pub fn write_jsonl(path: &Path, lines: &[String]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = fs::File::create(path).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
}

pub fn record(instruction: &str, input: &str, output: &str) -> String {
    json!({ "instruction": instruction, "input": input, "output": output }).to_string()
}

pub fn sample_records() -> Vec<String> {
    vec![
        record("What is TVL ?", "", "total value locked ."),
        record("Define gas", "", "the fee of a transaction ."),
        record("Summarize", "volume rose by a percent", "volume grew ."),
        record("Explain liquidity pool", "", "a pool of token liquidity for swap ."),
        record("What is market cap ?", "", "price by supply ."),
        record("Define block hash", "", "the hash of a block ."),
    ]
}

/// A complete configuration rooted at `root`, with the model at `model_dir`
pub fn tiny_config(root: &Path, model_dir: &Path) -> FinetuneConfig {
    let mut config = FinetuneConfig::default();

    config.model.base_model = model_dir.display().to_string();
    config.model.max_seq_length = 48;
    config.model.precision = Precision::Full;
    config.model.device = ExecutionTarget::Cpu;

    config.adapter = LoRAConfig {
        gradient_checkpointing: false,
        ..LoRAConfig::with_targets(4, 8.0, &["q_proj", "v_proj", "up_proj"])
    };

    config.training.epochs = 2;
    config.training.per_device_batch_size = 2;
    config.training.gradient_accumulation_steps = 1;
    config.training.learning_rate = 2e-2;
    config.training.logging_steps = 1;
    config.training.save_steps = 100;
    config.training.seed = 7;
    config.training.output_dir = root.join("adapter");

    config.data.train_path = root.join("data").join("train.jsonl");
    config.metrics.path = root.join("outputs").join("metrics.json");
    config.inference.sampling.do_sample = false;
    config.inference.sampling.max_new_tokens = 8;
    config
}

/// Model plus training data under one temp root
pub struct Fixture {
    pub root: tempfile::TempDir,
    pub model_dir: PathBuf,
    pub config: FinetuneConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::TempDir::new().unwrap();
        let model_dir = root.path().join("model");
        write_model(&model_dir, HIDDEN_SIZE);
        let config = tiny_config(root.path(), &model_dir);
        write_jsonl(&config.data.train_path, &sample_records());
        Self {
            root,
            model_dir,
            config,
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }
}
