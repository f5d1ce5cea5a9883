// End-to-end training tests against a tiny synthetic model

mod common;

use std::fs;

use common::{record, write_jsonl, Fixture};
use instruct_lora::errors::{FinetuneError, Stage, TrainingFailure};
use instruct_lora::metrics::{MetricsRecorder, EVAL_LOSS, EVAL_SAMPLES};
use instruct_lora::models::{AdapterArtifact, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
use instruct_lora::pipeline::{latest_resume_point, run_training};

#[test]
fn test_training_reduces_loss_and_persists_everything() {
    let fixture = Fixture::new();
    let config = &fixture.config;

    let result = run_training(config).unwrap();

    let initial = result.initial_metrics.loss().unwrap();
    let final_loss = result.final_metrics.loss().unwrap();
    assert_eq!(result.loss_reduction, initial - final_loss);
    assert!(
        final_loss < initial,
        "loss did not go down: {} -> {}",
        initial,
        final_loss
    );
    assert_eq!(result.final_metrics.get(EVAL_SAMPLES), Some(6.0));
    assert_eq!(result.training.global_steps, 6);
    assert_eq!(result.training.epochs_completed, 2);

    // Metrics file round-trips
    let saved = MetricsRecorder::load(&config.metrics.path).unwrap();
    assert_eq!(saved, result);

    // Artifact is complete and loadable
    let adapter_dir = &config.training.output_dir;
    assert!(adapter_dir.join(ADAPTER_WEIGHTS_FILE).is_file());
    assert!(adapter_dir.join(ADAPTER_CONFIG_FILE).is_file());
    let artifact = AdapterArtifact::load(adapter_dir).unwrap();
    assert_eq!(artifact.manifest().run_id, result.run_id);
    // q_proj, v_proj and up_proj in two layers, A and B each
    assert_eq!(artifact.tensors().len(), 12);
}

#[test]
fn test_identical_runs_are_reproducible() {
    let fixture = Fixture::new();

    let mut first = fixture.config.clone();
    first.training.epochs = 1;
    first.training.output_dir = fixture.path().join("run-a");
    first.metrics.path = fixture.path().join("run-a.json");

    let mut second = first.clone();
    second.training.output_dir = fixture.path().join("run-b");
    second.metrics.path = fixture.path().join("run-b.json");

    let a = run_training(&first).unwrap();
    let b = run_training(&second).unwrap();

    let (la, lb) = (
        a.final_metrics.get(EVAL_LOSS).unwrap(),
        b.final_metrics.get(EVAL_LOSS).unwrap(),
    );
    assert!((la - lb).abs() < 1e-6, "{} vs {}", la, lb);
    assert_eq!(a.initial_metrics.loss(), b.initial_metrics.loss());
}

#[test]
fn test_packed_single_epoch_run() {
    let fixture = Fixture::new();
    let mut config = fixture.config.clone();
    config.training.epochs = 1;
    config.training.packing = true;

    let result = run_training(&config).unwrap();
    // Six short examples fit in one 48-token window
    assert!(result.training.global_steps >= 1);
    assert!(result.training.global_steps < 3);
    assert_eq!(result.training.examples_trained, 6);
}

#[test]
fn test_resume_matches_uninterrupted_run() {
    let fixture = Fixture::new();

    let mut full = fixture.config.clone();
    full.training.save_steps = 2;
    full.training.output_dir = fixture.path().join("full");
    full.metrics.path = fixture.path().join("full.json");
    let uninterrupted = run_training(&full).unwrap();

    let checkpoint = full.training.output_dir.join("checkpoint-4");
    assert!(checkpoint.join("trainer_state.json").is_file());
    assert_eq!(latest_resume_point(&full).unwrap(), checkpoint);
    assert!(full.training.output_dir.join("checkpoint-2").is_dir());
    // The final step is covered by the artifact, not a checkpoint
    assert!(!full.training.output_dir.join("checkpoint-6").exists());

    let mut resumed = full.clone();
    resumed.training.output_dir = fixture.path().join("resumed");
    resumed.metrics.path = fixture.path().join("resumed.json");
    resumed.training.resume_from = Some(checkpoint);
    let continued = run_training(&resumed).unwrap();

    assert_eq!(continued.training.global_steps, 6);
    let (a, b) = (
        uninterrupted.final_metrics.loss().unwrap(),
        continued.final_metrics.loss().unwrap(),
    );
    assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
    assert_eq!(continued.run_id, uninterrupted.run_id);
}

#[test]
fn test_resume_from_mismatched_checkpoint_fails() {
    let fixture = Fixture::new();

    let mut first = fixture.config.clone();
    first.training.save_steps = 2;
    run_training(&first).unwrap();

    let mut second = fixture.config.clone();
    second.training.output_dir = fixture.path().join("other");
    second.training.per_device_batch_size = 3;
    second.training.resume_from = Some(first.training.output_dir.join("checkpoint-4"));

    let err = run_training(&second).unwrap_err();
    assert!(matches!(
        err,
        FinetuneError::Training {
            source: TrainingFailure::Resume { .. },
            ..
        }
    ));
}

#[test]
fn test_empty_dataset_fails_before_model_load() {
    let fixture = Fixture::new();
    let mut config = fixture.config.clone();
    config.model.base_model = fixture.path().join("no-such-model").display().to_string();
    write_jsonl(&config.data.train_path, &[]);

    let err = run_training(&config).unwrap_err();
    assert!(matches!(err, FinetuneError::DataFormat { line: None, .. }));
    assert_eq!(err.stage(), Stage::Formatting);
}

#[test]
fn test_missing_output_field_is_a_format_error() {
    let fixture = Fixture::new();
    let mut config = fixture.config.clone();
    write_jsonl(
        &config.data.train_path,
        &[
            record("What is TVL ?", "", "total value locked ."),
            r#"{"instruction": "Define gas", "input": ""}"#.to_string(),
        ],
    );
    config.model.base_model = fixture.path().join("no-such-model").display().to_string();

    let err = run_training(&config).unwrap_err();
    match err {
        FinetuneError::DataFormat { line, .. } => assert_eq!(line, Some(2)),
        other => panic!("expected DataFormat, got {:?}", other),
    }
}

#[test]
fn test_unknown_target_module_is_rejected() {
    let fixture = Fixture::new();
    let mut config = fixture.config.clone();
    config.adapter.target_modules = vec!["q_proj".into(), "c_attn".into()];

    let err = run_training(&config).unwrap_err();
    assert!(matches!(err, FinetuneError::AdapterTarget(_)), "{:?}", err);
    assert!(!config.training.output_dir.exists());
}

#[test]
fn test_unwritable_metrics_path_still_returns_result() {
    let fixture = Fixture::new();
    let mut config = fixture.config.clone();
    config.training.epochs = 1;
    let blocker = fixture.path().join("blocker");
    fs::write(&blocker, b"a file, not a directory").unwrap();
    config.metrics.path = blocker.join("metrics.json");

    let result = run_training(&config).unwrap();
    assert_eq!(
        result.loss_reduction,
        result.initial_metrics.loss().unwrap() - result.final_metrics.loss().unwrap()
    );
    assert!(!config.metrics.path.exists());
}

#[test]
fn test_concurrent_runs_share_no_output_directory() {
    use instruct_lora::models::ModelPreparer;
    use instruct_lora::training::{InstructionDataset, Trainer};

    let fixture = Fixture::new();
    let config = &fixture.config;
    let data = InstructionDataset::open(&config.data.train_path, config.model.template).unwrap();
    let prepare = || {
        ModelPreparer::new(config.model.clone())
            .prepare(&config.adapter)
            .unwrap()
    };

    let _first = Trainer::new(prepare(), config.training.clone(), data.clone(), data.clone()).unwrap();
    let err = match Trainer::new(prepare(), config.training.clone(), data.clone(), data) {
        Ok(_) => panic!("second trainer acquired a locked output directory"),
        Err(e) => e,
    };
    assert!(matches!(err, FinetuneError::Config(_)));
}

#[test]
fn test_resume_latest_without_checkpoints_is_a_config_error() {
    let fixture = Fixture::new();
    let err = latest_resume_point(&fixture.config).unwrap_err();
    assert!(matches!(err, FinetuneError::Config(_)), "{:?}", err);
}
