// Training Orchestrator - epochs, gradient accumulation, checkpoints and
// the final adapter artifact

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use fs2::FileExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

use super::batching::{collate, masked_nll_sum, plan_epoch, single_windows, Batch, Window};
use super::checkpoint::{checkpoint_dir, load_checkpoint, save_checkpoint, TrainerState};
use super::dataset::InstructionDataset;
use super::optimizer::{accumulate, clip_grad_norm, learning_rate_at, TrainerOptimizer};
use crate::config::TrainingConfiguration;
use crate::errors::{FinetuneError, FinetuneResult, TrainingFailure};
use crate::metrics::{
    EvaluationMetrics, TrainingSession, TrainingStats, EVAL_LOSS, EVAL_PERPLEXITY, EVAL_RUNTIME,
    EVAL_SAMPLES, EVAL_TOKENS,
};
use crate::models::{AdapterArtifact, ModelHandle};

const LOCK_FILE: &str = ".train.lock";

fn compute_failure(e: anyhow::Error) -> FinetuneError {
    FinetuneError::training(TrainingFailure::from_compute(&e))
}

/// Where in the fixed data order training stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    epoch: usize,
    micro_batches_done: usize,
}

/// The per-epoch micro-batch plan, fixed before the first step
struct EpochPlan {
    windows: Vec<Window>,
    micro_batches: usize,
}

impl EpochPlan {
    fn optimizer_steps(&self, accumulation: usize) -> usize {
        self.micro_batches.div_ceil(accumulation)
    }

    fn micro_batch(&self, index: usize, batch_size: usize) -> &[Window] {
        let start = index * batch_size;
        let end = (start + batch_size).min(self.windows.len());
        &self.windows[start..end]
    }
}

/// Running mean of micro-batch losses between two log lines
#[derive(Default)]
struct LossWindow {
    sum: f64,
    count: usize,
    last_mean: Option<f64>,
}

impl LossWindow {
    fn push(&mut self, loss: f64) {
        self.sum += loss;
        self.count += 1;
    }

    fn flush(&mut self) -> Option<f64> {
        if self.count > 0 {
            self.last_mean = Some(self.sum / self.count as f64);
            self.sum = 0.0;
            self.count = 0;
        }
        self.last_mean
    }
}

/// Fine-tunes the adapter of one model handle.
///
/// Holds an exclusive lock on `output_dir` for its whole lifetime.
pub struct Trainer {
    handle: ModelHandle,
    config: TrainingConfiguration,
    train_data: InstructionDataset,
    eval_data: InstructionDataset,
    run_id: String,
    _lock: File,
}

impl Trainer {
    pub fn new(
        handle: ModelHandle,
        config: TrainingConfiguration,
        train_data: InstructionDataset,
        eval_data: InstructionDataset,
    ) -> FinetuneResult<Self> {
        config.validate()?;

        let output_dir = config.output_dir.clone();
        fs::create_dir_all(&output_dir).map_err(|e| FinetuneError::ArtifactPersist {
            path: output_dir.clone(),
            reason: format!("cannot create output directory: {}", e),
        })?;

        let lock_path = output_dir.join(LOCK_FILE);
        let lock = File::create(&lock_path).map_err(|e| FinetuneError::ArtifactPersist {
            path: lock_path.clone(),
            reason: e.to_string(),
        })?;
        lock.try_lock_exclusive().map_err(|_| {
            FinetuneError::Config(format!(
                "output directory {} is in use by another training run",
                output_dir.display()
            ))
        })?;

        Ok(Self {
            handle,
            config,
            train_data,
            eval_data,
            run_id: Uuid::new_v4().to_string(),
            _lock: lock,
        })
    }

    /// Tokenize every record of a dataset in file order
    fn encode(&self, dataset: &InstructionDataset) -> FinetuneResult<Vec<Vec<u32>>> {
        let max_len = self.handle.max_seq_length();
        let mut truncated = 0;
        let mut encoded = Vec::with_capacity(dataset.len());

        for formatted in dataset.iter()? {
            let formatted = formatted?;
            let ids = self
                .handle
                .encode(&formatted.formatted_text)
                .map_err(|e| FinetuneError::DataFormat {
                    path: dataset.path().to_path_buf(),
                    line: None,
                    reason: format!("{:#}", e),
                })?;
            if ids.len() > max_len {
                truncated += 1;
            }
            encoded.push(ids);
        }

        if truncated > 0 {
            tracing::warn!(
                "{} of {} examples in {} exceed {} tokens and will be truncated",
                truncated,
                encoded.len(),
                dataset.path().display(),
                max_len
            );
        }
        Ok(encoded)
    }

    fn collate(&self, windows: &[Window]) -> Result<Batch> {
        collate(windows, self.handle.pad_token_id(), self.handle.device())
    }

    /// Summed masked NLL of one batch
    fn nll_sum(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let logits = self
            .handle
            .model()
            .forward(&batch.input_ids, &batch.layout, train)?;
        masked_nll_sum(&logits, &batch.targets, &batch.loss_mask)
    }

    fn progress_bar(&self, total: usize, done: usize) -> ProgressBar {
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_position(done as u64);
        pb
    }

    fn checkpoint(&self, optimizer: &TrainerOptimizer, state: &TrainerState) -> FinetuneResult<PathBuf> {
        let target = checkpoint_dir(&self.config.output_dir, state.global_step);
        let adapter = self
            .handle
            .adapter_tensors()
            .map_err(|e| checkpoint_failure(&target, &e))?;
        save_checkpoint(
            &self.config.output_dir,
            state,
            &adapter,
            &optimizer.state_tensors(),
        )
        .map_err(|e| checkpoint_failure(&target, &e))
    }

    /// Restore adapter, optimizer and position from a checkpoint
    fn resume(
        &mut self,
        path: &Path,
        optimizer: &mut TrainerOptimizer,
        plans: &[EpochPlan],
    ) -> FinetuneResult<(Cursor, usize)> {
        let fail = |reason: String| {
            FinetuneError::training(TrainingFailure::Resume {
                path: path.to_path_buf(),
                reason,
            })
        };

        let checkpoint = load_checkpoint(path).map_err(|e| fail(format!("{:#}", e)))?;
        let state = &checkpoint.state;
        let cursor = Cursor {
            epoch: state.epoch,
            micro_batches_done: state.micro_batches_done,
        };

        let in_range = (cursor.epoch < plans.len()
            && cursor.micro_batches_done <= plans[cursor.epoch].micro_batches)
            || (cursor.epoch == plans.len() && cursor.micro_batches_done == 0);
        let accumulation = self.config.gradient_accumulation_steps;
        if !in_range || steps_before(plans, cursor, accumulation) != state.global_step {
            return Err(fail(format!(
                "step {} (epoch {}, micro-batch {}) does not fit the current data and batch settings",
                state.global_step, state.epoch, state.micro_batches_done
            )));
        }

        self.handle
            .load_adapter_tensors(&checkpoint.adapter)
            .map_err(|e| fail(format!("{:#}", e)))?;
        optimizer
            .load_state(&checkpoint.optimizer, state.global_step)
            .map_err(|e| fail(format!("{:#}", e)))?;
        self.run_id = state.run_id.clone();

        tracing::info!(
            "Resumed from {} at step {} (epoch {}, micro-batch {})",
            path.display(),
            state.global_step,
            state.epoch + 1,
            state.micro_batches_done
        );
        Ok((cursor, state.global_step))
    }

    /// Forward and backward one micro-batch; returns its mean token loss and
    /// the gradients of `loss * scale`
    fn micro_step(&self, batch: &Batch, scale: f64, global_step: usize) -> FinetuneResult<(f64, GradStore)> {
        let tokens = batch.loss_tokens.max(1) as f64;
        let loss = self
            .nll_sum(batch, true)
            .and_then(|sum| Ok((sum / tokens)?))
            .map_err(compute_failure)?;
        let value = loss
            .to_scalar::<f32>()
            .map_err(|e| compute_failure(e.into()))? as f64;
        if !value.is_finite() {
            return Err(FinetuneError::training(TrainingFailure::Diverged {
                step: global_step,
                loss: value,
            }));
        }
        let grads = (loss * scale)
            .and_then(|scaled| scaled.backward())
            .map_err(|e| compute_failure(e.into()))?;
        Ok((value, grads))
    }

    fn optimizer_step(
        &self,
        optimizer: &mut TrainerOptimizer,
        grads: &mut GradStore,
        vars: &[(String, Var)],
        step: usize,
        total_steps: usize,
    ) -> FinetuneResult<(f64, f64)> {
        let lr = learning_rate_at(&self.config, step, total_steps);
        optimizer.set_learning_rate(lr);
        let grad_norm =
            clip_grad_norm(grads, vars, self.config.max_grad_norm).map_err(compute_failure)?;
        if !grad_norm.is_finite() {
            return Err(FinetuneError::training(TrainingFailure::Diverged {
                step: step + 1,
                loss: grad_norm,
            }));
        }
        optimizer.step(grads).map_err(compute_failure)?;
        Ok((lr, grad_norm))
    }

    fn run_training(&mut self) -> FinetuneResult<TrainingStats> {
        let started = Instant::now();
        let config = self.config.clone();
        let batch_size = config.per_device_batch_size;
        let accumulation = config.gradient_accumulation_steps;

        let examples = self.encode(&self.train_data)?;
        let plans: Vec<EpochPlan> = (0..config.epochs)
            .map(|epoch| {
                let windows = plan_epoch(
                    &examples,
                    self.handle.max_seq_length(),
                    config.packing,
                    config.seed,
                    epoch,
                );
                let micro_batches = windows.len().div_ceil(batch_size);
                EpochPlan {
                    windows,
                    micro_batches,
                }
            })
            .collect();

        let total_steps: usize = plans.iter().map(|p| p.optimizer_steps(accumulation)).sum();
        if total_steps == 0 {
            return Err(FinetuneError::DataFormat {
                path: self.train_data.path().to_path_buf(),
                line: None,
                reason: "no example is long enough to learn from".to_string(),
            });
        }

        let vars = self.handle.trainable_vars().map_err(compute_failure)?;
        let mut optimizer = TrainerOptimizer::new(&config, vars.clone()).map_err(compute_failure)?;

        let (mut cursor, mut global_step) = match config.resume_from.clone() {
            Some(path) => self.resume(&path, &mut optimizer, &plans)?,
            None => (
                Cursor {
                    epoch: 0,
                    micro_batches_done: 0,
                },
                0,
            ),
        };

        tracing::info!(
            "Training {} examples for {} epoch(s): {} optimizer steps, effective batch size {}{}",
            examples.len(),
            config.epochs,
            total_steps,
            config.effective_batch_size(1),
            if config.packing { ", packed" } else { "" }
        );

        let pb = self.progress_bar(total_steps, global_step);
        let mut losses = LossWindow::default();
        let mut examples_trained = 0;

        while cursor.epoch < plans.len() {
            let plan = &plans[cursor.epoch];
            tracing::debug!(
                "Epoch {}/{}: {} windows, {} micro-batches",
                cursor.epoch + 1,
                config.epochs,
                plan.windows.len(),
                plan.micro_batches
            );

            while cursor.micro_batches_done < plan.micro_batches {
                let group_start = cursor.micro_batches_done;
                let group_end = (group_start + accumulation).min(plan.micro_batches);
                let scale = 1.0 / (group_end - group_start) as f64;

                let mut grads: Option<GradStore> = None;
                for index in group_start..group_end {
                    let batch = self
                        .collate(plan.micro_batch(index, batch_size))
                        .map_err(compute_failure)?;
                    let (loss, micro_grads) = self.micro_step(&batch, scale, global_step + 1)?;
                    accumulate(&mut grads, micro_grads, &vars).map_err(compute_failure)?;
                    losses.push(loss);
                    examples_trained += batch.examples;
                }

                let Some(mut grads) = grads else {
                    break;
                };
                let (lr, grad_norm) =
                    self.optimizer_step(&mut optimizer, &mut grads, &vars, global_step, total_steps)?;
                global_step += 1;
                cursor.micro_batches_done = group_end;
                pb.inc(1);

                if global_step % config.logging_steps == 0 {
                    if let Some(loss) = losses.flush() {
                        pb.set_message(format!("loss {:.4}", loss));
                        tracing::info!(
                            "step {}/{} epoch {:.2} loss {:.4} lr {:.3e} grad_norm {:.3}",
                            global_step,
                            total_steps,
                            cursor.epoch as f64 + group_end as f64 / plan.micro_batches as f64,
                            loss,
                            lr,
                            grad_norm
                        );
                    }
                }

                if global_step % config.save_steps == 0 && global_step < total_steps {
                    let position = normalize(cursor, &plans);
                    let state = TrainerState {
                        global_step,
                        epoch: position.epoch,
                        micro_batches_done: position.micro_batches_done,
                        run_id: self.run_id.clone(),
                        last_loss: losses.last_mean,
                    };
                    let path = self.checkpoint(&optimizer, &state)?;
                    tracing::info!("Saved checkpoint {}", path.display());
                }
            }

            cursor = Cursor {
                epoch: cursor.epoch + 1,
                micro_batches_done: 0,
            };
        }
        pb.finish_and_clear();

        let final_train_loss = losses.flush();
        AdapterArtifact::save(&config.output_dir, &self.handle, &self.run_id)?;

        let duration_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            "Training complete in {:.1}s. Final loss: {}",
            duration_secs,
            final_train_loss
                .map(|l| format!("{:.4}", l))
                .unwrap_or_else(|| "n/a".to_string())
        );

        Ok(TrainingStats {
            global_steps: global_step,
            epochs_completed: config.epochs,
            examples_trained,
            final_train_loss,
            duration_secs,
            artifact_dir: Some(config.output_dir.clone()),
            run_id: Some(self.run_id.clone()),
        })
    }

    /// Token-weighted mean loss over the evaluation set, one example per
    /// window in file order
    fn run_evaluation(&mut self) -> FinetuneResult<EvaluationMetrics> {
        let started = Instant::now();
        let fail = |e: anyhow::Error| FinetuneError::evaluating(TrainingFailure::from_compute(&e));

        let examples = self.encode(&self.eval_data)?;
        let windows = scorable_windows(&examples, self.handle.max_seq_length());

        let mut nll = 0f64;
        let mut tokens = 0usize;
        for chunk in windows.chunks(self.config.per_device_batch_size) {
            let batch = self.collate(chunk).map_err(fail)?;
            let sum = self
                .nll_sum(&batch, false)
                .and_then(|t| Ok(t.to_scalar::<f32>()?))
                .map_err(fail)?;
            nll += sum as f64;
            tokens += batch.loss_tokens;
        }

        if tokens == 0 {
            return Err(FinetuneError::evaluating(TrainingFailure::Compute(format!(
                "{} has no tokens to score",
                self.eval_data.path().display()
            ))));
        }

        let loss = nll / tokens as f64;
        if !loss.is_finite() {
            return Err(FinetuneError::evaluating(TrainingFailure::Diverged {
                step: 0,
                loss,
            }));
        }

        let mut metrics = EvaluationMetrics::new();
        metrics.insert(EVAL_LOSS, loss);
        metrics.insert(EVAL_PERPLEXITY, loss.exp());
        metrics.insert(EVAL_SAMPLES, windows.len() as f64);
        metrics.insert(EVAL_TOKENS, tokens as f64);
        metrics.insert(EVAL_RUNTIME, started.elapsed().as_secs_f64());
        Ok(metrics)
    }
}

impl TrainingSession for Trainer {
    fn evaluate(&mut self) -> FinetuneResult<EvaluationMetrics> {
        self.run_evaluation()
    }

    fn train(&mut self) -> FinetuneResult<TrainingStats> {
        self.run_training()
    }
}

/// Evaluation windows in file order, skipping examples too short to score
fn scorable_windows(examples: &[Vec<u32>], max_len: usize) -> Vec<Window> {
    let order: Vec<usize> = (0..examples.len()).collect();
    single_windows(&order, examples, max_len)
        .into_iter()
        .filter(|w| w.loss_tokens() > 0)
        .collect()
}

fn checkpoint_failure(path: &Path, e: &anyhow::Error) -> FinetuneError {
    FinetuneError::training(TrainingFailure::Checkpoint {
        path: path.to_path_buf(),
        reason: format!("{:#}", e),
    })
}

/// A cursor at the end of an epoch points at the start of the next one
fn normalize(cursor: Cursor, plans: &[EpochPlan]) -> Cursor {
    if cursor.micro_batches_done >= plans[cursor.epoch].micro_batches {
        Cursor {
            epoch: cursor.epoch + 1,
            micro_batches_done: 0,
        }
    } else {
        cursor
    }
}

/// Optimizer steps taken before reaching `cursor`
fn steps_before(plans: &[EpochPlan], cursor: Cursor, accumulation: usize) -> usize {
    let full: usize = plans[..cursor.epoch.min(plans.len())]
        .iter()
        .map(|p| p.optimizer_steps(accumulation))
        .sum();
    full + cursor.micro_batches_done.div_ceil(accumulation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(windows: usize, batch_size: usize) -> EpochPlan {
        let window = Window {
            ids: vec![1, 2],
            positions: vec![0, 1],
            segments: vec![1, 1],
        };
        EpochPlan {
            windows: vec![window; windows],
            micro_batches: windows.div_ceil(batch_size),
        }
    }

    #[test]
    fn test_remainder_gets_its_own_step() {
        // 5 micro-batches with accumulation 2 -> 3 optimizer steps
        let p = plan(10, 2);
        assert_eq!(p.micro_batches, 5);
        assert_eq!(p.optimizer_steps(2), 3);
        assert_eq!(p.micro_batch(4, 2).len(), 2);
        assert_eq!(plan(9, 2).micro_batch(4, 2).len(), 1);
    }

    #[test]
    fn test_single_token_examples_are_not_scored() {
        let examples = vec![vec![5, 6, 7], vec![9], vec![3, 4]];
        let windows = scorable_windows(&examples, 16);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].ids, vec![5, 6, 7]);
        assert_eq!(windows[1].ids, vec![3, 4]);
    }

    #[test]
    fn test_steps_before_cursor() {
        let plans = vec![plan(10, 2), plan(10, 2)];
        let at = |epoch, micro_batches_done| Cursor {
            epoch,
            micro_batches_done,
        };
        assert_eq!(steps_before(&plans, at(0, 0), 2), 0);
        assert_eq!(steps_before(&plans, at(0, 4), 2), 2);
        assert_eq!(steps_before(&plans, at(1, 0), 2), 3);
        assert_eq!(steps_before(&plans, at(1, 2), 2), 4);
        assert_eq!(steps_before(&plans, at(2, 0), 2), 6);
    }

    #[test]
    fn test_normalize_rolls_over_epoch_end() {
        let plans = vec![plan(4, 2), plan(4, 2)];
        let end = Cursor {
            epoch: 0,
            micro_batches_done: 2,
        };
        assert_eq!(
            normalize(end, &plans),
            Cursor {
                epoch: 1,
                micro_batches_done: 0
            }
        );
    }

    #[test]
    fn test_loss_window_keeps_last_mean() {
        let mut window = LossWindow::default();
        assert_eq!(window.flush(), None);
        window.push(1.0);
        window.push(3.0);
        assert_eq!(window.flush(), Some(2.0));
        assert_eq!(window.flush(), Some(2.0));
    }
}
