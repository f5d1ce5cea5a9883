// Batching - windows, packing and collation into tensors

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::models::transformer::SequenceLayout;

/// One row of a batch before padding
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub ids: Vec<u32>,
    /// Position of each token inside its own example
    pub positions: Vec<u32>,
    /// 1-based example index within the window
    pub segments: Vec<u32>,
}

impl Window {
    fn empty() -> Self {
        Self {
            ids: Vec::new(),
            positions: Vec::new(),
            segments: Vec::new(),
        }
    }

    fn push_example(&mut self, ids: &[u32]) {
        let segment = self.segments.last().copied().unwrap_or(0) + 1;
        self.ids.extend_from_slice(ids);
        self.positions.extend(0..ids.len() as u32);
        self.segments.extend(std::iter::repeat(segment).take(ids.len()));
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn examples(&self) -> usize {
        self.segments.last().copied().unwrap_or(0) as usize
    }

    /// Positions whose next token belongs to the same example
    pub fn loss_tokens(&self) -> usize {
        self.segments
            .windows(2)
            .filter(|pair| pair[0] != 0 && pair[0] == pair[1])
            .count()
    }
}

/// One example per window, truncated to `max_len`
pub fn single_windows(order: &[usize], examples: &[Vec<u32>], max_len: usize) -> Vec<Window> {
    order
        .iter()
        .map(|&idx| {
            let ids = &examples[idx];
            let mut window = Window::empty();
            window.push_example(&ids[..ids.len().min(max_len)]);
            window
        })
        .collect()
}

/// Greedily concatenate whole examples into windows of at most `max_len`
/// tokens. An example never spans two windows.
pub fn pack_windows(order: &[usize], examples: &[Vec<u32>], max_len: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut current = Window::empty();

    for &idx in order {
        let ids = &examples[idx];
        let ids = &ids[..ids.len().min(max_len)];
        if !current.is_empty() && current.len() + ids.len() > max_len {
            windows.push(std::mem::replace(&mut current, Window::empty()));
        }
        current.push_example(ids);
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

/// Windows for one epoch: example order shuffled with `seed + epoch`, then
/// packed or kept one-per-window. Windows with nothing to score are dropped.
pub fn plan_epoch(
    examples: &[Vec<u32>],
    max_len: usize,
    packing: bool,
    seed: u64,
    epoch: usize,
) -> Vec<Window> {
    let mut order: Vec<usize> = (0..examples.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    order.shuffle(&mut rng);

    let windows = if packing {
        pack_windows(&order, examples, max_len)
    } else {
        single_windows(&order, examples, max_len)
    };
    windows.into_iter().filter(|w| w.loss_tokens() > 0).collect()
}

/// Padded tensors for one micro-batch
pub struct Batch {
    /// (b, t) u32
    pub input_ids: Tensor,
    /// (b, t) u32, next token of each position
    pub targets: Tensor,
    /// (b, t) f32, 1 where the target is scored
    pub loss_mask: Tensor,
    pub layout: SequenceLayout,
    pub examples: usize,
    pub loss_tokens: usize,
}

/// Right-pad windows to the longest one. Padding is segment 0.
pub fn collate(windows: &[Window], pad_id: u32, device: &Device) -> Result<Batch> {
    let batch = windows.len();
    let seq_len = windows.iter().map(Window::len).max().unwrap_or(0);
    anyhow::ensure!(batch > 0 && seq_len > 0, "cannot collate an empty batch");

    let total = batch * seq_len;
    let mut ids = vec![pad_id; total];
    let mut targets = vec![pad_id; total];
    let mut mask = vec![0f32; total];
    let mut positions = vec![0u32; total];
    let mut segments = vec![0u32; total];

    for (row, window) in windows.iter().enumerate() {
        let base = row * seq_len;
        for i in 0..window.len() {
            ids[base + i] = window.ids[i];
            positions[base + i] = window.positions[i];
            segments[base + i] = window.segments[i];
            if i + 1 < window.len() {
                targets[base + i] = window.ids[i + 1];
                if window.segments[i + 1] == window.segments[i] {
                    mask[base + i] = 1.0;
                }
            }
        }
    }

    Ok(Batch {
        input_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
        targets: Tensor::from_vec(targets, (batch, seq_len), device)?,
        loss_mask: Tensor::from_vec(mask, (batch, seq_len), device)?,
        layout: SequenceLayout::new(batch, seq_len, positions, segments)?,
        examples: windows.iter().map(Window::examples).sum(),
        loss_tokens: windows.iter().map(Window::loss_tokens).sum(),
    })
}

/// Sum of masked next-token negative log-likelihoods (scalar)
pub fn masked_nll_sum(logits: &Tensor, targets: &Tensor, loss_mask: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    Ok((picked * loss_mask)?.sum_all()?.neg()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn examples() -> Vec<Vec<u32>> {
        vec![vec![1, 2, 3], vec![4, 5], vec![6, 7, 8, 9], vec![10]]
    }

    #[test]
    fn test_packing_keeps_examples_whole() {
        let windows = pack_windows(&[0, 1, 2, 3], &examples(), 6);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(windows[0].positions, vec![0, 1, 2, 0, 1]);
        assert_eq!(windows[0].segments, vec![1, 1, 1, 2, 2]);
        assert_eq!(windows[1].ids, vec![6, 7, 8, 9, 10]);
        assert_eq!(windows[1].examples(), 2);
    }

    #[test]
    fn test_loss_tokens_skip_boundaries() {
        let windows = pack_windows(&[0, 1], &examples(), 8);
        // 2 scored in the first example, 1 in the second, none across the seam
        assert_eq!(windows[0].loss_tokens(), 3);
    }

    #[test]
    fn test_long_examples_are_truncated() {
        let windows = single_windows(&[2], &examples(), 3);
        assert_eq!(windows[0].ids, vec![6, 7, 8]);
    }

    #[test]
    fn test_plan_is_seeded() {
        let data: Vec<Vec<u32>> = (0..20).map(|i| vec![i, i + 1, i + 2]).collect();
        let a = plan_epoch(&data, 16, false, 42, 0);
        let b = plan_epoch(&data, 16, false, 42, 0);
        let c = plan_epoch(&data, 16, false, 42, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn test_single_token_examples_are_dropped() {
        let plan = plan_epoch(&examples(), 16, false, 0, 0);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_collate_masks_padding_and_seams() {
        let windows = pack_windows(&[0, 1], &examples(), 8);
        let single = single_windows(&[3], &examples(), 8);
        let batch = collate(&[windows[0].clone(), single[0].clone()], 0, &Device::Cpu).unwrap();

        let mask = batch.loss_mask.to_vec2::<f32>().unwrap();
        assert_eq!(mask[0], vec![1.0, 1.0, 0.0, 1.0, 0.0]);
        assert_eq!(mask[1], vec![0.0; 5]);
        let targets = batch.targets.to_vec2::<u32>().unwrap();
        assert_eq!(&targets[0][..4], &[2, 3, 4, 5]);
        assert_eq!(batch.layout.segments()[5..], [1, 0, 0, 0, 0]);
        assert_eq!(batch.loss_tokens, 3);
        assert_eq!(batch.examples, 3);
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &Device::Cpu).unwrap();
        let nll = masked_nll_sum(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((nll - 2.0 * 4f32.ln()).abs() < 1e-5);
    }
}
