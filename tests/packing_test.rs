// Packed windows must score every example as if it were alone

mod common;

use candle_core::IndexOp;

use common::Fixture;
use instruct_lora::models::ModelPreparer;
use instruct_lora::training::batching::{
    collate, masked_nll_sum, pack_windows, single_windows, Window,
};

#[test]
fn test_no_loss_across_pack_boundary() {
    let fixture = Fixture::new();
    let config = &fixture.config;
    let handle = ModelPreparer::new(config.model.clone())
        .prepare(&config.adapter)
        .unwrap();
    let device = handle.device().clone();

    // Example A is all token X, example B all token Y
    let (x, y) = (10u32, 20u32);
    let examples = vec![vec![x; 5], vec![y; 4]];

    let packed = pack_windows(&[0, 1], &examples, 16);
    assert_eq!(packed.len(), 1);
    let batch = collate(&packed, 0, &device).unwrap();

    // The last X position would predict the first Y: it must not be scored
    let mask = batch.loss_mask.to_vec2::<f32>().unwrap();
    assert_eq!(mask[0], vec![1., 1., 1., 1., 0., 1., 1., 1., 0.]);
    assert_eq!(batch.loss_tokens, 4 + 3);

    // B's per-position logits do not depend on A
    let packed_logits = handle
        .model()
        .forward(&batch.input_ids, &batch.layout, false)
        .unwrap();
    let alone = collate(&single_windows(&[1], &examples, 16), 0, &device).unwrap();
    let alone_logits = handle
        .model()
        .forward(&alone.input_ids, &alone.layout, false)
        .unwrap();
    let diff = (packed_logits.i((0, 5..9)).unwrap() - alone_logits.i((0, 0..4)).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff < 1e-4, "packed logits differ by {}", diff);

    // So the packed loss is exactly the sum of the standalone losses
    let total = |windows: &[Window]| -> f32 {
        let b = collate(windows, 0, &device).unwrap();
        let logits = handle.model().forward(&b.input_ids, &b.layout, false).unwrap();
        masked_nll_sum(&logits, &b.targets, &b.loss_mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    };
    let separate =
        total(&single_windows(&[0], &examples, 16)) + total(&single_windows(&[1], &examples, 16));
    let together = total(&packed);
    assert!((separate - together).abs() < 1e-3, "{} vs {}", separate, together);
}
