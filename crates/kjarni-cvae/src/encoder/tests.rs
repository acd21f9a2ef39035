use anyhow::Result;
use approx::assert_abs_diff_eq;
use ndarray::{arr2, s, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;

fn tiny_params() -> TransformerParams {
    TransformerParams::tiny().without_dropout()
}

fn hidden_states(batch: usize, len: usize, hidden: usize) -> Array3<f32> {
    Array3::from_shape_fn((batch, len, hidden), |(b, t, h)| {
        ((b * 5 + t * 11 + h) as f32 * 0.13).cos()
    })
}

#[test]
fn test_prepare_inputs_adds_positions_and_masks() -> Result<()> {
    let ids = arr2(&[[4u32, 7, 0]]);
    let embedded = Array3::<f32>::zeros((1, 3, 8));

    let inputs = prepare_encoder_inputs(&ids, embedded, 0.1, &mut Dropout::disabled())?;

    let positions = position_encoding(3, 8)?;
    assert_eq!(inputs.hidden_states.slice(s![0, .., ..]), positions);
    assert_eq!(inputs.padding, arr2(&[[0.0, 0.0, 1.0]]));
    assert_eq!(inputs.attention_bias.dim(), (1, 1, 1, 3));
    assert_eq!(inputs.attention_bias[[0, 0, 0, 2]], crate::utils::masks::MASK_VALUE);
    Ok(())
}

#[test]
fn test_prepare_inputs_rejects_mismatched_ids() {
    let ids = arr2(&[[4u32, 7]]);
    let embedded = Array3::<f32>::zeros((1, 3, 8));
    assert!(prepare_encoder_inputs(&ids, embedded, 0.0, &mut Dropout::disabled()).is_err());
}

#[test]
fn test_encoder_output_shape_and_normalisation() -> Result<()> {
    let params = tiny_params();
    let mut rng = StdRng::seed_from_u64(11);
    let encoder = EncoderStack::random(&params, &mut rng)?;
    assert_eq!(encoder.num_layers(), params.num_hidden_layers);

    let ids = arr2(&[[3u32, 5, 2, 0], [9, 8, 0, 0]]);
    let x = hidden_states(2, 4, params.hidden_size);
    let out = encoder.forward(
        &x,
        &attention_bias(&ids),
        &padding_mask(&ids),
        &mut Dropout::disabled(),
    )?;

    assert_eq!(out.dim(), (2, 4, params.hidden_size));
    // Final layer norm: every position has zero mean.
    for row in out.rows() {
        assert_abs_diff_eq!(row.mean().unwrap_or(1.0), 0.0, epsilon = 1e-4);
    }
    Ok(())
}

#[test]
fn test_padding_does_not_leak_into_real_positions() -> Result<()> {
    let params = tiny_params();
    let mut rng = StdRng::seed_from_u64(12);
    let encoder = EncoderStack::random(&params, &mut rng)?;

    let ids = arr2(&[[3u32, 5, 0]]);
    let x = hidden_states(1, 3, params.hidden_size);
    let mut altered = x.clone();
    altered.slice_mut(s![0, 2, ..]).fill(50.0);

    let bias = attention_bias(&ids);
    let padding = padding_mask(&ids);
    let a = encoder.forward(&x, &bias, &padding, &mut Dropout::disabled())?;
    let b = encoder.forward(&altered, &bias, &padding, &mut Dropout::disabled())?;

    for t in 0..2 {
        for (x, y) in a.slice(s![0, t, ..]).iter().zip(b.slice(s![0, t, ..]).iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-4);
        }
    }
    Ok(())
}

#[test]
fn test_encoder_is_deterministic_without_dropout() -> Result<()> {
    let params = TransformerParams::tiny();
    let mut rng = StdRng::seed_from_u64(13);
    let encoder = EncoderStack::random(&params, &mut rng)?;

    let ids = arr2(&[[3u32, 5, 2]]);
    let x = hidden_states(1, 3, params.hidden_size);
    let bias = attention_bias(&ids);
    let padding = padding_mask(&ids);

    let a = encoder.forward(&x, &bias, &padding, &mut Dropout::disabled())?;
    let b = encoder.forward(&x, &bias, &padding, &mut Dropout::disabled())?;
    assert_eq!(a, b);

    let c = encoder.forward(&x, &bias, &padding, &mut Dropout::training(StdRng::seed_from_u64(1)))?;
    assert_ne!(a, c);
    Ok(())
}

#[test]
fn test_empty_stack_is_rejected() {
    assert!(EncoderStack::new(Vec::new(), LayerNorm::identity(8)).is_err());
}
