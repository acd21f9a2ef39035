//! Padding masks, additive attention biases and position encodings.
//!
//! Biases are 4D so they broadcast against `[batch, heads, q_len, k_len]`
//! attention scores:
//! - padding bias: `[batch, 1, 1, k_len]`
//! - causal bias: `[1, 1, len, len]`

use anyhow::Result;
use ndarray::{s, Array1, Array2, Array4, Axis, Zip};

use crate::config::PAD_ID;
use crate::error::ModelError;

pub const MASK_VALUE: f32 = -1e9;

const MIN_TIMESCALE: f32 = 1.0;
const MAX_TIMESCALE: f32 = 1.0e4;

/// 1.0 where `ids == PAD_ID`, else 0.0.
pub fn padding_mask(ids: &Array2<u32>) -> Array2<f32> {
    ids.mapv(|id| if id == PAD_ID { 1.0 } else { 0.0 })
}

/// Padding bias of shape `[batch, 1, 1, len]`.
pub fn attention_bias(ids: &Array2<u32>) -> Array4<f32> {
    let bias = padding_mask(ids) * MASK_VALUE;
    bias.insert_axis(Axis(1)).insert_axis(Axis(1))
}

/// Bias of shape `[1, 1, len, len]` hiding future positions.
pub fn causal_bias(length: usize) -> Array4<f32> {
    let mut bias = Array4::<f32>::zeros((1, 1, length, length));
    for i in 0..length {
        bias.slice_mut(s![0, 0, i, i + 1..]).fill(MASK_VALUE);
    }
    bias
}

/// Self-attention bias for teacher-forced decoding over right-shifted targets.
///
/// Combines the causal bias with the padding of the shifted sequence. Shifted
/// position 0 is the start slot and is never masked, so no query row is ever
/// fully masked.
pub fn decoder_self_attention_bias(targets: &Array2<u32>) -> Array4<f32> {
    let (batch, length) = targets.dim();
    let causal = causal_bias(length);

    let mut shifted_pad = Array2::<f32>::zeros((batch, length));
    if length > 1 {
        shifted_pad
            .slice_mut(s![.., 1..])
            .assign(&padding_mask(targets).slice(s![.., ..length - 1]));
    }
    let padding = (shifted_pad * MASK_VALUE).insert_axis(Axis(1)).insert_axis(Axis(1));

    let mut bias = Array4::<f32>::zeros((batch, 1, length, length));
    Zip::from(&mut bias)
        .and_broadcast(&causal)
        .and_broadcast(&padding)
        .for_each(|b, &c, &p| *b = (c + p).max(MASK_VALUE));
    bias
}

/// Sinusoidal position encoding of shape `[length, depth]`.
///
/// The first `depth / 2` channels hold sines and the rest cosines, with
/// geometrically spaced timescales between 1 and 10^4.
pub fn position_encoding(length: usize, depth: usize) -> Result<Array2<f32>> {
    if depth == 0 || depth % 2 != 0 {
        anyhow::bail!(ModelError::InvalidConfig(format!(
            "position encoding depth must be positive and even, got {}",
            depth
        )));
    }

    let num_timescales = depth / 2;
    let increment =
        (MAX_TIMESCALE / MIN_TIMESCALE).ln() / (num_timescales.saturating_sub(1).max(1)) as f32;
    let inv_timescales =
        Array1::from_shape_fn(num_timescales, |i| MIN_TIMESCALE * (-(i as f32) * increment).exp());

    let mut signal = Array2::<f32>::zeros((length, depth));
    for pos in 0..length {
        for (i, inv) in inv_timescales.iter().enumerate() {
            let scaled = pos as f32 * inv;
            signal[[pos, i]] = scaled.sin();
            signal[[pos, num_timescales + i]] = scaled.cos();
        }
    }
    Ok(signal)
}
