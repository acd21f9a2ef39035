//! Activation functions and softmax operations.

use std::str::FromStr;

use ndarray::{Array1, Array3, Array4, ArrayBase, Axis, DataMut, Dimension};
use serde::{Deserialize, Serialize};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

/// Nonlinearities available to the feed-forward layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
}

impl FromStr for Activation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            other => Err(anyhow::anyhow!("unknown activation: {}", other)),
        }
    }
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

pub fn apply_activation<S, D>(x: &mut ArrayBase<S, D>, activation: Activation)
where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    let f: fn(f32) -> f32 = match activation {
        Activation::Relu => relu_scalar,
        Activation::Tanh => f32::tanh,
    };
    if x.len() >= PARALLEL_THRESHOLD {
        x.par_mapv_inplace(f);
    } else {
        x.mapv_inplace(f);
    }
}

/// Softmax over a contiguous slice.
///
/// A row whose entries are all `-inf` becomes uniform instead of NaN.
pub fn softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        let uniform = 1.0 / slice.len() as f32;
        slice.iter_mut().for_each(|v| *v = uniform);
        return;
    }

    let mut sum = 0.0;
    for v in slice.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in slice.iter_mut() {
            *v *= scale;
        }
    }
}

/// Applies softmax along the last axis of a 4D array.
pub fn softmax_4d_inplace(scores: &mut Array4<f32>) {
    scores
        .lanes_mut(Axis(3))
        .into_iter()
        .for_each(|mut row| match row.as_slice_mut() {
            Some(slice) => softmax_inplace(slice),
            None => {
                let mut owned = row.to_vec();
                softmax_inplace(&mut owned);
                row.iter_mut().zip(owned).for_each(|(dst, v)| *dst = v);
            }
        });
}

/// Softmax over the sequence axis (axis 1) of a `[batch, seq, 1]` score tensor.
pub fn softmax_over_sequence(scores: &Array3<f32>) -> Array3<f32> {
    let mut out = scores.to_owned();
    for mut lane in out.lanes_mut(Axis(1)) {
        let mut values = lane.to_vec();
        softmax_inplace(&mut values);
        lane.iter_mut().zip(values).for_each(|(dst, v)| *dst = v);
    }
    out
}

pub fn log_softmax_1d(logits: &Array1<f32>) -> Array1<f32> {
    let max_val = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let scaled_logits = logits - max_val;
    let exp_sum = scaled_logits.mapv(f32::exp).sum();
    scaled_logits - exp_sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, Array3, Array4};

    #[test]
    fn test_softmax_inplace_basic() {
        let mut data = vec![1.0, 2.0, 3.0];
        softmax_inplace(&mut data);
        assert_relative_eq!(data[0], 0.09003057, epsilon = 1e-6);
        assert_relative_eq!(data[1], 0.24472847, epsilon = 1e-6);
        assert_relative_eq!(data[2], 0.66524094, epsilon = 1e-6);
        assert_relative_eq!(data.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_softmax_fully_masked_row_is_finite() {
        let mut data = vec![-1e9, -1e9, -1e9, -1e9];
        softmax_inplace(&mut data);
        for v in &data {
            assert!(v.is_finite());
            assert_relative_eq!(*v, 0.25, epsilon = 1e-6);
        }

        let mut neg_inf = vec![f32::NEG_INFINITY; 3];
        softmax_inplace(&mut neg_inf);
        assert!(neg_inf.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_softmax_4d_rows_sum_to_one() {
        let mut scores = Array4::from_shape_fn((2, 2, 3, 5), |(b, h, q, k)| {
            (b + h * 2 + q * 3) as f32 * 0.1 - k as f32
        });
        softmax_4d_inplace(&mut scores);
        for row in scores.lanes(Axis(3)) {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_softmax_over_sequence() {
        let scores = Array3::from_shape_vec((1, 2, 1), vec![0.0, 0.0]).unwrap();
        let weights = softmax_over_sequence(&scores);
        assert_relative_eq!(weights[[0, 0, 0]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(weights[[0, 1, 0]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_log_softmax_normalises() {
        let lp = log_softmax_1d(&arr1(&[1.0, 2.0, 3.0]));
        let total: f32 = lp.mapv(f32::exp).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        assert!(lp.iter().all(|&v| v <= 0.0));
    }

    #[test]
    fn test_relu_and_tanh() {
        let mut x = arr1(&[-1.0f32, 0.0, 2.0]);
        apply_activation(&mut x, Activation::Relu);
        assert_eq!(x, arr1(&[0.0, 0.0, 2.0]));

        let mut y = arr1(&[0.0f32]);
        apply_activation(&mut y, Activation::Tanh);
        assert_relative_eq!(y[0], 0.0);
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
    }
}
