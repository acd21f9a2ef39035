//! Layer normalization implementation

use anyhow::Result;
use ndarray::{Array1, Array3, Axis};

use crate::error::ModelError;
use crate::init::layer_norm_params;

/// Epsilon used by every normalization in the model.
pub const LAYER_NORM_EPS: f32 = 1e-6;

/// Layer normalization over the last axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// Scale one, bias zero.
    pub fn identity(width: usize) -> Self {
        let (weight, bias) = layer_norm_params(width);
        Self::new(weight, bias, LAYER_NORM_EPS)
    }

    pub fn width(&self) -> usize {
        self.weight.len()
    }

    pub fn forward(&self, hidden_states: &Array3<f32>) -> Result<Array3<f32>> {
        let width = hidden_states.shape()[2];
        if width != self.width() {
            anyhow::bail!(ModelError::shape("LayerNorm", &[self.width()], &[width]));
        }

        let mean = hidden_states
            .mean_axis(Axis(2))
            .ok_or_else(|| anyhow::anyhow!("LayerNorm over an empty axis"))?;
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let inv_std = variance.insert_axis(Axis(2)).mapv(|x| 1.0 / (x + self.eps).sqrt());
        let normalized = (hidden_states - &mean_expanded) * &inv_std;

        Ok(normalized * &self.weight + &self.bias)
    }
}
