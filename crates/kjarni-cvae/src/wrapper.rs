//! Layer normalization, dropout and residual connection around a sublayer.

use std::borrow::Cow;

use anyhow::Result;
use ndarray::Array3;

use crate::dropout::Dropout;
use crate::error::ModelError;
use crate::normalization::LayerNorm;
use crate::traits::{Sublayer, SublayerArgs};

/// Which pre/post-processing steps a wrapper performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperPolicy {
    pub normalize: bool,
    pub dropout: bool,
    pub residual: bool,
}

impl Default for WrapperPolicy {
    fn default() -> Self {
        Self {
            normalize: true,
            dropout: true,
            residual: true,
        }
    }
}

impl WrapperPolicy {
    pub fn new(normalize: bool, dropout: bool, residual: bool) -> Self {
        Self {
            normalize,
            dropout,
            residual,
        }
    }

    /// Normalize and dropout, no residual. For sublayers that change width.
    pub fn no_residual() -> Self {
        Self::new(true, true, false)
    }
}

/// `y = layer(norm(x))`, then `dropout(y)` in training, then `x + y`.
pub struct PrePostProcessingWrapper<L> {
    layer: L,
    layer_norm: Option<LayerNorm>,
    policy: WrapperPolicy,
    postprocess_dropout: f32,
}

impl<L: Sublayer> PrePostProcessingWrapper<L> {
    pub fn new(layer: L, policy: WrapperPolicy, postprocess_dropout: f32) -> Result<Self> {
        if !(policy.normalize || policy.dropout || policy.residual) {
            anyhow::bail!(ModelError::InvalidWrapper(
                "at least one of normalize, dropout or residual must be enabled".to_string()
            ));
        }
        if policy.residual && layer.input_width() != layer.output_width() {
            anyhow::bail!(ModelError::InvalidWrapper(format!(
                "residual connection needs matching widths, got {} -> {}",
                layer.input_width(),
                layer.output_width()
            )));
        }

        let layer_norm = policy
            .normalize
            .then(|| LayerNorm::identity(layer.input_width()));

        Ok(Self {
            layer,
            layer_norm,
            policy,
            postprocess_dropout,
        })
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    pub fn num_parameters(&self) -> usize {
        let norm = self
            .layer_norm
            .as_ref()
            .map_or(0, |n| n.weight.len() + n.bias.len());
        norm + self.layer.num_parameters()
    }

    pub fn apply(
        &self,
        x: &Array3<f32>,
        args: SublayerArgs<'_>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let normed: Cow<'_, Array3<f32>> = match &self.layer_norm {
            Some(norm) => Cow::Owned(norm.forward(x)?),
            None => Cow::Borrowed(x),
        };

        let mut y = self.layer.apply(&normed, args, dropout)?;

        if self.policy.dropout {
            y = dropout.apply(y, self.postprocess_dropout);
        }
        if self.policy.residual {
            y += x;
        }
        Ok(y)
    }
}
