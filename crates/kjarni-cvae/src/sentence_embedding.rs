//! Attention pooling of encoder states into one vector per example.

use anyhow::Result;
use ndarray::{Array2, Array3, Axis, Zip};
use rand::Rng;

use crate::activations::{softmax_over_sequence, Activation};
use crate::config::TransformerParams;
use crate::dropout::Dropout;
use crate::error::ModelError;
use crate::feedforward::FeedForwardNetwork;
use crate::traits::SublayerArgs;
use crate::utils::masks::MASK_VALUE;
use crate::wrapper::{PrePostProcessingWrapper, WrapperPolicy};

/// Scores every position with a `hidden -> hidden -> 1` network, masks the
/// padding, and returns the softmax-weighted sum of the inputs.
pub struct SentenceEmbeddingLayer {
    scorer: PrePostProcessingWrapper<FeedForwardNetwork>,
}

impl SentenceEmbeddingLayer {
    pub fn new(scorer: FeedForwardNetwork, postprocess_dropout: f32) -> Result<Self> {
        let scorer = PrePostProcessingWrapper::new(
            scorer,
            WrapperPolicy::new(false, true, false),
            postprocess_dropout,
        )?;
        Ok(Self { scorer })
    }

    pub fn random<R: Rng + ?Sized>(params: &TransformerParams, rng: &mut R) -> Result<Self> {
        let scorer = FeedForwardNetwork::random(
            params.hidden_size,
            params.hidden_size,
            1,
            Activation::Relu,
            params.relu_dropout,
            params.allow_ffn_pad,
            params.initializer_gain,
            rng,
        )?;
        Self::new(scorer, params.layer_postprocess_dropout)
    }

    pub fn num_parameters(&self) -> usize {
        self.scorer.num_parameters()
    }

    /// `[batch, len, hidden]` plus `[batch, len]` padding to `[batch, hidden]`.
    pub fn forward(
        &self,
        inputs: &Array3<f32>,
        padding: &Array2<f32>,
        dropout: &mut Dropout,
    ) -> Result<Array2<f32>> {
        let (batch, len, _) = inputs.dim();
        if padding.dim() != (batch, len) {
            anyhow::bail!(ModelError::shape(
                "sentence embedding padding",
                &[batch, len],
                padding.shape()
            ));
        }

        let mut logits = self
            .scorer
            .apply(inputs, SublayerArgs::none().padding(Some(padding)), dropout)?;

        Zip::from(logits.index_axis_mut(Axis(2), 0))
            .and(padding)
            .for_each(|logit, &pad| {
                if pad > 0.5 {
                    *logit = MASK_VALUE;
                }
            });

        let weights = softmax_over_sequence(&logits);
        Ok((inputs * &weights).sum_axis(Axis(1)))
    }
}
