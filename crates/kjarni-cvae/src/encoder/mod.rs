//! Encoder input preparation and the self-attention encoder stack.

use std::time::Instant;

use anyhow::Result;
use ndarray::{Array2, Array3, Array4, Axis};
use rand::Rng;

use crate::activations::Activation;
use crate::attention::{MultiHeadAttention, SelfAttention};
use crate::config::TransformerParams;
use crate::dropout::Dropout;
use crate::error::ModelError;
use crate::feedforward::FeedForwardNetwork;
use crate::normalization::LayerNorm;
use crate::traits::SublayerArgs;
use crate::utils::masks::{attention_bias, padding_mask, position_encoding};
use crate::wrapper::{PrePostProcessingWrapper, WrapperPolicy};

#[cfg(test)]
mod tests;

/// Encoder-side inputs derived from a batch of token ids.
pub struct EncoderInputs {
    /// Embeddings plus position encoding, `[batch, len, hidden]`.
    pub hidden_states: Array3<f32>,
    /// 1.0 at padding positions, `[batch, len]`.
    pub padding: Array2<f32>,
    /// Additive self-attention bias, `[batch, 1, 1, len]`.
    pub attention_bias: Array4<f32>,
}

/// Adds position encoding to embedded ids and builds their padding masks.
///
/// `embedded` must already be the output of the shared embedding lookup, so
/// padding rows are zero.
pub fn prepare_encoder_inputs(
    ids: &Array2<u32>,
    embedded: Array3<f32>,
    dropout_rate: f32,
    dropout: &mut Dropout,
) -> Result<EncoderInputs> {
    let (batch, len, hidden) = embedded.dim();
    if ids.dim() != (batch, len) {
        anyhow::bail!(ModelError::shape("encoder ids", &[batch, len], ids.shape()));
    }

    let positions = position_encoding(len, hidden)?;
    let hidden_states = dropout.apply(embedded + &positions.insert_axis(Axis(0)), dropout_rate);

    Ok(EncoderInputs {
        hidden_states,
        padding: padding_mask(ids),
        attention_bias: attention_bias(ids),
    })
}

pub struct EncoderLayer {
    pub self_attention: PrePostProcessingWrapper<SelfAttention>,
    pub feed_forward: PrePostProcessingWrapper<FeedForwardNetwork>,
}

impl EncoderLayer {
    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        bias: &Array4<f32>,
        padding: &Array2<f32>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let attended = self
            .self_attention
            .apply(hidden_states, SublayerArgs::none().bias(bias), dropout)?;
        self.feed_forward
            .apply(&attended, SublayerArgs::none().padding(Some(padding)), dropout)
    }

    pub fn num_parameters(&self) -> usize {
        self.self_attention.num_parameters() + self.feed_forward.num_parameters()
    }
}

/// `N` self-attention / feed-forward layers followed by a final layer norm.
pub struct EncoderStack {
    layers: Vec<EncoderLayer>,
    output_norm: LayerNorm,
}

impl EncoderStack {
    pub fn new(layers: Vec<EncoderLayer>, output_norm: LayerNorm) -> Result<Self> {
        if layers.is_empty() {
            anyhow::bail!(ModelError::InvalidConfig(
                "encoder stack needs at least one layer".to_string()
            ));
        }
        Ok(Self {
            layers,
            output_norm,
        })
    }

    pub fn random<R: Rng + ?Sized>(params: &TransformerParams, rng: &mut R) -> Result<Self> {
        let hidden = params.hidden_size;
        let mut layers = Vec::with_capacity(params.num_hidden_layers);

        for _ in 0..params.num_hidden_layers {
            let attention = MultiHeadAttention::random(
                hidden,
                params.num_heads,
                params.attention_dropout,
                params.initializer_gain,
                &mut *rng,
            )?;
            let ffn = FeedForwardNetwork::random(
                hidden,
                params.filter_size,
                hidden,
                Activation::Relu,
                params.relu_dropout,
                params.allow_ffn_pad,
                params.initializer_gain,
                &mut *rng,
            )?;

            layers.push(EncoderLayer {
                self_attention: PrePostProcessingWrapper::new(
                    SelfAttention(attention),
                    WrapperPolicy::default(),
                    params.layer_postprocess_dropout,
                )?,
                feed_forward: PrePostProcessingWrapper::new(
                    ffn,
                    WrapperPolicy::default(),
                    params.layer_postprocess_dropout,
                )?,
            });
        }

        Self::new(layers, LayerNorm::identity(hidden))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_parameters(&self) -> usize {
        let norm = self.output_norm.weight.len() + self.output_norm.bias.len();
        norm + self.layers.iter().map(|l| l.num_parameters()).sum::<usize>()
    }

    /// Runs every layer over `[batch, len, hidden]` and normalises the result.
    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        bias: &Array4<f32>,
        padding: &Array2<f32>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let t_start = Instant::now();
        let mut hidden = hidden_states.clone();

        for (i, layer) in self.layers.iter().enumerate() {
            let t_layer = Instant::now();
            hidden = layer.forward(&hidden, bias, padding, dropout)?;
            log::debug!("[Encoder] layer {} took: {:?}", i, t_layer.elapsed());
        }

        let output = self.output_norm.forward(&hidden)?;
        log::debug!(
            "[Encoder] {} layers over {:?} took: {:?}",
            self.layers.len(),
            hidden_states.dim(),
            t_start.elapsed()
        );
        Ok(output)
    }
}
