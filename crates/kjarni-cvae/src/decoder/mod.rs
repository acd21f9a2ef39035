//! Latent-conditioned decoder stack.

use std::time::Instant;

use anyhow::Result;
use ndarray::{concatenate, Array2, Array3, Array4, Axis};
use rand::Rng;

use crate::activations::Activation;
use crate::attention::{CrossAttention, MultiHeadAttention, SelfAttention};
use crate::cache::LayerKvCache;
use crate::config::TransformerParams;
use crate::dropout::Dropout;
use crate::error::ModelError;
use crate::feedforward::FeedForwardNetwork;
use crate::normalization::LayerNorm;
use crate::traits::SublayerArgs;
use crate::wrapper::{PrePostProcessingWrapper, WrapperPolicy};

#[cfg(test)]
mod tests;

/// Tiles `[batch, latent]` across every position of `[batch, len, hidden]`
/// and appends it on the channel axis.
pub fn concat_latent(hidden_states: &Array3<f32>, latent: &Array2<f32>) -> Result<Array3<f32>> {
    let (batch, len, _) = hidden_states.dim();
    let latent_size = latent.ncols();
    let expanded = latent.view().insert_axis(Axis(1));
    let tiled = expanded
        .broadcast((batch, len, latent_size))
        .ok_or_else(|| {
            ModelError::shape("latent sample", &[batch, latent_size], latent.shape())
        })?;
    Ok(concatenate(Axis(2), &[hidden_states.view(), tiled])?)
}

pub struct DecoderLayer {
    pub self_attention: PrePostProcessingWrapper<SelfAttention>,
    pub cross_attention: PrePostProcessingWrapper<CrossAttention>,
    pub feed_forward: PrePostProcessingWrapper<FeedForwardNetwork>,
}

impl DecoderLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        encoder_outputs: &Array3<f32>,
        self_bias: &Array4<f32>,
        cross_bias: &Array4<f32>,
        latent: &Array2<f32>,
        cache: Option<&mut LayerKvCache>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let t_sa = Instant::now();
        let hidden = self.self_attention.apply(
            hidden_states,
            SublayerArgs::none().bias(self_bias).cache(cache),
            dropout,
        )?;
        log::debug!("[DecoderLayer] Self-Attention block took: {:?}", t_sa.elapsed());

        let t_ca = Instant::now();
        let hidden = self.cross_attention.apply(
            &hidden,
            SublayerArgs::none().bias(cross_bias).memory(encoder_outputs),
            dropout,
        )?;
        log::debug!("[DecoderLayer] Cross-Attention block took: {:?}", t_ca.elapsed());

        let t_ffn = Instant::now();
        let conditioned = concat_latent(&hidden, latent)?;
        let output = self
            .feed_forward
            .apply(&conditioned, SublayerArgs::none(), dropout)?;
        log::debug!("[DecoderLayer] FFN block took: {:?}", t_ffn.elapsed());

        Ok(output)
    }

    pub fn num_parameters(&self) -> usize {
        self.self_attention.num_parameters()
            + self.cross_attention.num_parameters()
            + self.feed_forward.num_parameters()
    }
}

pub struct DecoderStack {
    layers: Vec<DecoderLayer>,
    output_norm: LayerNorm,
}

impl DecoderStack {
    pub fn new(layers: Vec<DecoderLayer>, output_norm: LayerNorm) -> Result<Self> {
        if layers.is_empty() {
            anyhow::bail!(ModelError::InvalidConfig(
                "decoder stack needs at least one layer".to_string()
            ));
        }
        Ok(Self {
            layers,
            output_norm,
        })
    }

    pub fn random<R: Rng + ?Sized>(params: &TransformerParams, rng: &mut R) -> Result<Self> {
        let hidden = params.hidden_size;
        let postprocess = params.layer_postprocess_dropout;
        let mut layers = Vec::with_capacity(params.num_hidden_layers);

        for _ in 0..params.num_hidden_layers {
            let self_attention = MultiHeadAttention::random(
                hidden,
                params.num_heads,
                params.attention_dropout,
                params.initializer_gain,
                &mut *rng,
            )?;
            let cross_attention = MultiHeadAttention::random(
                hidden,
                params.num_heads,
                params.attention_dropout,
                params.initializer_gain,
                &mut *rng,
            )?;
            // No padding mask reaches the decoder feed-forward.
            let ffn = FeedForwardNetwork::random(
                hidden + params.latent_size,
                params.filter_size,
                hidden,
                Activation::Relu,
                params.relu_dropout,
                false,
                params.initializer_gain,
                &mut *rng,
            )?;

            layers.push(DecoderLayer {
                self_attention: PrePostProcessingWrapper::new(
                    SelfAttention(self_attention),
                    WrapperPolicy::default(),
                    postprocess,
                )?,
                cross_attention: PrePostProcessingWrapper::new(
                    CrossAttention(cross_attention),
                    WrapperPolicy::default(),
                    postprocess,
                )?,
                feed_forward: PrePostProcessingWrapper::new(
                    ffn,
                    WrapperPolicy::no_residual(),
                    postprocess,
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

    /// Decodes `[batch, len, hidden]` decoder inputs.
    ///
    /// With `caches` (one per layer) each call extends the self-attention
    /// keys and values, so `inputs` only needs to hold the new positions and
    /// `self_bias` must cover every cached key.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        inputs: &Array3<f32>,
        encoder_outputs: &Array3<f32>,
        self_bias: &Array4<f32>,
        cross_bias: &Array4<f32>,
        latent: &Array2<f32>,
        mut caches: Option<&mut [LayerKvCache]>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        if let Some(caches) = caches.as_deref() {
            if caches.len() != self.layers.len() {
                anyhow::bail!(ModelError::shape(
                    "decoder caches",
                    &[self.layers.len()],
                    &[caches.len()]
                ));
            }
        }
        if latent.nrows() != inputs.shape()[0] {
            anyhow::bail!(ModelError::shape(
                "latent sample rows",
                &[inputs.shape()[0]],
                &[latent.nrows()]
            ));
        }

        let mut hidden = inputs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let cache = caches.as_deref_mut().map(|c| &mut c[i]);
            hidden = layer.forward(
                &hidden,
                encoder_outputs,
                self_bias,
                cross_bias,
                latent,
                cache,
                dropout,
            )?;
        }

        self.output_norm.forward(&hidden)
    }
}
