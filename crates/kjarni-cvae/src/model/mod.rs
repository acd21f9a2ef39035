//! The conditional variational transformer: training forward pass and
//! beam-search inference.

use std::time::Instant;

use anyhow::Result;
use ndarray::{s, Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::beam_search::{sequence_beam_search, BeamSearchConfig};
use crate::cache::DecoderCache;
use crate::config::{TransformerParams, PAD_ID};
use crate::decoder::DecoderStack;
use crate::dropout::Dropout;
use crate::embeddings::SharedEmbeddings;
use crate::encoder::{prepare_encoder_inputs, EncoderStack};
use crate::error::ModelError;
use crate::latent::LatentVariableLayer;
use crate::sentence_embedding::SentenceEmbeddingLayer;
use crate::utils::masks::{causal_bias, decoder_self_attention_bias, position_encoding};

#[cfg(test)]
mod tests;

/// Everything a training loop needs to build its loss.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// `[batch, target_len, vocab_size]`
    pub logits: Array3<f32>,
    pub latent_sample: Array2<f32>,
    pub prior_mu: Array2<f32>,
    pub prior_logvar: Array2<f32>,
    pub recog_mu: Array2<f32>,
    pub recog_logvar: Array2<f32>,
}

/// Decoded ids (EOS stripped) and scores, one entry per example.
#[derive(Debug, Clone, PartialEq)]
pub struct InferOutput {
    pub outputs: Vec<Vec<u32>>,
    pub scores: Vec<f32>,
}

/// Encoder output for one side of the model.
struct Encoded {
    outputs: Array3<f32>,
    sentence_embedding: Array2<f32>,
    attention_bias: Array4<f32>,
}

/// `[batch, len, hidden]` moved one position right with a zero first row.
pub(crate) fn shift_right(x: &Array3<f32>) -> Array3<f32> {
    let (batch, len, hidden) = x.dim();
    let mut shifted = Array3::<f32>::zeros((batch, len, hidden));
    if len > 1 {
        shifted
            .slice_mut(s![.., 1.., ..])
            .assign(&x.slice(s![.., ..len - 1, ..]));
    }
    shifted
}

/// Repeats every row of `x` `times` times along axis 0.
fn tile_rows<D: ndarray::RemoveAxis>(
    x: &ndarray::Array<f32, D>,
    times: usize,
) -> ndarray::Array<f32, D> {
    let rows: Vec<usize> = (0..x.len_of(Axis(0)) * times).map(|r| r / times).collect();
    x.select(Axis(0), &rows)
}

pub struct Transformer {
    params: TransformerParams,
    embeddings: SharedEmbeddings,
    src_encoder: EncoderStack,
    src_sentence_embedding: SentenceEmbeddingLayer,
    tgt_encoder: EncoderStack,
    tgt_sentence_embedding: SentenceEmbeddingLayer,
    latent_layer: LatentVariableLayer,
    decoder: DecoderStack,
}

impl Transformer {
    pub fn new_random<R: Rng + ?Sized>(params: TransformerParams, rng: &mut R) -> Result<Self> {
        params.validate()?;
        let t_start = Instant::now();

        let embeddings = SharedEmbeddings::random(params.vocab_size, params.hidden_size, &mut *rng);
        let src_encoder = EncoderStack::random(&params, &mut *rng)?;
        let src_sentence_embedding = SentenceEmbeddingLayer::random(&params, &mut *rng)?;
        let tgt_encoder = EncoderStack::random(&params, &mut *rng)?;
        let tgt_sentence_embedding = SentenceEmbeddingLayer::random(&params, &mut *rng)?;
        let latent_layer = LatentVariableLayer::random(&params, &mut *rng)?;
        let decoder = DecoderStack::random(&params, &mut *rng)?;

        let model = Self {
            params,
            embeddings,
            src_encoder,
            src_sentence_embedding,
            tgt_encoder,
            tgt_sentence_embedding,
            latent_layer,
            decoder,
        };

        log::info!(
            "[Transformer] initialised {} layers, hidden {}, latent {}, vocab {} ({} parameters) in {:?}",
            model.params.num_hidden_layers,
            model.params.hidden_size,
            model.params.latent_size,
            model.params.vocab_size,
            model.num_parameters(),
            t_start.elapsed()
        );
        Ok(model)
    }

    pub fn params(&self) -> &TransformerParams {
        &self.params
    }

    pub fn embeddings(&self) -> &SharedEmbeddings {
        &self.embeddings
    }

    pub fn num_parameters(&self) -> usize {
        self.embeddings.table().len()
            + self.src_encoder.num_parameters()
            + self.src_sentence_embedding.num_parameters()
            + self.tgt_encoder.num_parameters()
            + self.tgt_sentence_embedding.num_parameters()
            + self.latent_layer.num_parameters()
            + self.decoder.num_parameters()
    }

    fn encode(
        &self,
        ids: &Array2<u32>,
        encoder: &EncoderStack,
        sentence_embedding: &SentenceEmbeddingLayer,
        dropout: &mut Dropout,
    ) -> Result<Encoded> {
        let embedded = self.embeddings.embed(ids)?;
        let inputs = prepare_encoder_inputs(
            ids,
            embedded,
            self.params.layer_postprocess_dropout,
            dropout,
        )?;
        let outputs = encoder.forward(
            &inputs.hidden_states,
            &inputs.attention_bias,
            &inputs.padding,
            dropout,
        )?;
        let sentence_embedding = sentence_embedding.forward(&outputs, &inputs.padding, dropout)?;

        Ok(Encoded {
            outputs,
            sentence_embedding,
            attention_bias: inputs.attention_bias,
        })
    }

    /// Teacher-forced pass over `inputs` `[batch, src_len]` and `targets`
    /// `[batch, tgt_len]` with dropout active and the latent drawn from the
    /// recognition network.
    pub fn train_forward(&self, inputs: &Array2<u32>, targets: &Array2<u32>) -> Result<TrainOutput> {
        self.train_forward_with_rng(inputs, targets, &mut StdRng::from_entropy())
    }

    pub fn train_forward_with_rng<R: Rng + ?Sized>(
        &self,
        inputs: &Array2<u32>,
        targets: &Array2<u32>,
        rng: &mut R,
    ) -> Result<TrainOutput> {
        if inputs.nrows() != targets.nrows() {
            anyhow::bail!(ModelError::shape(
                "targets batch",
                &[inputs.nrows()],
                &[targets.nrows()]
            ));
        }
        let mut dropout = Dropout::training(StdRng::from_rng(&mut *rng)?);

        let source = self.encode(inputs, &self.src_encoder, &self.src_sentence_embedding, &mut dropout)?;
        let target = self.encode(targets, &self.tgt_encoder, &self.tgt_sentence_embedding, &mut dropout)?;

        let latent = self.latent_layer.forward(
            &source.sentence_embedding,
            Some(&target.sentence_embedding),
            &mut *rng,
        )?;

        let target_len = targets.ncols();
        let positions = position_encoding(target_len, self.params.hidden_size)?;
        let decoder_inputs = dropout.apply(
            shift_right(&self.embeddings.embed(targets)?) + &positions.insert_axis(Axis(0)),
            self.params.layer_postprocess_dropout,
        );

        let decoder_outputs = self.decoder.forward(
            &decoder_inputs,
            &source.outputs,
            &decoder_self_attention_bias(targets),
            &source.attention_bias,
            &latent.latent_sample,
            None,
            &mut dropout,
        )?;
        let logits = self.embeddings.linear(&decoder_outputs)?;

        let (recog_mu, recog_logvar) = match (latent.recog_mu, latent.recog_logvar) {
            (Some(mu), Some(logvar)) => (mu, logvar),
            _ => anyhow::bail!("recognition network produced no distribution"),
        };

        Ok(TrainOutput {
            logits,
            latent_sample: latent.latent_sample,
            prior_mu: latent.prior_mu,
            prior_logvar: latent.prior_logvar,
            recog_mu,
            recog_logvar,
        })
    }

    /// Beam-search decoding of `inputs` `[batch, src_len]` conditioned on a
    /// latent sample from the prior.
    pub fn infer(&self, inputs: &Array2<u32>) -> Result<InferOutput> {
        self.infer_with_rng(inputs, &mut StdRng::from_entropy())
    }

    pub fn infer_with_rng<R: Rng + ?Sized>(
        &self,
        inputs: &Array2<u32>,
        rng: &mut R,
    ) -> Result<InferOutput> {
        let t_start = Instant::now();
        let (batch, input_len) = inputs.dim();
        let beam_size = self.params.beam_size;
        let max_decode_length = input_len + self.params.extra_decode_length;

        let source = self.encode(
            inputs,
            &self.src_encoder,
            &self.src_sentence_embedding,
            &mut Dropout::disabled(),
        )?;
        let latent = self
            .latent_layer
            .forward(&source.sentence_embedding, None, rng)?;

        let mut cache = DecoderCache::new(
            self.decoder.num_layers(),
            max_decode_length,
            tile_rows(&source.outputs, beam_size),
            tile_rows(&source.attention_bias, beam_size),
            tile_rows(&latent.latent_sample, beam_size),
        )?;

        let positions = position_encoding(max_decode_length, self.params.hidden_size)?;
        let self_bias = causal_bias(max_decode_length);

        let step_fn = |ids: &Array2<u32>, step: usize, cache: &mut DecoderCache| -> Result<Array2<f32>> {
            let last = ids.slice(s![.., step..step + 1]).to_owned();
            let mut x = self.embeddings.embed(&last)?;
            x += &positions.slice(s![step..step + 1, ..]);
            let bias = self_bias
                .slice(s![.., .., step..step + 1, ..step + 1])
                .to_owned();

            let parts = cache.parts_mut();
            let hidden = self.decoder.forward(
                &x,
                parts.encoder_outputs,
                &bias,
                parts.encoder_decoder_bias,
                parts.latent_sample,
                Some(parts.layers),
                &mut Dropout::disabled(),
            )?;
            Ok(self.embeddings.linear(&hidden)?.index_axis_move(Axis(1), 0))
        };

        let cfg = BeamSearchConfig {
            vocab_size: self.params.vocab_size,
            beam_size,
            alpha: self.params.alpha,
            max_decode_length,
            eos_id: self.params.eos_id,
        };
        let results = sequence_beam_search(step_fn, &vec![PAD_ID; batch], &mut cache, &cfg)?;

        let mut outputs = Vec::with_capacity(batch);
        let mut scores = Vec::with_capacity(batch);
        for result in results {
            let mut tokens = result.tokens;
            if tokens.last() == Some(&self.params.eos_id) {
                tokens.pop();
            }
            outputs.push(tokens);
            scores.push(result.score);
        }

        log::info!(
            "[Transformer] decoded {} examples (beam {}, max length {}) in {:?}",
            batch,
            beam_size,
            max_decode_length,
            t_start.elapsed()
        );
        Ok(InferOutput { outputs, scores })
    }
}
