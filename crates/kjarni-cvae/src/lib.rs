//! Kjarni CVAE: a conditional variational transformer for sequence-to-sequence
//! generation.
//!
//! The encoder summarises the source into a sentence embedding, a prior
//! network (and, in training, a recognition network over source and target)
//! turns that into a Gaussian latent sample, and every decoder layer
//! conditions its feed-forward block on the sample.

pub mod activations;
pub mod attention;
pub mod beam_search;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod dropout;
pub mod embeddings;
pub mod encoder;
pub mod error;
pub mod feedforward;
pub mod init;
pub mod latent;
pub mod linear_layer;
pub mod model;
pub mod normalization;
pub mod sentence_embedding;
pub mod traits;
pub mod utils;
pub mod wrapper;

// Re-export commonly used items
pub use crate::{
    attention::{CrossAttention, MultiHeadAttention, SelfAttention},
    beam_search::{length_penalty, sequence_beam_search, BeamSearchConfig, BeamSearchOutput},
    cache::{BeamCache, DecoderCache, LayerKvCache},
    config::{TransformerParams, EOS_ID, PAD_ID},
    error::{ModelError, ModelResult},
    feedforward::FeedForwardNetwork,
    latent::{LatentOutput, LatentVariableLayer},
    model::{InferOutput, TrainOutput, Transformer},
    wrapper::{PrePostProcessingWrapper, WrapperPolicy},
};

pub mod prelude {
    pub use crate::config::TransformerParams;
    pub use crate::error::ModelError;
    pub use crate::model::{InferOutput, TrainOutput, Transformer};
}
