//! Multi-head attention with an incremental key/value cache

use anyhow::Result;
use ndarray::{Array3, Array4, ArrayView3};
use rand::Rng;

use crate::activations::softmax_4d_inplace;
use crate::dropout::Dropout;
use crate::error::ModelError;
use crate::linear_layer::LinearLayer;
use crate::traits::{Sublayer, SublayerArgs};
use crate::utils::linear_algebra::matmul_4d;


/// Multi-head scaled dot-product attention.
///
/// Projections carry no bias. The attention dropout is applied to the
/// softmax weights when the supplied [`Dropout`] is active.
pub struct MultiHeadAttention {
    pub q_proj: LinearLayer,
    pub k_proj: LinearLayer,
    pub v_proj: LinearLayer,
    pub output_proj: LinearLayer,

    pub hidden_size: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub scale_factor: f32,
    pub dropout_rate: f32,
}

impl MultiHeadAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        q_proj: LinearLayer,
        k_proj: LinearLayer,
        v_proj: LinearLayer,
        output_proj: LinearLayer,
        dropout_rate: f32,
    ) -> Result<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            anyhow::bail!(ModelError::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_heads {}",
                hidden_size, num_heads
            )));
        }
        for (name, proj) in [("q", &q_proj), ("k", &k_proj), ("v", &v_proj), ("output", &output_proj)] {
            if proj.in_features() != hidden_size || proj.out_features() != hidden_size {
                anyhow::bail!(ModelError::InvalidConfig(format!(
                    "{} projection is [{}, {}], expected [{}, {}]",
                    name,
                    proj.in_features(),
                    proj.out_features(),
                    hidden_size,
                    hidden_size
                )));
            }
        }

        let head_dim = hidden_size / num_heads;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            output_proj,
            hidden_size,
            num_heads,
            head_dim,
            scale_factor: 1.0 / (head_dim as f32).sqrt(),
            dropout_rate,
        })
    }

    pub fn random<R: Rng + ?Sized>(
        hidden_size: usize,
        num_heads: usize,
        dropout_rate: f32,
        gain: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let q = LinearLayer::random(hidden_size, hidden_size, false, gain, &mut *rng);
        let k = LinearLayer::random(hidden_size, hidden_size, false, gain, &mut *rng);
        let v = LinearLayer::random(hidden_size, hidden_size, false, gain, &mut *rng);
        let o = LinearLayer::random(hidden_size, hidden_size, false, gain, &mut *rng);
        Self::new(hidden_size, num_heads, q, k, v, o, dropout_rate)
    }

    pub fn num_parameters(&self) -> usize {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.output_proj]
            .iter()
            .map(|p| p.num_parameters())
            .sum()
    }

    /// Projects a memory sequence into keys and values.
    pub fn project_kv(&self, memory: &Array3<f32>) -> Result<(Array3<f32>, Array3<f32>)> {
        Ok((self.k_proj.forward(memory)?, self.v_proj.forward(memory)?))
    }

    /// `[batch, len, hidden]` -> `[batch, heads, len, head_dim]`
    fn split_heads(&self, x: ArrayView3<f32>) -> Result<Array4<f32>> {
        let (batch, len, _) = x.dim();
        Ok(x
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, len, self.num_heads, self.head_dim))?
            .permuted_axes([0, 2, 1, 3]))
    }

    /// `[batch, heads, len, head_dim]` -> `[batch, len, hidden]`
    fn combine_heads(&self, x: Array4<f32>) -> Result<Array3<f32>> {
        let (batch, _, len, _) = x.dim();
        Ok(x
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, len, self.hidden_size))?)
    }

    /// Attention of projected queries over projected keys and values.
    ///
    /// `bias` must broadcast to `[batch, heads, q_len, kv_len]`.
    pub fn attend(
        &self,
        q: &Array3<f32>,
        k: ArrayView3<f32>,
        v: ArrayView3<f32>,
        bias: Option<&Array4<f32>>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        if q.shape()[0] != k.shape()[0] || k.shape() != v.shape() {
            anyhow::bail!(ModelError::shape("attention keys", q.shape(), k.shape()));
        }

        let q_heads = self.split_heads(q.view())? * self.scale_factor;
        let k_t = self
            .split_heads(k)?
            .permuted_axes([0, 1, 3, 2])
            .as_standard_layout()
            .into_owned();
        let v_heads = self.split_heads(v)?.as_standard_layout().into_owned();

        let mut scores = matmul_4d(&q_heads.as_standard_layout().into_owned(), &k_t);

        if let Some(bias) = bias {
            let broadcast = bias.broadcast(scores.dim()).ok_or_else(|| {
                ModelError::shape("attention bias", scores.shape(), bias.shape())
            })?;
            scores += &broadcast;
        }

        softmax_4d_inplace(&mut scores);
        let weights = dropout.apply(scores, self.dropout_rate);

        let context = matmul_4d(&weights, &v_heads);
        self.output_proj.forward(&self.combine_heads(context)?)
    }

    /// Attention of `query` over `memory` without caching.
    pub fn forward(
        &self,
        query: &Array3<f32>,
        memory: &Array3<f32>,
        bias: Option<&Array4<f32>>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let q = self.q_proj.forward(query)?;
        let (k, v) = self.project_kv(memory)?;
        self.attend(&q, k.view(), v.view(), bias, dropout)
    }
}

/// Self-attention sublayer. With a cache, the new positions' keys and values
/// are appended and attention runs over the whole accumulated prefix.
pub struct SelfAttention(pub MultiHeadAttention);

/// Attention from the decoder state onto the encoder output.
pub struct CrossAttention(pub MultiHeadAttention);

impl Sublayer for SelfAttention {
    fn input_width(&self) -> usize {
        self.0.hidden_size
    }

    fn output_width(&self) -> usize {
        self.0.hidden_size
    }

    fn num_parameters(&self) -> usize {
        self.0.num_parameters()
    }

    fn apply(
        &self,
        input: &Array3<f32>,
        args: SublayerArgs<'_>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let attn = &self.0;
        let q = attn.q_proj.forward(input)?;
        let (k, v) = attn.project_kv(input)?;

        match args.cache {
            Some(cache) => {
                cache.append(&k, &v)?;
                attn.attend(&q, cache.keys(), cache.values(), args.bias, dropout)
            }
            None => attn.attend(&q, k.view(), v.view(), args.bias, dropout),
        }
    }
}

impl Sublayer for CrossAttention {
    fn input_width(&self) -> usize {
        self.0.hidden_size
    }

    fn output_width(&self) -> usize {
        self.0.hidden_size
    }

    fn num_parameters(&self) -> usize {
        self.0.num_parameters()
    }

    fn apply(
        &self,
        input: &Array3<f32>,
        args: SublayerArgs<'_>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let memory = args
            .memory
            .ok_or_else(|| anyhow::anyhow!("cross-attention called without encoder output"))?;
        self.0.forward(input, memory, args.bias, dropout)
    }
}
