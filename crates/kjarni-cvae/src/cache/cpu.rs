//! CPU key/value cache for the decoder stack.

use anyhow::Result;
use ndarray::{s, Array2, Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;

use super::BeamCache;
use crate::error::ModelError;

/// Preallocated key/value slabs for one decoder self-attention layer.
#[derive(Debug, Clone)]
pub struct LayerKvCache {
    layer: usize,
    keys: Array3<f32>,
    values: Array3<f32>,
    len: usize,
}

impl LayerKvCache {
    pub fn new(layer: usize, batch_size: usize, capacity: usize, hidden_size: usize) -> Self {
        Self {
            layer,
            keys: Array3::zeros((batch_size, capacity, hidden_size)),
            values: Array3::zeros((batch_size, capacity, hidden_size)),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.keys.shape()[1]
    }

    pub fn batch_size(&self) -> usize {
        self.keys.shape()[0]
    }

    /// Writes `new_k`/`new_v` (`[batch, n, hidden]`) after the filled prefix.
    pub fn append(&mut self, new_k: &Array3<f32>, new_v: &Array3<f32>) -> Result<()> {
        if new_k.shape() != new_v.shape() {
            anyhow::bail!(ModelError::shape("LayerKvCache value", new_k.shape(), new_v.shape()));
        }
        let (batch, new_tokens, hidden) = new_k.dim();
        if batch != self.batch_size() || hidden != self.keys.shape()[2] {
            anyhow::bail!(ModelError::shape(
                "LayerKvCache append",
                &[self.batch_size(), new_tokens, self.keys.shape()[2]],
                new_k.shape()
            ));
        }

        let end = self.len + new_tokens;
        if end > self.capacity() {
            anyhow::bail!(ModelError::CacheOverflow {
                layer: self.layer,
                len: end,
                capacity: self.capacity(),
            });
        }

        self.keys.slice_mut(s![.., self.len..end, ..]).assign(new_k);
        self.values.slice_mut(s![.., self.len..end, ..]).assign(new_v);
        self.len = end;
        Ok(())
    }

    pub fn keys(&self) -> ArrayView3<'_, f32> {
        self.keys.slice(s![.., 0..self.len, ..])
    }

    pub fn values(&self) -> ArrayView3<'_, f32> {
        self.values.slice(s![.., 0..self.len, ..])
    }

    pub fn reorder(&mut self, rows: &[usize]) -> Result<()> {
        check_rows(rows, self.batch_size())?;
        let len = self.len;
        let keys = self.keys.slice(s![.., 0..len, ..]).select(Axis(0), rows);
        let values = self.values.slice(s![.., 0..len, ..]).select(Axis(0), rows);
        self.keys.slice_mut(s![.., 0..len, ..]).assign(&keys);
        self.values.slice_mut(s![.., 0..len, ..]).assign(&values);
        Ok(())
    }
}

/// Everything one decode call needs between steps.
///
/// Holds a [`LayerKvCache`] per decoder layer plus the fixed encoder output,
/// encoder-decoder bias and latent sample, all laid out with one row per
/// (example, beam).
#[derive(Debug, Clone)]
pub struct DecoderCache {
    layers: Vec<LayerKvCache>,
    encoder_outputs: Array3<f32>,
    encoder_decoder_bias: Array4<f32>,
    latent_sample: Array2<f32>,
}

/// Borrowed view of a cache split into its mutable and fixed parts.
pub struct DecoderCacheParts<'a> {
    pub layers: &'a mut [LayerKvCache],
    pub encoder_outputs: &'a Array3<f32>,
    pub encoder_decoder_bias: &'a Array4<f32>,
    pub latent_sample: &'a Array2<f32>,
}

impl DecoderCache {
    pub fn new(
        num_layers: usize,
        capacity: usize,
        encoder_outputs: Array3<f32>,
        encoder_decoder_bias: Array4<f32>,
        latent_sample: Array2<f32>,
    ) -> Result<Self> {
        let (batch, _, hidden) = encoder_outputs.dim();
        if encoder_decoder_bias.shape()[0] != batch {
            anyhow::bail!(ModelError::shape(
                "DecoderCache encoder-decoder bias",
                &[batch],
                &[encoder_decoder_bias.shape()[0]]
            ));
        }
        if latent_sample.nrows() != batch {
            anyhow::bail!(ModelError::shape(
                "DecoderCache latent sample",
                &[batch],
                &[latent_sample.nrows()]
            ));
        }

        let layers = (0..num_layers)
            .map(|layer| LayerKvCache::new(layer, batch, capacity, hidden))
            .collect();

        Ok(Self {
            layers,
            encoder_outputs,
            encoder_decoder_bias,
            latent_sample,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn batch_size(&self) -> usize {
        self.encoder_outputs.shape()[0]
    }

    pub fn parts_mut(&mut self) -> DecoderCacheParts<'_> {
        DecoderCacheParts {
            layers: &mut self.layers,
            encoder_outputs: &self.encoder_outputs,
            encoder_decoder_bias: &self.encoder_decoder_bias,
            latent_sample: &self.latent_sample,
        }
    }
}

impl BeamCache for DecoderCache {
    /// Only the key/value slabs move. Beams never change example, so the
    /// encoder rows, bias rows and latent rows stay valid as they are.
    fn reorder(&mut self, parent_rows: &[usize]) -> Result<()> {
        check_rows(parent_rows, self.batch_size())?;
        self.layers
            .par_iter_mut()
            .try_for_each(|layer| layer.reorder(parent_rows))
    }

    fn seq_length(&self) -> usize {
        self.layers.first().map_or(0, |l| l.len())
    }
}

fn check_rows(rows: &[usize], batch: usize) -> Result<()> {
    if rows.len() != batch {
        anyhow::bail!(ModelError::shape("cache reorder", &[batch], &[rows.len()]));
    }
    if let Some(&bad) = rows.iter().find(|&&r| r >= batch) {
        anyhow::bail!("cache reorder index {} out of bounds for {} rows", bad, batch);
    }
    Ok(())
}
