//! Embedding table shared between the input lookup and the output projection.

use std::sync::Arc;

use anyhow::Result;
use ndarray::{Array2, Array3, Axis};
use rand::Rng;

use crate::config::PAD_ID;
use crate::error::ModelError;
use crate::init::embedding_table;
use crate::utils::linear_algebra::matmul_3d_2d;


/// Tied embedding / softmax weights of shape `[vocab_size, hidden_size]`.
#[derive(Clone)]
pub struct SharedEmbeddings {
    table: Arc<Array2<f32>>,
    scale: f32,
}

impl SharedEmbeddings {
    pub fn new(table: Array2<f32>) -> Self {
        let scale = (table.ncols() as f32).sqrt();
        Self {
            table: Arc::new(table),
            scale,
        }
    }

    pub fn random<R: Rng + ?Sized>(vocab_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Self::new(embedding_table(vocab_size, hidden_size, rng))
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn hidden_size(&self) -> usize {
        self.table.ncols()
    }

    pub fn table(&self) -> &Array2<f32> {
        &self.table
    }

    /// `[batch, len]` ids to `[batch, len, hidden]` vectors.
    ///
    /// Rows are scaled by `sqrt(hidden_size)`; padding ids embed to zero.
    pub fn embed(&self, ids: &Array2<u32>) -> Result<Array3<f32>> {
        let (batch, len) = ids.dim();
        let hidden = self.hidden_size();
        let mut out = Array3::<f32>::zeros((batch, len, hidden));

        for ((b, t), &id) in ids.indexed_iter() {
            if id == PAD_ID {
                continue;
            }
            let idx = id as usize;
            if idx >= self.vocab_size() {
                anyhow::bail!(ModelError::InvalidInput(format!(
                    "token id {} out of range for vocab_size {}",
                    id,
                    self.vocab_size()
                )));
            }
            let mut row = out.index_axis_mut(Axis(0), b);
            let mut slot = row.index_axis_mut(Axis(0), t);
            slot.assign(&self.table.row(idx));
            slot *= self.scale;
        }
        Ok(out)
    }

    /// `[batch, len, hidden]` to `[batch, len, vocab]` logits through the transposed table.
    pub fn linear(&self, hidden_states: &Array3<f32>) -> Result<Array3<f32>> {
        matmul_3d_2d(hidden_states, &self.table.t())
    }
}
