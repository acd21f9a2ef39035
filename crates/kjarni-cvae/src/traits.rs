//! The capability shared by every block the pre/post-processing wrapper can hold.

use anyhow::Result;
use ndarray::{Array2, Array3, Array4};

use crate::cache::LayerKvCache;
use crate::dropout::Dropout;

/// Optional per-call inputs of a sublayer.
///
/// Self-attention reads `bias` and `cache`, cross-attention reads `memory` and
/// `bias`, feed-forward reads `padding`. Anything a variant does not use is
/// ignored.
#[derive(Default)]
pub struct SublayerArgs<'a> {
    pub bias: Option<&'a Array4<f32>>,
    pub memory: Option<&'a Array3<f32>>,
    pub padding: Option<&'a Array2<f32>>,
    pub cache: Option<&'a mut LayerKvCache>,
}

impl<'a> SublayerArgs<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bias(mut self, bias: &'a Array4<f32>) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn memory(mut self, memory: &'a Array3<f32>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn padding(mut self, padding: Option<&'a Array2<f32>>) -> Self {
        self.padding = padding;
        self
    }

    pub fn cache(mut self, cache: Option<&'a mut LayerKvCache>) -> Self {
        self.cache = cache;
        self
    }
}

/// A block mapping `[batch, len, input_width]` to `[batch, len, output_width]`.
pub trait Sublayer {
    fn input_width(&self) -> usize;

    fn output_width(&self) -> usize;

    fn num_parameters(&self) -> usize {
        0
    }

    fn apply(
        &self,
        input: &Array3<f32>,
        args: SublayerArgs<'_>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>>;
}
