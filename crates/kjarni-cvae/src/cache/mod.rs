//! Incremental decoding state.

mod cpu;

pub use cpu::{DecoderCache, DecoderCacheParts, LayerKvCache};

use anyhow::Result;

/// State threaded through beam search that must follow the surviving beams.
///
/// After each step the search calls `reorder` with, for every new beam row,
/// the row of the beam it was extended from.
pub trait BeamCache {
    fn reorder(&mut self, parent_rows: &[usize]) -> Result<()>;

    /// Number of decoded positions currently held.
    fn seq_length(&self) -> usize;
}
