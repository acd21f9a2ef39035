//! Batched beam search with length-normalised scoring.

use std::cmp::Ordering;

use anyhow::Result;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::activations::log_softmax_1d;
use crate::cache::BeamCache;
use crate::config::PAD_ID;
use crate::error::ModelError;


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamSearchConfig {
    pub vocab_size: usize,
    pub beam_size: usize,
    pub alpha: f32,
    pub max_decode_length: usize,
    pub eos_id: u32,
}

/// `((5 + length) / 6) ^ alpha`
pub fn length_penalty(length: usize, alpha: f32) -> f32 {
    ((5.0 + length as f32) / 6.0).powf(alpha)
}

#[derive(Clone, Debug)]
pub struct BeamHypothesis {
    /// Generated ids, without the initial id.
    pub tokens: Vec<u32>,
    /// Cumulative log-probability.
    pub score: f32,
}

impl BeamHypothesis {
    fn empty(score: f32) -> Self {
        Self {
            tokens: Vec::new(),
            score,
        }
    }

    fn is_dead(&self) -> bool {
        self.score == f32::NEG_INFINITY
    }

    pub fn normalized_score(&self, alpha: f32) -> f32 {
        self.score / length_penalty(self.tokens.len(), alpha)
    }
}

/// The best `num_beams` finished hypotheses of one example, best first.
struct FinishedHypotheses {
    hypotheses: Vec<(f32, BeamHypothesis)>,
    alpha: f32,
    num_beams: usize,
}

impl FinishedHypotheses {
    fn new(num_beams: usize, alpha: f32) -> Self {
        Self {
            hypotheses: Vec::with_capacity(num_beams),
            alpha,
            num_beams,
        }
    }

    fn add(&mut self, hypothesis: BeamHypothesis) {
        if hypothesis.is_dead() {
            return;
        }
        let score = hypothesis.normalized_score(self.alpha);
        if self.len() == self.num_beams && score <= self.worst_score() {
            return;
        }

        // Insert after existing equal scores so earlier hypotheses win ties.
        let pos = self
            .hypotheses
            .iter()
            .position(|(s, _)| *s < score)
            .unwrap_or(self.hypotheses.len());
        self.hypotheses.insert(pos, (score, hypothesis));
        self.hypotheses.truncate(self.num_beams);
    }

    fn len(&self) -> usize {
        self.hypotheses.len()
    }

    fn worst_score(&self) -> f32 {
        self.hypotheses
            .last()
            .map_or(f32::NEG_INFINITY, |(s, _)| *s)
    }

    fn best_score(&self) -> f32 {
        self.hypotheses
            .first()
            .map_or(f32::NEG_INFINITY, |(s, _)| *s)
    }

    fn best(&self) -> Option<&(f32, BeamHypothesis)> {
        self.hypotheses.first()
    }

    /// True once no alive beam can still beat the best finished one.
    ///
    /// Alive scores only fall as tokens are added, so the best an alive beam
    /// can reach is its current score under the penalty of the longest
    /// possible sequence.
    fn is_done(&self, best_alive_score: f32, max_length: usize) -> bool {
        if self.len() == 0 {
            return false;
        }
        let highest_attainable = best_alive_score / length_penalty(max_length, self.alpha);
        self.best_score() >= highest_attainable
    }
}

/// Search state of one batch example.
struct ExampleState {
    alive: Vec<BeamHypothesis>,
    finished: FinishedHypotheses,
    done: bool,
}

/// Survivors of one step for one example.
struct StepSelection {
    /// For each new beam, the index of the beam it extends.
    parents: Vec<usize>,
    tokens: Vec<u32>,
}

/// Best sequence of one example.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearchOutput {
    /// Generated ids, without the initial id, ending in EOS when `finished`.
    pub tokens: Vec<u32>,
    /// Length-normalised score if finished, cumulative log-probability otherwise.
    pub score: f32,
    pub finished: bool,
}

/// Top `k` entries of `log_probs` as `(token, log_prob)`, highest first,
/// lower ids first among equal values.
fn top_k_from_log_probs(log_probs: &Array1<f32>, k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(usize, f32)> = log_probs
        .iter()
        .enumerate()
        .filter(|(_, lp)| !lp.is_nan())
        .map(|(i, &lp)| (i, lp))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed.truncate(k);
    indexed
        .into_iter()
        .map(|(i, lp)| (i as u32, lp))
        .collect()
}

impl ExampleState {
    fn new(cfg: &BeamSearchConfig) -> Self {
        let alive = (0..cfg.beam_size)
            .map(|i| BeamHypothesis::empty(if i == 0 { 0.0 } else { f32::NEG_INFINITY }))
            .collect();
        Self {
            alive,
            finished: FinishedHypotheses::new(cfg.beam_size, cfg.alpha),
            done: false,
        }
    }

    /// Extends every alive beam by one token and keeps the best `beam_size`.
    fn step(&mut self, logits: ArrayView2<f32>, cfg: &BeamSearchConfig) -> StepSelection {
        let k = cfg.beam_size;

        if self.done {
            for beam in self.alive.iter_mut() {
                beam.score = f32::NEG_INFINITY;
            }
            return StepSelection {
                parents: (0..k).collect(),
                tokens: vec![PAD_ID; k],
            };
        }

        // Each beam contributes its top 2k, enough to fill k alive slots
        // even if k of the best candidates end in EOS.
        let mut candidates: Vec<(f32, usize, u32)> = Vec::with_capacity(2 * k * k);
        for (beam_idx, (beam, row)) in self.alive.iter().zip(logits.rows()).enumerate() {
            if beam.is_dead() {
                continue;
            }
            let log_probs = log_softmax_1d(&row.to_owned());
            for (token, lp) in top_k_from_log_probs(&log_probs, 2 * k) {
                candidates.push((beam.score + lp, beam_idx, token));
            }
        }
        // Stable: ties keep beam-major, then rank order.
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        candidates.truncate(2 * k);

        let mut alive = Vec::with_capacity(k);
        let mut parents = Vec::with_capacity(k);
        let mut tokens = Vec::with_capacity(k);

        for (rank, (score, parent, token)) in candidates.into_iter().enumerate() {
            let mut extended = self.alive[parent].tokens.clone();
            extended.push(token);
            let hypothesis = BeamHypothesis {
                tokens: extended,
                score,
            };

            if token == cfg.eos_id {
                if rank < k {
                    self.finished.add(hypothesis);
                }
            } else if alive.len() < k {
                alive.push(hypothesis);
                parents.push(parent);
                tokens.push(token);
            }
        }

        // Small vocabularies can leave slots empty.
        while alive.len() < k {
            let filler = alive
                .first()
                .map(|b| b.tokens.clone())
                .unwrap_or_default();
            alive.push(BeamHypothesis {
                tokens: filler,
                score: f32::NEG_INFINITY,
            });
            parents.push(parents.first().copied().unwrap_or(0));
            tokens.push(PAD_ID);
        }

        let best_alive = alive[0].score;
        self.done =
            best_alive == f32::NEG_INFINITY || self.finished.is_done(best_alive, cfg.max_decode_length);
        self.alive = alive;

        StepSelection { parents, tokens }
    }

    fn into_output(self) -> BeamSearchOutput {
        match self.finished.best() {
            Some((score, hypothesis)) => BeamSearchOutput {
                tokens: hypothesis.tokens.clone(),
                score: *score,
                finished: true,
            },
            None => {
                let best = self
                    .alive
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| BeamHypothesis::empty(f32::NEG_INFINITY));
                BeamSearchOutput {
                    tokens: best.tokens,
                    score: best.score,
                    finished: false,
                }
            }
        }
    }
}

/// Runs beam search for a batch of examples.
///
/// `initial_ids` holds one start id per example. `step_fn` is called once per
/// step with the ids so far (`[batch * beam_size, step + 1]`, beams of an
/// example in consecutive rows), the step index and the cache, and must
/// return next-token logits of shape `[batch * beam_size, vocab_size]`.
/// After every step the cache is reordered to follow the surviving beams.
pub fn sequence_beam_search<F, C>(
    mut step_fn: F,
    initial_ids: &[u32],
    cache: &mut C,
    cfg: &BeamSearchConfig,
) -> Result<Vec<BeamSearchOutput>>
where
    F: FnMut(&Array2<u32>, usize, &mut C) -> Result<Array2<f32>>,
    C: BeamCache,
{
    if cfg.beam_size == 0 || cfg.vocab_size == 0 {
        anyhow::bail!(ModelError::InvalidConfig(
            "beam search needs a positive beam size and vocabulary".to_string()
        ));
    }

    let batch = initial_ids.len();
    let k = cfg.beam_size;
    let rows = batch * k;

    let mut ids = Array2::from_shape_fn((rows, 1), |(r, _)| initial_ids[r / k]);
    let mut states: Vec<ExampleState> = (0..batch).map(|_| ExampleState::new(cfg)).collect();
    let mut steps_taken = 0;

    for step in 0..cfg.max_decode_length {
        let logits = step_fn(&ids, step, cache)?;
        if logits.dim() != (rows, cfg.vocab_size) {
            anyhow::bail!(ModelError::shape(
                "beam search logits",
                &[rows, cfg.vocab_size],
                logits.shape()
            ));
        }
        steps_taken = step + 1;

        let selections: Vec<StepSelection> = states
            .par_iter_mut()
            .enumerate()
            .map(|(e, state)| state.step(logits.slice(s![e * k..(e + 1) * k, ..]), cfg))
            .collect();

        let alive = states.iter().filter(|s| !s.done).count();
        log::debug!(
            "[BeamSearch] step {}: {}/{} examples still searching",
            step,
            alive,
            batch
        );
        if alive == 0 || step + 1 == cfg.max_decode_length {
            break;
        }

        let parent_rows: Vec<usize> = selections
            .iter()
            .enumerate()
            .flat_map(|(e, sel)| sel.parents.iter().map(move |&p| e * k + p))
            .collect();
        let next_tokens: Vec<u32> = selections
            .iter()
            .flat_map(|sel| sel.tokens.iter().copied())
            .collect();

        let mut next_ids = Array2::<u32>::zeros((rows, step + 2));
        next_ids
            .slice_mut(s![.., ..step + 1])
            .assign(&ids.select(Axis(0), &parent_rows));
        next_ids
            .column_mut(step + 1)
            .assign(&Array1::from(next_tokens));
        ids = next_ids;

        cache.reorder(&parent_rows)?;
    }

    let outputs: Vec<BeamSearchOutput> = states.into_iter().map(ExampleState::into_output).collect();

    let finished = outputs.iter().filter(|o| o.finished).count();
    if finished < outputs.len() {
        log::warn!(
            "[BeamSearch] {} of {} examples reached length {} without EOS",
            outputs.len() - finished,
            outputs.len(),
            cfg.max_decode_length
        );
    }
    log::info!(
        "[BeamSearch] {} steps, {}/{} examples finished",
        steps_taken,
        finished,
        outputs.len()
    );

    Ok(outputs)
}
