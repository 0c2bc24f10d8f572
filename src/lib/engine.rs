//! Reference inference engine.
//!
//! [`MajorityVoteEngine`] produces per-column class predictions by
//! quality-weighted voting across the pileup lanes. It exists so the binary
//! and the test-suite can run the full pipeline without the learned model;
//! a trained model plugs in behind the same [`InferenceEngine`] trait.

use crate::features::EMPTY;
use crate::inference::{Device, InferenceBatch, InferenceEngine, InferenceError};

/// Minimum weight of a vote, so zero-quality bases still count.
const MIN_VOTE_WEIGHT: f32 = 0.01;

/// Symbol class of an encoded pileup cell, or `None` for unknown bases.
fn cell_class(base: u8) -> Option<usize> {
    match base.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        b'*' | b'#' => Some(4),
        _ => None,
    }
}

/// A CPU engine that calls each column by quality-weighted majority vote
/// over the target and its supports. Ties resolve to the target's symbol,
/// which keeps repeated runs byte-identical.
#[derive(Debug, Clone)]
pub struct MajorityVoteEngine {
    /// Budget handed out by the memory probe. The vote engine has no device
    /// memory to speak of, so this is a plain configuration value.
    batch_slots: usize,
}

impl MajorityVoteEngine {
    /// Default batch-slot budget reported by the probe.
    pub const DEFAULT_BATCH_SLOTS: usize = 64;

    #[must_use]
    pub fn new() -> Self {
        Self { batch_slots: Self::DEFAULT_BATCH_SLOTS }
    }

    /// Override the probed batch-slot budget.
    #[must_use]
    pub fn with_batch_slots(batch_slots: usize) -> Self {
        Self { batch_slots }
    }
}

impl Default for MajorityVoteEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for MajorityVoteEngine {
    fn run_batch(
        &self,
        _device: &Device,
        batch: &InferenceBatch,
    ) -> Result<Vec<Vec<u8>>, InferenceError> {
        let depth = batch.bases.shape()[2];
        let mut predictions = Vec::with_capacity(batch.lengths.len());
        for (item, &len) in batch.lengths.iter().enumerate() {
            let mut classes = Vec::with_capacity(len);
            for col in 0..len {
                let mut scores = [0.0f32; 5];
                for lane in 0..depth {
                    let base = batch.bases[[item, col, lane]];
                    if base == EMPTY {
                        continue;
                    }
                    if let Some(class) = cell_class(base) {
                        let qual = batch.quals[[item, col, lane]];
                        scores[class] += qual.max(MIN_VOTE_WEIGHT);
                    }
                }
                let target_class = cell_class(batch.bases[[item, col, 0]]).unwrap_or(4);
                let mut best = target_class;
                for (class, &score) in scores.iter().enumerate() {
                    if score > scores[best] {
                        best = class;
                    }
                }
                classes.push(best as u8);
            }
            predictions.push(classes);
        }
        Ok(predictions)
    }

    fn batch_slots_hint(&self, _device: &Device) -> usize {
        self.batch_slots
    }
}
