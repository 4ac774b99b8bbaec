//! Turning an expert/amateur pair of next-token distributions into one token.
//!
//! For every vocabulary entry `i` the contrast score is
//! `expert[i] - weight * amateur[i]`, clamped from below to a small positive
//! floor. The token with the highest score wins; ties go to the lowest index.
//! The clamp keeps the maximum well defined when the weighted amateur
//! outweighs the expert everywhere. It is not a renormalization, so scores do
//! not sum to one.

use super::Token;
use crate::core::config::DEFAULT_MIN_PROBABILITY_FLOOR;
use crate::core::{DecodingConfig, DecodingError};

/// The outcome of one combination step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub token: Token,
    /// Contrast score of the chosen token.
    pub score: f32,
    /// Every score sat at the floor, so the choice came from index order alone.
    pub degenerate: bool,
}

/// Pure, deterministic combiner of two aligned distributions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistributionCombiner {
    weight: f32,
    floor: f32,
}

impl DistributionCombiner {
    /// `weight` and `floor` are trusted; [`DecodingConfig`] validates them.
    pub fn new(weight: f32, floor: f32) -> Self {
        Self { weight, floor }
    }

    pub fn from_config(config: &DecodingConfig) -> Self {
        Self::new(config.weight(), config.min_probability_floor())
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Pick the next token from the expert and amateur distributions.
    pub fn combine(&self, expert: &[f32], amateur: &[f32]) -> Result<Selection, DecodingError> {
        check_vocabularies(expert, amateur)?;
        Ok(self.select(
            expert
                .iter()
                .zip(amateur)
                .map(|(&e, &a)| e - self.weight * a),
        ))
    }

    /// Pick the next token from the expert alone. Equivalent to [`combine`]
    /// with a zero weight.
    ///
    /// [`combine`]: Self::combine
    pub fn greedy(&self, expert: &[f32]) -> Result<Selection, DecodingError> {
        if expert.is_empty() {
            return Err(DecodingError::EmptyVocabulary);
        }
        Ok(self.select(expert.iter().copied()))
    }

    /// The clamped contrast scores, as a fresh vector.
    pub fn contrast(&self, expert: &[f32], amateur: &[f32]) -> Result<Vec<f32>, DecodingError> {
        check_vocabularies(expert, amateur)?;
        Ok(expert
            .iter()
            .zip(amateur)
            .map(|(&e, &a)| self.clamp(e - self.weight * a))
            .collect())
    }

    // `f32::max` returns the floor for NaN, so a NaN score can never win.
    fn clamp(&self, score: f32) -> f32 {
        score.max(self.floor)
    }

    fn select(&self, scores: impl Iterator<Item = f32>) -> Selection {
        let mut best_index = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        let mut degenerate = true;

        for (index, raw) in scores.enumerate() {
            let score = self.clamp(raw);
            if score > self.floor {
                degenerate = false;
            }
            // Strictly greater keeps the lowest index on ties.
            if score > best_score {
                best_index = index;
                best_score = score;
            }
        }

        Selection {
            token: best_index as Token,
            score: best_score,
            degenerate,
        }
    }
}

impl Default for DistributionCombiner {
    fn default() -> Self {
        Self::from_config(&DecodingConfig::default())
    }
}

/// Contrast `expert` against `amateur` with the default floor and return the
/// selected token.
pub fn combine(expert: &[f32], amateur: &[f32], weight: f32) -> Result<Token, DecodingError> {
    DistributionCombiner::new(weight, DEFAULT_MIN_PROBABILITY_FLOOR)
        .combine(expert, amateur)
        .map(|selection| selection.token)
}

fn check_vocabularies(expert: &[f32], amateur: &[f32]) -> Result<(), DecodingError> {
    if expert.len() != amateur.len() {
        return Err(DecodingError::VocabularyMismatch {
            expert: expert.len(),
            amateur: amateur.len(),
        });
    }
    if expert.is_empty() {
        return Err(DecodingError::EmptyVocabulary);
    }
    Ok(())
}
