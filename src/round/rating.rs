//! Field-Relative Rating
//!
//! Each guess is scored by closeness to the resolved outcome. A
//! participant's expected performance is the field's mean accuracy, so
//! the rating change is
//!
//! ```text
//! delta = clamp(K * (accuracy - field_mean) / n, -max_delta, +max_delta)
//! ```
//!
//! which sums to zero across the field whenever no delta is clamped.
//! Participants without a counted guess are not part of the field.

use std::cmp::Ordering;

use serde::{Serialize, Deserialize};

use crate::round::ledger::Guess;
use crate::round::state::ParticipantId;

/// Rating constants. Tunable, not part of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingConfig {
    /// Scale applied to the accuracy gap.
    pub k_factor: f64,
    /// Largest absolute change in one round.
    pub max_delta: f64,
    /// Rating assigned on registration.
    pub initial_rating: f64,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            k_factor: 4.0,
            max_delta: 40.0,
            initial_rating: 1000.0,
        }
    }
}

/// Accuracy of a guess on a 0-100 scale.
#[inline]
pub fn accuracy_score(guess: f64, actual: f64) -> f64 {
    (100.0 - (guess - actual).abs()).clamp(0.0, 100.0)
}

/// One participant's line in the round result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantResult {
    /// Who guessed.
    #[serde(rename = "identity")]
    pub participant: ParticipantId,
    /// The guess.
    pub guess: f64,
    /// 100 - |guess - outcome|.
    pub accuracy_score: f64,
    /// Rating change for this round.
    pub rating_delta: f64,
    /// Rating after the change.
    pub rating_after: f64,
    /// 1-based rank (accuracy, then earliest submission).
    pub rank: u32,
}

/// Result of one closed round. Computed once; immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResult {
    /// Round number.
    pub round_number: u64,
    /// Resolved outcome.
    pub actual_outcome: f64,
    /// Mean accuracy of the field (None when nobody guessed).
    pub field_mean_accuracy: Option<f64>,
    /// Per-participant lines in rank order.
    pub results: Vec<ParticipantResult>,
}

impl RoundResult {
    /// Find one participant's line.
    pub fn for_participant(&self, id: &ParticipantId) -> Option<&ParticipantResult> {
        self.results.iter().find(|r| r.participant == *id)
    }

    /// Sum of all rating deltas.
    pub fn delta_sum(&self) -> f64 {
        self.results.iter().map(|r| r.rating_delta).sum()
    }
}

/// Rating engine.
#[derive(Debug, Clone, Default)]
pub struct RatingEngine {
    config: RatingConfig,
}

impl RatingEngine {
    /// Create an engine with the given constants.
    pub fn new(config: RatingConfig) -> Self {
        Self { config }
    }

    /// Active constants.
    pub fn config(&self) -> &RatingConfig {
        &self.config
    }

    /// Rating change for one participant.
    pub fn delta(&self, accuracy: f64, field_mean: f64, field_size: usize) -> f64 {
        if field_size == 0 {
            return 0.0;
        }
        let raw = self.config.k_factor * (accuracy - field_mean) / field_size as f64;
        raw.clamp(-self.config.max_delta, self.config.max_delta)
    }

    /// Score a sealed round.
    ///
    /// `rating_of` supplies each guesser's rating before the round.
    pub fn rate<F>(
        &self,
        round_number: u64,
        actual_outcome: f64,
        guesses: &[Guess],
        rating_of: F,
    ) -> RoundResult
    where
        F: Fn(&ParticipantId) -> f64,
    {
        let mut scored: Vec<(&Guess, f64)> = guesses
            .iter()
            .map(|g| (g, accuracy_score(g.value, actual_outcome)))
            .collect();

        scored.sort_by(|(ga, a), (gb, b)| {
            b.total_cmp(a)
                .then_with(|| ga.submitted_at.cmp(&gb.submitted_at))
                .then_with(|| ga.sequence.cmp(&gb.sequence))
                .then(Ordering::Equal)
        });

        let field_size = scored.len();
        let field_mean_accuracy = if field_size == 0 {
            None
        } else {
            Some(scored.iter().map(|(_, a)| a).sum::<f64>() / field_size as f64)
        };
        let mean = field_mean_accuracy.unwrap_or(0.0);

        let results = scored
            .into_iter()
            .enumerate()
            .map(|(i, (guess, accuracy))| {
                let rating_delta = self.delta(accuracy, mean, field_size);
                ParticipantResult {
                    participant: guess.participant,
                    guess: guess.value,
                    accuracy_score: accuracy,
                    rating_delta,
                    rating_after: rating_of(&guess.participant) + rating_delta,
                    rank: (i + 1) as u32,
                }
            })
            .collect();

        RoundResult {
            round_number,
            actual_outcome,
            field_mean_accuracy,
            results,
        }
    }
}
