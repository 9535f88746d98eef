//! Guess Ledger
//!
//! Append-only record of at most one guess per participant for the open
//! round. Sealing flips the ledger to read-only; the caller serializes
//! `submit` and `seal` (the scheduler holds both behind one lock), so a
//! submission is either counted before the seal or rejected after it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::round::state::{ParticipantId, ParticipantMode};

/// Lowest accepted guess.
pub const MIN_GUESS: f64 = 0.0;
/// Highest accepted guess.
pub const MAX_GUESS: f64 = 100.0;

/// A counted guess.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Guess {
    /// Round the guess belongs to.
    pub round_number: u64,
    /// Who guessed.
    pub participant: ParticipantId,
    /// Guessed win probability for competitor A, in [0, 100].
    pub value: f64,
    /// Server receive time.
    pub submitted_at: DateTime<Utc>,
    /// Arrival order within the round.
    pub sequence: u64,
}

/// Why a guess value was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidGuess {
    /// Value outside [0, 100] or not a number.
    #[error("value must be between 0 and 100")]
    OutOfRange,
    /// Participant is not playing this round.
    #[error("only playing participants may guess")]
    NotPlaying,
}

/// Guess submission errors. Surfaced only to the submitting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuessError {
    /// Round is closed, not yet open, or was never this number.
    #[error("round {requested} is not open (open round: {open})")]
    StaleRound {
        /// Round number in the request.
        requested: u64,
        /// Round currently accepting guesses (or just sealed).
        open: u64,
    },
    /// Participant already has a guess for this round.
    #[error("guess already submitted for this round")]
    AlreadySubmitted,
    /// Out-of-range value or wrong mode.
    #[error("invalid guess: {0}")]
    InvalidValue(InvalidGuess),
}

/// Ledger misuse by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// `seal` called on an already-sealed ledger.
    #[error("ledger for round {0} is already sealed")]
    AlreadySealed(u64),
}

/// Per-round guess ledger.
#[derive(Debug, Clone)]
pub struct GuessLedger {
    round_number: u64,
    entries: BTreeMap<ParticipantId, Guess>,
    next_sequence: u64,
    sealed: bool,
}

impl GuessLedger {
    /// Open an empty ledger for a round.
    pub fn open(round_number: u64) -> Self {
        Self {
            round_number,
            entries: BTreeMap::new(),
            next_sequence: 0,
            sealed: false,
        }
    }

    /// Round this ledger records.
    pub fn round_number(&self) -> u64 {
        self.round_number
    }

    /// Whether the ledger is read-only.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Record a guess.
    ///
    /// Checks run in order: stale round, duplicate, value/mode.
    pub fn submit(
        &mut self,
        round_number: u64,
        participant: ParticipantId,
        mode: ParticipantMode,
        value: f64,
        submitted_at: DateTime<Utc>,
    ) -> Result<&Guess, GuessError> {
        if self.sealed || round_number != self.round_number {
            return Err(GuessError::StaleRound {
                requested: round_number,
                open: self.round_number,
            });
        }

        if self.entries.contains_key(&participant) {
            return Err(GuessError::AlreadySubmitted);
        }

        if !value.is_finite() || !(MIN_GUESS..=MAX_GUESS).contains(&value) {
            return Err(GuessError::InvalidValue(InvalidGuess::OutOfRange));
        }

        if !mode.can_guess() {
            return Err(GuessError::InvalidValue(InvalidGuess::NotPlaying));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let guess = Guess {
            round_number,
            participant,
            value,
            submitted_at,
            sequence,
        };
        Ok(self.entries.entry(participant).or_insert(guess))
    }

    /// Seal the ledger and return its guesses in arrival order.
    pub fn seal(&mut self) -> Result<Vec<Guess>, LedgerError> {
        if self.sealed {
            return Err(LedgerError::AlreadySealed(self.round_number));
        }
        self.sealed = true;
        Ok(self.guesses())
    }

    /// Guesses in arrival order.
    pub fn guesses(&self) -> Vec<Guess> {
        let mut guesses: Vec<Guess> = self.entries.values().cloned().collect();
        guesses.sort_by_key(|g| g.sequence);
        guesses
    }

    /// Look up one participant's guess.
    pub fn get(&self, participant: &ParticipantId) -> Option<&Guess> {
        self.entries.get(participant)
    }

    /// Number of counted guesses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No guesses yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
