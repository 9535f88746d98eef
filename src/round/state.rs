//! Round and Participant State
//!
//! Plain data owned by the scheduler. Collections keyed by participant use
//! BTreeMap so iteration (and therefore broadcast order) is stable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;

// =============================================================================
// PARTICIPANT ID
// =============================================================================

/// Participant identifier (16 bytes, hex on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ParticipantId(pub [u8; 16]);

impl ParticipantId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Error parsing a participant id from hex.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("participant id must be 32 hex characters")]
pub struct IdParseError;

impl FromStr for ParticipantId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdParseError)?;
        let id: [u8; 16] = bytes.try_into().map_err(|_| IdParseError)?;
        Ok(Self(id))
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = IdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// =============================================================================
// PHASE AND MODE
// =============================================================================

/// Round phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Accepting guesses.
    Guessing,
    /// Outcome revealed, no guesses accepted.
    Results,
}

/// Participant mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantMode {
    /// Eligible to guess.
    Playing,
    /// Observe only.
    Spectating,
    /// Playing this round, spectating from the next one.
    Leaving,
}

impl ParticipantMode {
    /// Whether a participant in this mode may submit a guess.
    pub fn can_guess(self) -> bool {
        matches!(self, ParticipantMode::Playing | ParticipantMode::Leaving)
    }
}

// =============================================================================
// COMPETITORS AND ROUNDS
// =============================================================================

/// One side of a matchup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competitor {
    /// Roster index.
    pub id: u32,
    /// Display name.
    pub name: String,
}

impl Competitor {
    /// Create a competitor.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

/// The live round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    /// Round number, starting at 1.
    pub number: u64,
    /// Current phase.
    pub phase: Phase,
    /// When the guessing window opened.
    pub opens_at: DateTime<Utc>,
    /// Seconds left in the current phase.
    pub time_remaining: u32,
    /// First competitor.
    pub competitor_a: Competitor,
    /// Second competitor.
    pub competitor_b: Competitor,
    /// Win probability of A in [0, 100]; set once at resolution.
    pub actual_outcome: Option<f64>,
}

impl Round {
    /// Open a round in the guessing phase.
    pub fn open(
        number: u64,
        pair: (Competitor, Competitor),
        guess_duration: u32,
        opens_at: DateTime<Utc>,
    ) -> Self {
        Self {
            number,
            phase: Phase::Guessing,
            opens_at,
            time_remaining: guess_duration,
            competitor_a: pair.0,
            competitor_b: pair.1,
            actual_outcome: None,
        }
    }

    /// Whether the outcome has been frozen.
    pub fn is_resolved(&self) -> bool {
        self.actual_outcome.is_some()
    }
}

// =============================================================================
// PARTICIPANT
// =============================================================================

/// A registered participant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Identity.
    pub id: ParticipantId,
    /// Display name from the auth token.
    pub display_name: String,
    /// Mode in force for the current round.
    pub current_mode: ParticipantMode,
    /// Requested mode, applied at the next round boundary.
    #[serde(default)]
    pub pending_mode: Option<ParticipantMode>,
    /// Skill rating.
    pub rating: f64,
    /// Rounds with a counted guess.
    pub games_played: u32,
    /// Sum of accuracy scores over counted guesses.
    #[serde(default)]
    pub total_accuracy: f64,
    /// Best single-round accuracy.
    #[serde(default)]
    pub best_accuracy: Option<f64>,
    /// At least one live connection.
    #[serde(skip)]
    pub connected: bool,
}

impl Participant {
    /// Create a spectating participant.
    pub fn new(id: ParticipantId, display_name: impl Into<String>, rating: f64) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            current_mode: ParticipantMode::Spectating,
            pending_mode: None,
            rating,
            games_played: 0,
            total_accuracy: 0.0,
            best_accuracy: None,
            connected: false,
        }
    }

    /// Mode shown to clients.
    ///
    /// A playing participant with a pending switch to spectating is reported
    /// as `Leaving`; the stored mode changes only at the round boundary.
    pub fn reported_mode(&self) -> ParticipantMode {
        match (self.current_mode, self.pending_mode) {
            (ParticipantMode::Playing, Some(ParticipantMode::Spectating)) => ParticipantMode::Leaving,
            (mode, _) => mode,
        }
    }

    /// Whether this participant may guess in the open round.
    pub fn can_guess(&self) -> bool {
        self.current_mode.can_guess()
    }

    /// Mean accuracy over counted guesses.
    pub fn mean_accuracy(&self) -> Option<f64> {
        if self.games_played == 0 {
            None
        } else {
            Some(self.total_accuracy / self.games_played as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_hex_roundtrip() {
        let id = ParticipantId::new([0xab; 16]);
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<ParticipantId>().unwrap(), id);
        assert_eq!(id.short(), "abababab");
    }

    #[test]
    fn test_participant_id_rejects_bad_hex() {
        assert!("xyz".parse::<ParticipantId>().is_err());
        assert!("abcd".parse::<ParticipantId>().is_err());
    }

    #[test]
    fn test_participant_id_serializes_as_string() {
        let id = ParticipantId::new([1; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01010101010101010101010101010101\"");
        let back: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_mode_guess_eligibility() {
        assert!(ParticipantMode::Playing.can_guess());
        assert!(ParticipantMode::Leaving.can_guess());
        assert!(!ParticipantMode::Spectating.can_guess());
    }

    #[test]
    fn test_reported_mode_shows_leaving() {
        let mut p = Participant::new(ParticipantId::new([1; 16]), "ash", 1000.0);
        assert_eq!(p.reported_mode(), ParticipantMode::Spectating);

        p.current_mode = ParticipantMode::Playing;
        p.pending_mode = Some(ParticipantMode::Spectating);
        assert_eq!(p.reported_mode(), ParticipantMode::Leaving);
        assert_eq!(p.current_mode, ParticipantMode::Playing);
        assert!(p.can_guess());
    }

    #[test]
    fn test_mean_accuracy() {
        let mut p = Participant::new(ParticipantId::new([1; 16]), "ash", 1000.0);
        assert_eq!(p.mean_accuracy(), None);
        p.games_played = 2;
        p.total_accuracy = 150.0;
        assert_eq!(p.mean_accuracy(), Some(75.0));
    }
}
