//! Round Events
//!
//! What the scheduler reports after each step. The network layer turns
//! these into broadcast messages; the driver acts on `Sealed`.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::round::rating::RoundResult;
use crate::round::state::{Competitor, Participant, ParticipantId, ParticipantMode, Phase, Round};

/// A participant as shown to clients.
///
/// `mode` is the reported mode, so a pending switch to spectating shows as
/// Leaving as soon as it is requested. The committed mode only changes at
/// the next `new-round`, and until then the participant still counts in
/// `total_participants` and may guess.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntry {
    /// Identity.
    pub identity: ParticipantId,
    /// Display name.
    pub display_name: String,
    /// Reported mode (Leaving while a switch to spectating is pending).
    pub mode: ParticipantMode,
    /// Current rating.
    pub rating: f64,
    /// Live connection present.
    pub connected: bool,
}

impl From<&Participant> for PlayerEntry {
    fn from(p: &Participant) -> Self {
        Self {
            identity: p.id,
            display_name: p.display_name.clone(),
            mode: p.reported_mode(),
            rating: p.rating,
            connected: p.connected,
        }
    }
}

/// A closed round and its result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedRound {
    /// Round record with the frozen outcome.
    pub round: Round,
    /// Ratings computed for the round.
    pub result: RoundResult,
}

/// Full view of the live round, sent on connect and on resync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    /// The live round.
    pub round: Round,
    /// Every known participant.
    pub players: Vec<PlayerEntry>,
    /// Participants eligible to guess this round.
    pub total_participants: usize,
    /// Guesses counted so far.
    pub guesses_received: usize,
    /// Server time the snapshot was taken.
    pub server_time: DateTime<Utc>,
}

/// Scheduler output for one step.
#[derive(Clone, Debug)]
pub enum RoundEvent {
    /// One second elapsed.
    Tick {
        /// Live round.
        round_number: u64,
        /// Phase after the tick.
        phase: Phase,
        /// Seconds left in that phase.
        time_remaining: u32,
    },
    /// Guessing closed; the outcome must now be resolved.
    Sealed {
        /// Sealed round.
        round_number: u64,
        /// First competitor.
        competitor_a: Competitor,
        /// Second competitor.
        competitor_b: Competitor,
        /// Guesses counted.
        guesses: usize,
    },
    /// Outcome frozen and ratings applied.
    Results(ClosedRound),
    /// A new round opened in Guessing.
    NewRound {
        /// The new round.
        round: Round,
        /// Participants eligible to guess.
        total_participants: usize,
    },
    /// Participant list after pending modes were committed.
    PlayersUpdate(Vec<PlayerEntry>),
}
