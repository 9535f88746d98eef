//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Messages
//! are JSON objects tagged by `type` (kebab-case) with camelCase fields.

use serde::{Serialize, Deserialize};

use crate::round::events::{PlayerEntry, RoundEvent, RoundSnapshot};
use crate::round::ledger::GuessError;
use crate::round::rating::RoundResult;
use crate::round::registry::{ParticipantStats, RegistryError};
use crate::round::state::{Competitor, Participant, ParticipantId, ParticipantMode, Phase};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Authenticate with a credential token.
    Authenticate {
        /// JWT from the auth provider.
        token: String,
    },

    /// Guess for the open round.
    #[serde(rename_all = "camelCase")]
    SubmitGuess {
        /// Round the guess is for.
        round_number: u64,
        /// Win probability of competitor A, 0-100.
        value: f64,
    },

    /// Request a mode for the next round.
    SetMode {
        /// Playing or Spectating.
        mode: ParticipantMode,
    },

    /// Liveness only.
    Heartbeat,

    /// Request a fresh `round-state`.
    SyncRequest,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot, sent on connect and resync.
    RoundState(RoundSnapshot),

    /// Once per second.
    #[serde(rename_all = "camelCase")]
    Tick {
        /// Live round.
        round_number: u64,
        /// Current phase.
        phase: Phase,
        /// Seconds left in the phase.
        time_remaining: u32,
    },

    /// A new round opened.
    #[serde(rename_all = "camelCase")]
    NewRound {
        /// New round number.
        round_number: u64,
        /// Always Guessing.
        phase: Phase,
        /// Guessing window.
        time_remaining: u32,
        /// First competitor.
        competitor_a: Competitor,
        /// Second competitor.
        competitor_b: Competitor,
        /// Participants eligible to guess.
        total_participants: usize,
    },

    /// Outcome and rating changes for a closed round.
    RoundResults(RoundResult),

    /// Participant list after a round boundary.
    PlayersUpdate {
        /// Every known participant.
        players: Vec<PlayerEntry>,
    },

    /// Reply to `authenticate`.
    #[serde(rename_all = "camelCase")]
    Authenticated {
        /// Whether the token was accepted.
        success: bool,
        /// Participant identity on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<ParticipantId>,
        /// Display name on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        /// Reason on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Reply to `submit-guess`.
    #[serde(rename_all = "camelCase")]
    GuessResult {
        /// Round in the request.
        round_number: u64,
        /// Whether the guess was counted.
        accepted: bool,
        /// Rejection kind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },

    /// Reply to `set-mode`.
    #[serde(rename_all = "camelCase")]
    ModeAck {
        /// Requested mode.
        mode: ParticipantMode,
        /// First round the mode applies to.
        effective_round: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Human-readable reason.
        reason: String,
    },
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create an error payload.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Guess for a round that is not open.
    StaleRound,
    /// Second guess in one round.
    AlreadySubmitted,
    /// Out-of-range guess, wrong mode, or unrequestable mode.
    InvalidValue,
    /// Token rejected.
    AuthenticationFailed,
    /// Action needs an authenticated connection.
    NotAuthenticated,
    /// Unparseable message.
    InvalidMessage,
    /// Identity not registered.
    UnknownParticipant,
    /// Server-side failure.
    InternalError,
}

impl From<&GuessError> for ErrorCode {
    fn from(err: &GuessError) -> Self {
        match err {
            GuessError::StaleRound { .. } => ErrorCode::StaleRound,
            GuessError::AlreadySubmitted => ErrorCode::AlreadySubmitted,
            GuessError::InvalidValue(_) => ErrorCode::InvalidValue,
        }
    }
}

impl From<&RegistryError> for ErrorCode {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::UnknownParticipant(_) => ErrorCode::UnknownParticipant,
            RegistryError::InvalidMode(_) => ErrorCode::InvalidValue,
        }
    }
}

// =============================================================================
// REQUEST/RESPONSE PAYLOADS
// =============================================================================

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// 1-based rank.
    pub rank: usize,
    /// Identity.
    pub identity: ParticipantId,
    /// Display name.
    pub display_name: String,
    /// Rating.
    pub rating: f64,
    /// Rounds with a counted guess.
    pub games_played: u32,
    /// Mean accuracy.
    pub mean_accuracy: Option<f64>,
}

impl LeaderboardEntry {
    /// Build rows from ranked participants.
    pub fn ranked(participants: &[Participant]) -> Vec<Self> {
        participants
            .iter()
            .enumerate()
            .map(|(i, p)| Self {
                rank: i + 1,
                identity: p.id,
                display_name: p.display_name.clone(),
                rating: p.rating,
                games_played: p.games_played,
                mean_accuracy: p.mean_accuracy(),
            })
            .collect()
    }
}

/// Per-user statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    /// Identity.
    pub identity: ParticipantId,
    /// Display name.
    pub display_name: String,
    /// Rating.
    pub rating: f64,
    /// Rounds with a counted guess.
    pub games_played: u32,
    /// Mean accuracy.
    pub mean_accuracy: Option<f64>,
    /// Best single-round accuracy.
    pub best_accuracy: Option<f64>,
    /// Leaderboard rank.
    pub rank: Option<usize>,
    /// Reported mode.
    pub mode: ParticipantMode,
    /// Pending mode.
    pub pending_mode: Option<ParticipantMode>,
    /// Live connection present.
    pub connected: bool,
}

impl From<&ParticipantStats> for UserStats {
    fn from(stats: &ParticipantStats) -> Self {
        let p = &stats.participant;
        Self {
            identity: p.id,
            display_name: p.display_name.clone(),
            rating: p.rating,
            games_played: p.games_played,
            mean_accuracy: p.mean_accuracy(),
            best_accuracy: p.best_accuracy,
            rank: stats.rank,
            mode: p.reported_mode(),
            pending_mode: p.pending_mode,
            connected: p.connected,
        }
    }
}

/// Reply to join/leave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeResponse {
    /// Identity.
    pub identity: ParticipantId,
    /// Mode in force now.
    pub current_mode: ParticipantMode,
    /// Mode from `effective_round`, if it differs.
    pub pending_mode: Option<ParticipantMode>,
    /// First round the pending mode applies to.
    pub effective_round: u64,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Broadcast message for a scheduler event. `Sealed` is internal.
    pub fn from_event(event: &RoundEvent) -> Option<Self> {
        match event {
            RoundEvent::Tick { round_number, phase, time_remaining } => Some(ServerMessage::Tick {
                round_number: *round_number,
                phase: *phase,
                time_remaining: *time_remaining,
            }),
            RoundEvent::Sealed { .. } => None,
            RoundEvent::Results(closed) => Some(ServerMessage::RoundResults(closed.result.clone())),
            RoundEvent::NewRound { round, total_participants } => Some(ServerMessage::NewRound {
                round_number: round.number,
                phase: round.phase,
                time_remaining: round.time_remaining,
                competitor_a: round.competitor_a.clone(),
                competitor_b: round.competitor_b.clone(),
                total_participants: *total_participants,
            }),
            RoundEvent::PlayersUpdate(players) => Some(ServerMessage::PlayersUpdate {
                players: players.clone(),
            }),
        }
    }

    /// Error message shorthand.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}
