//! Client Projection
//!
//! Read-only view of the arena built from server messages in arrival order.
//! Used by Rust clients and by tests that watch the broadcast stream. The
//! server stays authoritative: the projection never predicts phase changes,
//! it only counts down between ticks.

use std::time::Duration;

use crate::network::protocol::ServerMessage;
use crate::round::events::PlayerEntry;
use crate::round::rating::RoundResult;
use crate::round::state::{Competitor, ParticipantId, ParticipantMode, Phase};

/// Countdown to show `elapsed` after a tick that reported `remaining`.
///
/// Never below zero.
pub fn displayed_countdown(remaining: u32, elapsed: Duration) -> u32 {
    let elapsed = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX);
    remaining.saturating_sub(elapsed)
}

/// Client-side view of the live round.
#[derive(Debug, Clone, Default)]
pub struct RoundProjection {
    /// Live round, once known.
    pub round_number: Option<u64>,
    /// Phase as of the last message.
    pub phase: Option<Phase>,
    /// Seconds left as of the last message.
    pub time_remaining: u32,
    /// Current matchup.
    pub competitors: Option<(Competitor, Competitor)>,
    /// Participant list.
    pub players: Vec<PlayerEntry>,
    /// Participants eligible to guess.
    pub total_participants: usize,
    /// Most recent round result.
    pub last_result: Option<RoundResult>,
    /// This client's identity after authentication.
    pub identity: Option<ParticipantId>,
    /// Mode requested by this client and the round it applies from.
    pub pending_mode: Option<(ParticipantMode, u64)>,
    /// Whether the last guess was accepted.
    pub guess_accepted: Option<bool>,
    /// Set once the server announced shutdown.
    pub shut_down: bool,
}

impl RoundProjection {
    /// Empty projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one server message.
    pub fn apply(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::RoundState(snapshot) => {
                let round = &snapshot.round;
                self.round_number = Some(round.number);
                self.phase = Some(round.phase);
                self.time_remaining = round.time_remaining;
                self.competitors = Some((round.competitor_a.clone(), round.competitor_b.clone()));
                self.players = snapshot.players.clone();
                self.total_participants = snapshot.total_participants;
            }
            ServerMessage::Tick { round_number, phase, time_remaining } => {
                if self.is_stale(*round_number) {
                    return;
                }
                self.round_number = Some(*round_number);
                self.phase = Some(*phase);
                self.time_remaining = *time_remaining;
            }
            ServerMessage::NewRound {
                round_number,
                phase,
                time_remaining,
                competitor_a,
                competitor_b,
                total_participants,
            } => {
                if self.is_stale(*round_number) {
                    return;
                }
                self.round_number = Some(*round_number);
                self.phase = Some(*phase);
                self.time_remaining = *time_remaining;
                self.competitors = Some((competitor_a.clone(), competitor_b.clone()));
                self.total_participants = *total_participants;
                self.guess_accepted = None;
                if matches!(self.pending_mode, Some((_, from)) if from <= *round_number) {
                    self.pending_mode = None;
                }
            }
            ServerMessage::RoundResults(result) => {
                let newer = self
                    .last_result
                    .as_ref()
                    .map_or(true, |last| result.round_number >= last.round_number);
                if newer {
                    self.last_result = Some(result.clone());
                }
            }
            ServerMessage::PlayersUpdate { players } => {
                self.players = players.clone();
            }
            ServerMessage::Authenticated { success: true, identity, .. } => {
                self.identity = *identity;
            }
            ServerMessage::GuessResult { accepted, .. } => {
                self.guess_accepted = Some(*accepted);
            }
            ServerMessage::ModeAck { mode, effective_round } => {
                self.pending_mode = Some((*mode, *effective_round));
            }
            ServerMessage::Shutdown { .. } => {
                self.shut_down = true;
            }
            ServerMessage::Authenticated { .. } | ServerMessage::Error(_) => {}
        }
    }

    /// Countdown to show `elapsed` after the last update.
    pub fn countdown(&self, elapsed: Duration) -> u32 {
        displayed_countdown(self.time_remaining, elapsed)
    }

    /// This client's rating line in the last result.
    pub fn my_result(&self) -> Option<&crate::round::rating::ParticipantResult> {
        let me = self.identity?;
        self.last_result.as_ref()?.for_participant(&me)
    }

    fn is_stale(&self, round_number: u64) -> bool {
        matches!(self.round_number, Some(current) if round_number < current)
    }
}
