//! Round Scheduler
//!
//! The single writer of round truth. Owns the live round, its ledger, the
//! participant registry and the rating engine, and moves them through
//!
//! ```text
//! Guessing(D_g) --seal--> Results(D_r) --commit modes--> Guessing(N+1)
//! ```
//!
//! one tick at a time. Everything here is synchronous; the async driver
//! holds the scheduler behind a single lock and performs the outcome
//! resolution between `Sealed` and `complete_round`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::round::events::{ClosedRound, PlayerEntry, RoundEvent, RoundSnapshot};
use crate::round::ledger::{Guess, GuessError, GuessLedger};
use crate::round::rating::RatingEngine;
use crate::round::registry::{ModeChange, ParticipantRegistry, RegistryError};
use crate::round::resolver::FALLBACK_OUTCOME;
use crate::round::selector::CompetitorSelector;
use crate::round::state::{Participant, ParticipantId, ParticipantMode, Phase, Round};

/// Phase timing and history settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundConfig {
    /// Guessing window in seconds.
    pub guess_secs: u32,
    /// Results display in seconds.
    pub results_secs: u32,
    /// Closed rounds kept in memory.
    pub history_len: usize,
    /// Outcome forced when a round reaches its boundary unresolved.
    pub fallback_outcome: f64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            guess_secs: 30,
            results_secs: 10,
            history_len: 256,
            fallback_outcome: FALLBACK_OUTCOME,
        }
    }
}

/// Scheduler errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    /// Completion for a round that is not live.
    #[error("round {got} is not the live round ({expected})")]
    RoundMismatch {
        /// Live round.
        expected: u64,
        /// Round in the request.
        got: u64,
    },
    /// Completion before the ledger was sealed.
    #[error("round {0} is still accepting guesses")]
    StillGuessing(u64),
    /// Outcome already frozen.
    #[error("round {0} is already resolved")]
    AlreadyResolved(u64),
}

/// The round state machine.
pub struct RoundScheduler {
    config: RoundConfig,
    round: Round,
    ledger: GuessLedger,
    registry: ParticipantRegistry,
    rating: RatingEngine,
    selector: Box<dyn CompetitorSelector>,
    history: VecDeque<ClosedRound>,
}

impl RoundScheduler {
    /// Start at round 1 with an empty registry.
    pub fn new(
        config: RoundConfig,
        rating: RatingEngine,
        selector: Box<dyn CompetitorSelector>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::resume(config, rating, selector, Vec::new(), 0, now)
    }

    /// Start after `last_round`, restoring stored participants.
    pub fn resume(
        mut config: RoundConfig,
        rating: RatingEngine,
        mut selector: Box<dyn CompetitorSelector>,
        participants: Vec<Participant>,
        last_round: u64,
        now: DateTime<Utc>,
    ) -> Self {
        config.guess_secs = config.guess_secs.max(1);
        config.results_secs = config.results_secs.max(1);

        let mut registry = ParticipantRegistry::new(rating.config().initial_rating);
        registry.restore(participants);

        let number = last_round + 1;
        let round = Round::open(number, selector.next_pair(number), config.guess_secs, now);
        info!(
            "Round {} open: {} vs {} ({} participants restored)",
            number,
            round.competitor_a.name,
            round.competitor_b.name,
            registry.len()
        );

        Self {
            ledger: GuessLedger::open(number),
            history: VecDeque::with_capacity(config.history_len.min(1024)),
            config,
            round,
            registry,
            rating,
            selector,
        }
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Advance one tick.
    ///
    /// The returned events are in broadcast order; a `Tick` carrying the
    /// post-step phase and remaining time is always last.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<RoundEvent> {
        let mut events = Vec::new();

        self.round.time_remaining = self.round.time_remaining.saturating_sub(1);
        if self.round.time_remaining == 0 {
            match self.round.phase {
                Phase::Guessing => self.close_guessing(&mut events),
                Phase::Results => self.open_next(now, &mut events),
            }
        }

        events.push(RoundEvent::Tick {
            round_number: self.round.number,
            phase: self.round.phase,
            time_remaining: self.round.time_remaining,
        });
        events
    }

    fn close_guessing(&mut self, events: &mut Vec<RoundEvent>) {
        let guesses = match self.ledger.seal() {
            Ok(sealed) => sealed.len(),
            Err(e) => {
                warn!("{}", e);
                self.ledger.len()
            }
        };

        self.round.phase = Phase::Results;
        self.round.time_remaining = self.config.results_secs;
        info!("Round {} sealed with {} guesses", self.round.number, guesses);

        events.push(RoundEvent::Sealed {
            round_number: self.round.number,
            competitor_a: self.round.competitor_a.clone(),
            competitor_b: self.round.competitor_b.clone(),
            guesses,
        });
    }

    fn open_next(&mut self, now: DateTime<Utc>, events: &mut Vec<RoundEvent>) {
        if !self.round.is_resolved() {
            error!(
                "Round {} reached its boundary unresolved; using outcome {}",
                self.round.number, self.config.fallback_outcome
            );
            match self.complete_round(self.round.number, self.config.fallback_outcome) {
                Ok(closed) => events.push(RoundEvent::Results(closed)),
                Err(e) => error!("Fallback completion failed: {}", e),
            }
        }

        let changed = self.registry.commit_pending();
        if !changed.is_empty() {
            debug!("{} participants changed mode", changed.len());
        }

        let number = self.round.number + 1;
        let pair = self.selector.next_pair(number);
        self.round = Round::open(number, pair, self.config.guess_secs, now);
        self.ledger = GuessLedger::open(number);

        info!(
            "Round {} open: {} vs {}",
            number, self.round.competitor_a.name, self.round.competitor_b.name
        );

        events.push(RoundEvent::NewRound {
            round: self.round.clone(),
            total_participants: self.registry.playing_count(),
        });
        events.push(RoundEvent::PlayersUpdate(self.players()));
    }

    // =========================================================================
    // RESOLUTION
    // =========================================================================

    /// Freeze the outcome of the sealed round and apply ratings.
    pub fn complete_round(&mut self, round_number: u64, outcome: f64) -> Result<ClosedRound, SchedulerError> {
        if round_number != self.round.number {
            return Err(SchedulerError::RoundMismatch {
                expected: self.round.number,
                got: round_number,
            });
        }
        if self.round.phase == Phase::Guessing {
            return Err(SchedulerError::StillGuessing(round_number));
        }
        if self.round.is_resolved() {
            return Err(SchedulerError::AlreadyResolved(round_number));
        }

        let outcome = outcome.clamp(0.0, 100.0);
        let guesses = self.ledger.guesses();
        let initial = self.rating.config().initial_rating;
        let registry = &self.registry;
        let result = self.rating.rate(round_number, outcome, &guesses, |id| {
            registry.rating_of(id).unwrap_or(initial)
        });

        for line in &result.results {
            self.registry
                .apply_rating(&line.participant, line.rating_after, line.accuracy_score);
        }
        self.round.actual_outcome = Some(outcome);

        info!(
            "Round {} resolved: outcome {:.1}, {} rated",
            round_number,
            outcome,
            result.results.len()
        );

        let closed = ClosedRound {
            round: self.round.clone(),
            result,
        };
        if self.history.len() >= self.config.history_len.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(closed.clone());
        Ok(closed)
    }

    // =========================================================================
    // PARTICIPANT ACTIONS
    // =========================================================================

    /// Submit a guess for `participant`.
    pub fn submit_guess(
        &mut self,
        participant: ParticipantId,
        round_number: u64,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<Guess, GuessError> {
        let mode = self
            .registry
            .mode_of(&participant)
            .unwrap_or(ParticipantMode::Spectating);

        let result = self
            .ledger
            .submit(round_number, participant, mode, value, now)
            .cloned();
        if let Err(e) = &result {
            debug!("Guess from {} rejected: {}", participant.short(), e);
        }
        result
    }

    /// Register a participant if unknown.
    pub fn register(&mut self, id: ParticipantId, display_name: &str) -> bool {
        self.registry.register(id, display_name)
    }

    /// Record a mode request for the next round.
    pub fn request_mode(
        &mut self,
        id: &ParticipantId,
        mode: ParticipantMode,
    ) -> Result<ModeChange, RegistryError> {
        self.registry.request_mode(id, mode)
    }

    /// Register and request Playing.
    pub fn join(&mut self, id: ParticipantId, display_name: &str) -> ModeChange {
        self.registry.join(id, display_name)
    }

    /// Request Spectating.
    pub fn leave(&mut self, id: &ParticipantId) -> Result<ModeChange, RegistryError> {
        self.registry.leave(id)
    }

    /// Flip a participant's connected flag.
    pub fn set_connected(&mut self, id: &ParticipantId, connected: bool) {
        self.registry.set_connected(id, connected);
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// The live round.
    pub fn round(&self) -> &Round {
        &self.round
    }

    /// Whether the next tick ends the Results phase and opens a new round.
    pub fn at_boundary(&self) -> bool {
        self.round.phase == Phase::Results && self.round.time_remaining <= 1
    }

    /// The participant registry.
    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    /// Active phase settings.
    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// Round number the next change of mode takes effect in.
    pub fn effective_round(&self) -> u64 {
        self.round.number + 1
    }

    /// Participants in id order.
    pub fn players(&self) -> Vec<PlayerEntry> {
        self.registry.iter().map(PlayerEntry::from).collect()
    }

    /// Participant records for persistence.
    pub fn participants(&self) -> Vec<Participant> {
        self.registry.iter().cloned().collect()
    }

    /// Full snapshot of the live round.
    pub fn snapshot(&self, now: DateTime<Utc>) -> RoundSnapshot {
        RoundSnapshot {
            round: self.round.clone(),
            players: self.players(),
            total_participants: self.registry.playing_count(),
            guesses_received: self.ledger.len(),
            server_time: now,
        }
    }

    /// A closed round from in-memory history.
    pub fn closed_round(&self, round_number: u64) -> Option<&ClosedRound> {
        self.history.iter().rev().find(|c| c.round.number == round_number)
    }

    /// Most recently closed round.
    pub fn last_closed(&self) -> Option<&ClosedRound> {
        self.history.back()
    }
}
