//! Participant Registry
//!
//! Tracks every known participant and their mode. Mode requests are written
//! as intent (`pending_mode`) and only take effect when the scheduler calls
//! `commit_pending` at the Results -> Guessing boundary.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::round::state::{Participant, ParticipantId, ParticipantMode};

/// Leaderboard limit bounds.
pub const MAX_LEADERBOARD_LIMIT: usize = 100;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No participant with this identity.
    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),
    /// `Leaving` cannot be requested directly.
    #[error("mode {0:?} cannot be requested")]
    InvalidMode(ParticipantMode),
}

/// Outcome of a mode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    /// Mode in force now.
    pub current: ParticipantMode,
    /// Mode that will apply from the next round, if different.
    pub pending: Option<ParticipantMode>,
}

/// Per-participant statistics.
#[derive(Debug, Clone)]
pub struct ParticipantStats {
    /// The participant.
    pub participant: Participant,
    /// 1-based leaderboard rank (None before the first counted guess).
    pub rank: Option<usize>,
}

/// Participant registry.
#[derive(Debug)]
pub struct ParticipantRegistry {
    participants: BTreeMap<ParticipantId, Participant>,
    initial_rating: f64,
}

impl ParticipantRegistry {
    /// Create an empty registry.
    pub fn new(initial_rating: f64) -> Self {
        Self {
            participants: BTreeMap::new(),
            initial_rating,
        }
    }

    /// Restore participants loaded from the store.
    ///
    /// Restored entries start disconnected with no pending intent.
    pub fn restore(&mut self, records: Vec<Participant>) {
        for mut record in records {
            record.connected = false;
            record.pending_mode = None;
            if record.current_mode == ParticipantMode::Leaving {
                record.current_mode = ParticipantMode::Spectating;
            }
            self.participants.insert(record.id, record);
        }
    }

    /// Register a participant if unknown. Returns true if newly created.
    pub fn register(&mut self, id: ParticipantId, display_name: &str) -> bool {
        if let Some(existing) = self.participants.get_mut(&id) {
            if !display_name.is_empty() && existing.display_name != display_name {
                existing.display_name = display_name.to_string();
            }
            return false;
        }
        self.participants
            .insert(id, Participant::new(id, display_name, self.initial_rating));
        true
    }

    /// Record a mode request, effective at the next round boundary.
    ///
    /// Requesting the mode already in force clears any pending intent.
    pub fn request_mode(
        &mut self,
        id: &ParticipantId,
        mode: ParticipantMode,
    ) -> Result<ModeChange, RegistryError> {
        if mode == ParticipantMode::Leaving {
            return Err(RegistryError::InvalidMode(mode));
        }
        let participant = self
            .participants
            .get_mut(id)
            .ok_or(RegistryError::UnknownParticipant(*id))?;

        debug!("Participant {} requested {:?}", id.short(), mode);
        Ok(set_pending(participant, mode))
    }

    /// Register (if needed) and request `Playing`.
    pub fn join(&mut self, id: ParticipantId, display_name: &str) -> ModeChange {
        self.register(id, display_name);
        let rating = self.initial_rating;
        let participant = self
            .participants
            .entry(id)
            .or_insert_with(|| Participant::new(id, display_name, rating));
        set_pending(participant, ParticipantMode::Playing)
    }

    /// Request `Spectating`.
    pub fn leave(&mut self, id: &ParticipantId) -> Result<ModeChange, RegistryError> {
        self.request_mode(id, ParticipantMode::Spectating)
    }

    /// Apply every pending intent. Returns the ids whose mode changed.
    pub fn commit_pending(&mut self) -> Vec<ParticipantId> {
        let mut changed = Vec::new();
        for participant in self.participants.values_mut() {
            if let Some(mode) = participant.pending_mode.take() {
                if participant.current_mode != mode {
                    participant.current_mode = mode;
                    changed.push(participant.id);
                }
            }
        }
        changed
    }

    /// Apply one round's rating change and accuracy to a participant.
    pub fn apply_rating(&mut self, id: &ParticipantId, rating_after: f64, accuracy: f64) {
        if let Some(participant) = self.participants.get_mut(id) {
            participant.rating = rating_after;
            participant.games_played += 1;
            participant.total_accuracy += accuracy;
            participant.best_accuracy = Some(match participant.best_accuracy {
                Some(best) => best.max(accuracy),
                None => accuracy,
            });
        }
    }

    /// Flip the connected flag. Mode is never touched here.
    pub fn set_connected(&mut self, id: &ParticipantId, connected: bool) {
        if let Some(participant) = self.participants.get_mut(id) {
            participant.connected = connected;
        }
    }

    /// Look up a participant.
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Current mode, if registered.
    pub fn mode_of(&self, id: &ParticipantId) -> Option<ParticipantMode> {
        self.participants.get(id).map(|p| p.current_mode)
    }

    /// Rating, if registered.
    pub fn rating_of(&self, id: &ParticipantId) -> Option<f64> {
        self.participants.get(id).map(|p| p.rating)
    }

    /// All participants in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Number of registered participants.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// No participants.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Participants currently playing (or leaving).
    pub fn playing_count(&self) -> usize {
        self.participants.values().filter(|p| p.can_guess()).count()
    }

    /// Participants with at least one game, best first.
    ///
    /// Ordered by rating, then games played, then id. `limit` is clamped
    /// to [1, MAX_LEADERBOARD_LIMIT].
    pub fn leaderboard(&self, limit: usize) -> Vec<Participant> {
        let mut ranked = self.ranked();
        ranked.truncate(limit.clamp(1, MAX_LEADERBOARD_LIMIT));
        ranked.into_iter().cloned().collect()
    }

    /// Statistics for one participant.
    pub fn stats(&self, id: &ParticipantId) -> Option<ParticipantStats> {
        let participant = self.participants.get(id)?.clone();
        let rank = self
            .ranked()
            .iter()
            .position(|p| p.id == *id)
            .map(|i| i + 1);
        Some(ParticipantStats { participant, rank })
    }

    fn ranked(&self) -> Vec<&Participant> {
        let mut ranked: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.games_played > 0)
            .collect();
        ranked.sort_by(|a, b| {
            b.rating
                .total_cmp(&a.rating)
                .then(b.games_played.cmp(&a.games_played))
                .then(a.id.cmp(&b.id))
        });
        ranked
    }
}

/// Write intent; asking for the mode already in force clears it.
fn set_pending(participant: &mut Participant, mode: ParticipantMode) -> ModeChange {
    participant.pending_mode = if participant.current_mode == mode {
        None
    } else {
        Some(mode)
    };
    ModeChange {
        current: participant.current_mode,
        pending: participant.pending_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> ParticipantId {
        ParticipantId::new([n; 16])
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = ParticipantRegistry::new(1000.0);
        assert!(registry.register(pid(1), "ash"));
        assert!(!registry.register(pid(1), "ash"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.mode_of(&pid(1)), Some(ParticipantMode::Spectating));
        assert_eq!(registry.rating_of(&pid(1)), Some(1000.0));
    }

    #[test]
    fn test_mode_request_is_deferred() {
        let mut registry = ParticipantRegistry::new(1000.0);
        registry.register(pid(1), "ash");

        let change = registry.request_mode(&pid(1), ParticipantMode::Playing).unwrap();
        assert_eq!(change.current, ParticipantMode::Spectating);
        assert_eq!(change.pending, Some(ParticipantMode::Playing));
        assert_eq!(registry.mode_of(&pid(1)), Some(ParticipantMode::Spectating));

        let changed = registry.commit_pending();
        assert_eq!(changed, vec![pid(1)]);
        assert_eq!(registry.mode_of(&pid(1)), Some(ParticipantMode::Playing));
        assert_eq!(registry.get(&pid(1)).unwrap().pending_mode, None);
    }

    #[test]
    fn test_request_overwrites_and_cancels() {
        let mut registry = ParticipantRegistry::new(1000.0);
        registry.join(pid(1), "ash");
        registry.commit_pending();

        registry.request_mode(&pid(1), ParticipantMode::Spectating).unwrap();
        assert_eq!(registry.get(&pid(1)).unwrap().reported_mode(), ParticipantMode::Leaving);

        // Asking for the mode already in force cancels the pending switch
        let change = registry.request_mode(&pid(1), ParticipantMode::Playing).unwrap();
        assert_eq!(change.pending, None);
        assert!(registry.commit_pending().is_empty());
        assert_eq!(registry.mode_of(&pid(1)), Some(ParticipantMode::Playing));
    }

    #[test]
    fn test_leaving_cannot_be_requested() {
        let mut registry = ParticipantRegistry::new(1000.0);
        registry.register(pid(1), "ash");
        assert_eq!(
            registry.request_mode(&pid(1), ParticipantMode::Leaving),
            Err(RegistryError::InvalidMode(ParticipantMode::Leaving))
        );
    }

    #[test]
    fn test_unknown_participant() {
        let mut registry = ParticipantRegistry::new(1000.0);
        assert_eq!(
            registry.leave(&pid(9)),
            Err(RegistryError::UnknownParticipant(pid(9)))
        );
    }

    #[test]
    fn test_disconnect_keeps_mode() {
        let mut registry = ParticipantRegistry::new(1000.0);
        registry.join(pid(1), "ash");
        registry.commit_pending();
        registry.set_connected(&pid(1), true);
        registry.set_connected(&pid(1), false);

        let p = registry.get(&pid(1)).unwrap();
        assert!(!p.connected);
        assert_eq!(p.current_mode, ParticipantMode::Playing);
    }

    #[test]
    fn test_apply_rating_tracks_stats() {
        let mut registry = ParticipantRegistry::new(1000.0);
        registry.register(pid(1), "ash");
        registry.apply_rating(&pid(1), 1010.0, 90.0);
        registry.apply_rating(&pid(1), 1005.0, 70.0);

        let p = registry.get(&pid(1)).unwrap();
        assert_eq!(p.rating, 1005.0);
        assert_eq!(p.games_played, 2);
        assert_eq!(p.best_accuracy, Some(90.0));
        assert_eq!(p.mean_accuracy(), Some(80.0));
    }

    #[test]
    fn test_leaderboard_order_and_limit() {
        let mut registry = ParticipantRegistry::new(1000.0);
        for n in 1..=4 {
            registry.register(pid(n), "p");
        }
        registry.apply_rating(&pid(1), 990.0, 50.0);
        registry.apply_rating(&pid(2), 1020.0, 80.0);
        registry.apply_rating(&pid(3), 1020.0, 80.0);
        registry.apply_rating(&pid(3), 1020.0, 80.0);
        // pid(4) never played and is excluded

        let board = registry.leaderboard(10);
        let order: Vec<ParticipantId> = board.iter().map(|p| p.id).collect();
        assert_eq!(order, vec![pid(3), pid(2), pid(1)]);

        assert_eq!(registry.leaderboard(0).len(), 1);
        assert_eq!(registry.stats(&pid(2)).unwrap().rank, Some(2));
        assert_eq!(registry.stats(&pid(4)).unwrap().rank, None);
    }

    #[test]
    fn test_restore_clears_transient_state() {
        let mut p = Participant::new(pid(1), "ash", 1100.0);
        p.current_mode = ParticipantMode::Leaving;
        p.pending_mode = Some(ParticipantMode::Spectating);
        p.connected = true;

        let mut registry = ParticipantRegistry::new(1000.0);
        registry.restore(vec![p]);

        let restored = registry.get(&pid(1)).unwrap();
        assert_eq!(restored.rating, 1100.0);
        assert_eq!(restored.current_mode, ParticipantMode::Spectating);
        assert_eq!(restored.pending_mode, None);
        assert!(!restored.connected);
    }
}
