//! Arena
//!
//! Shared state behind every connection and HTTP handler, plus the tick
//! driver. The scheduler sits behind one async mutex; anything slow (outcome
//! resolution, disk) runs outside the lock in tasks tracked by a `JoinSet`.
//!
//! ```text
//! Clock ──tick──→ advance() ──events──→ BroadcastBus ──→ connections
//!                    │
//!                 Sealed ──spawn──→ resolve ──→ complete_round ──→ store
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ArenaConfig;
use crate::core::clock::Clock;
use crate::network::auth::{AuthError, AuthVerifier, Identity};
use crate::network::broadcast::BroadcastBus;
use crate::network::protocol::{LeaderboardEntry, ModeResponse, ServerMessage, UserStats};
use crate::network::session::SessionManager;
use crate::round::events::{ClosedRound, RoundEvent, RoundSnapshot};
use crate::round::ledger::{Guess, GuessError};
use crate::round::rating::{RatingEngine, RoundResult};
use crate::round::registry::RegistryError;
use crate::round::resolver::{OutcomeResolver, OutcomeSimulator};
use crate::round::scheduler::{RoundScheduler, SchedulerError};
use crate::round::selector::CompetitorSelector;
use crate::round::state::{Competitor, Participant, ParticipantId, ParticipantMode};
use crate::round::store::{RoundStore, StoreError};

/// Longest the driver waits at a round boundary for in-flight tasks.
const BOUNDARY_JOIN_BUDGET: Duration = Duration::from_millis(250);

/// Arena errors.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// Persistence failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Background task failed.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Shared arena state.
pub struct Arena {
    scheduler: Mutex<RoundScheduler>,
    resolver: OutcomeResolver,
    store: Arc<dyn RoundStore>,
    verifier: Arc<dyn AuthVerifier>,
    bus: BroadcastBus,
    sessions: SessionManager,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
}

impl Arena {
    /// Restore from the store and open the next round.
    pub async fn open(
        config: &ArenaConfig,
        store: Arc<dyn RoundStore>,
        verifier: Arc<dyn AuthVerifier>,
        simulator: Arc<dyn OutcomeSimulator>,
        selector: Box<dyn CompetitorSelector>,
    ) -> Result<Arc<Self>, ArenaError> {
        let loader = store.clone();
        let (participants, last_round) = tokio::task::spawn_blocking(move || {
            Ok::<_, StoreError>((loader.load_participants()?, loader.last_round_number()?))
        })
        .await??;

        let now = Utc::now();
        let scheduler = RoundScheduler::resume(
            config.round.clone(),
            RatingEngine::new(config.rating.clone()),
            selector,
            participants,
            last_round,
            now,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            scheduler: Mutex::new(scheduler),
            resolver: OutcomeResolver::new(simulator, config.resolver.clone()),
            store,
            verifier,
            bus: BroadcastBus::new(config.server.broadcast_capacity),
            sessions: SessionManager::new(config.session.clone()),
            shutdown_tx,
            started_at: now,
        }))
    }

    // =========================================================================
    // DRIVER
    // =========================================================================

    /// Drive rounds until shutdown.
    ///
    /// On shutdown the live round is left frozen, in-flight resolution and
    /// persistence tasks are drained and participants are saved.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut clock: Clock) {
        let mut tasks = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = clock.tick() => {
                    self.step(Utc::now(), &mut tasks).await;
                    while let Some(done) = tasks.try_join_next() {
                        if let Err(e) = done {
                            error!("Round task failed: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Round driver stopping");
                    break;
                }
            }
        }

        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("Round task failed during shutdown: {}", e);
            }
        }

        let participants = self.scheduler.lock().await.participants();
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.save_participants(&participants)).await {
            Ok(Ok(())) => info!("Participants saved"),
            Ok(Err(e)) => error!("Failed to save participants: {}", e),
            Err(e) => error!("Participant save task failed: {}", e),
        }
    }

    /// Advance one tick and dispatch the resulting events.
    ///
    /// Before the tick that opens a new round, in-flight resolution and
    /// persistence get a bounded chance to finish. Events are published
    /// under the scheduler lock so they reach the bus in scheduler order.
    pub async fn step(self: &Arc<Self>, now: DateTime<Utc>, tasks: &mut JoinSet<()>) {
        if !tasks.is_empty() && self.scheduler.lock().await.at_boundary() {
            join_pending(tasks).await;
        }

        let mut scheduler = self.scheduler.lock().await;
        for event in scheduler.advance(now) {
            match &event {
                RoundEvent::Sealed { round_number, competitor_a, competitor_b, guesses } => {
                    debug!("Round {} sealed with {} guesses", round_number, guesses);
                    let arena = Arc::clone(self);
                    let (n, a, b) = (*round_number, competitor_a.clone(), competitor_b.clone());
                    tasks.spawn(async move { arena.resolve_round(n, a, b).await });
                }
                RoundEvent::Results(closed) => {
                    // Only reached when the boundary forced the fallback
                    tasks.spawn(persist(self.store.clone(), closed.clone(), scheduler.participants()));
                }
                _ => {}
            }
            if let Some(msg) = ServerMessage::from_event(&event) {
                self.bus.publish(&msg);
            }
        }
    }

    /// Resolve a sealed round outside the lock, then freeze it.
    async fn resolve_round(self: Arc<Self>, round_number: u64, a: Competitor, b: Competitor) {
        let resolution = self.resolver.resolve(round_number, &a, &b).await;

        let completed = {
            let mut scheduler = self.scheduler.lock().await;
            match scheduler.complete_round(round_number, resolution.outcome) {
                Ok(closed) => {
                    // Published before the lock drops so no new-round can overtake it
                    self.bus.publish(&ServerMessage::RoundResults(closed.result.clone()));
                    Some((closed, scheduler.participants()))
                }
                Err(SchedulerError::AlreadyResolved(n)) | Err(SchedulerError::RoundMismatch { got: n, .. }) => {
                    warn!("Round {} was closed before its outcome arrived", n);
                    None
                }
                Err(e) => {
                    error!("Could not complete round {}: {}", round_number, e);
                    None
                }
            }
        };

        if let Some((closed, participants)) = completed {
            persist(self.store.clone(), closed, participants).await;
        }
    }

    /// Signal the driver and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    // =========================================================================
    // PARTICIPANT ACTIONS
    // =========================================================================

    /// Verify a credential token.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verifier.verify(token)
    }

    /// A connection authenticated as `identity`.
    pub async fn connect(&self, identity: &Identity) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.register(identity.participant, &identity.display_name) {
            info!(
                "Registered participant {} ({})",
                identity.participant.short(),
                identity.display_name
            );
        }
        scheduler.set_connected(&identity.participant, true);
    }

    /// The participant's last connection closed. Mode is left as is.
    ///
    /// Re-checked under the scheduler lock: a connection that authenticated
    /// since the close keeps the participant connected.
    pub async fn disconnect(&self, participant: &ParticipantId) {
        let mut scheduler = self.scheduler.lock().await;
        if self.sessions.connections_for(participant).await > 0 {
            debug!("Participant {} reconnected before disconnect", participant.short());
            return;
        }
        scheduler.set_connected(participant, false);
    }

    /// Submit a guess for the live round.
    pub async fn submit_guess(
        &self,
        participant: ParticipantId,
        round_number: u64,
        value: f64,
    ) -> Result<Guess, GuessError> {
        self.scheduler
            .lock()
            .await
            .submit_guess(participant, round_number, value, Utc::now())
    }

    /// Request a mode. Returns the round it takes effect in.
    pub async fn set_mode(
        &self,
        participant: &ParticipantId,
        mode: ParticipantMode,
    ) -> Result<u64, RegistryError> {
        let mut scheduler = self.scheduler.lock().await;
        scheduler.request_mode(participant, mode)?;
        Ok(scheduler.effective_round())
    }

    /// Register if needed and request Playing from the next round.
    pub async fn join(&self, identity: &Identity) -> ModeResponse {
        let mut scheduler = self.scheduler.lock().await;
        let change = scheduler.join(identity.participant, &identity.display_name);
        ModeResponse {
            identity: identity.participant,
            current_mode: change.current,
            pending_mode: change.pending,
            effective_round: scheduler.effective_round(),
        }
    }

    /// Request Spectating from the next round.
    pub async fn leave(&self, participant: &ParticipantId) -> Result<ModeResponse, RegistryError> {
        let mut scheduler = self.scheduler.lock().await;
        let change = scheduler.leave(participant)?;
        Ok(ModeResponse {
            identity: *participant,
            current_mode: change.current,
            pending_mode: change.pending,
            effective_round: scheduler.effective_round(),
        })
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Fresh snapshot of the live round.
    pub async fn snapshot(&self) -> RoundSnapshot {
        self.scheduler.lock().await.snapshot(Utc::now())
    }

    /// Result of a closed round, from history or the store.
    pub async fn round_results(&self, round_number: u64) -> Result<Option<RoundResult>, ArenaError> {
        if let Some(closed) = self.scheduler.lock().await.closed_round(round_number) {
            return Ok(Some(closed.result.clone()));
        }
        let store = self.store.clone();
        let stored = tokio::task::spawn_blocking(move || store.load_round(round_number)).await??;
        Ok(stored.map(|closed| closed.result))
    }

    /// Ranked participants.
    pub async fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let ranked = self.scheduler.lock().await.registry().leaderboard(limit);
        LeaderboardEntry::ranked(&ranked)
    }

    /// Statistics for one participant.
    pub async fn user_stats(&self, participant: &ParticipantId) -> Option<UserStats> {
        let scheduler = self.scheduler.lock().await;
        scheduler.registry().stats(participant).map(|s| UserStats::from(&s))
    }

    /// Broadcast bus.
    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }

    /// Connection bookkeeping.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// When this process started serving.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Wait up to the boundary budget for every tracked task.
async fn join_pending(tasks: &mut JoinSet<()>) {
    let drained = tokio::time::timeout(BOUNDARY_JOIN_BUDGET, async {
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("Round task failed: {}", e);
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!("{} round tasks still running at the boundary", tasks.len());
    }
}

/// Write a closed round and the participant set.
async fn persist(store: Arc<dyn RoundStore>, closed: ClosedRound, participants: Vec<Participant>) {
    let number = closed.round.number;
    let result = tokio::task::spawn_blocking(move || {
        store.save_round(&closed)?;
        store.save_participants(&participants)
    })
    .await;

    match result {
        Ok(Ok(())) => debug!("Round {} persisted", number),
        Ok(Err(e)) => error!("Failed to persist round {}: {}", number, e),
        Err(e) => error!("Persist task for round {} failed: {}", number, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::AuthConfig;
    use crate::network::auth::JwtVerifier;
    use crate::round::resolver::ResolverError;
    use crate::round::scheduler::RoundConfig;
    use crate::round::store::MemoryStore;
    use crate::round::state::Phase;

    struct FixedOutcome(f64);

    impl OutcomeSimulator for FixedOutcome {
        fn simulate(&self, _: &Competitor, _: &Competitor, _: u64) -> Result<f64, ResolverError> {
            Ok(self.0)
        }
    }

    /// Blocks the resolver thread before answering.
    struct SlowOutcome(Duration, f64);

    impl OutcomeSimulator for SlowOutcome {
        fn simulate(&self, _: &Competitor, _: &Competitor, _: u64) -> Result<f64, ResolverError> {
            std::thread::sleep(self.0);
            Ok(self.1)
        }
    }

    struct Broken;

    impl OutcomeSimulator for Broken {
        fn simulate(&self, _: &Competitor, _: &Competitor, _: u64) -> Result<f64, ResolverError> {
            Err(ResolverError::Unavailable("offline".into()))
        }
    }

    struct FixedPair;

    impl CompetitorSelector for FixedPair {
        fn next_pair(&mut self, _: u64) -> (Competitor, Competitor) {
            (Competitor::new(0, "Emberfang"), Competitor::new(1, "Tidewhisker"))
        }
    }

    fn identity(n: u8) -> Identity {
        Identity {
            participant: ParticipantId::new([n; 16]),
            display_name: format!("player-{}", n),
        }
    }

    fn config() -> ArenaConfig {
        ArenaConfig {
            round: RoundConfig {
                guess_secs: 3,
                results_secs: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn arena_with(store: Arc<dyn RoundStore>, simulator: Arc<dyn OutcomeSimulator>) -> Arc<Arena> {
        Arena::open(
            &config(),
            store,
            Arc::new(JwtVerifier::new(AuthConfig::default())),
            simulator,
            Box::new(FixedPair),
        )
        .await
        .unwrap()
    }

    /// Step until the round's Results phase has begun and all tasks finished.
    async fn run_to_results(arena: &Arc<Arena>, tasks: &mut JoinSet<()>) {
        for _ in 0..3 {
            arena.step(Utc::now(), tasks).await;
        }
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_full_round_rates_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let arena = arena_with(store.clone(), Arc::new(FixedOutcome(72.0))).await;
        let (a, b) = (identity(1), identity(2));
        arena.join(&a).await;
        arena.join(&b).await;

        // Joins apply from round 2
        let mut tasks = JoinSet::new();
        run_to_results(&arena, &mut tasks).await;
        for _ in 0..2 {
            arena.step(Utc::now(), &mut tasks).await;
        }
        assert_eq!(arena.snapshot().await.round.number, 2);

        arena.submit_guess(a.participant, 2, 65.0).await.unwrap();
        arena.submit_guess(b.participant, 2, 35.0).await.unwrap();
        run_to_results(&arena, &mut tasks).await;

        let result = arena.round_results(2).await.unwrap().unwrap();
        assert_eq!(result.actual_outcome, 72.0);
        assert_eq!(result.for_participant(&a.participant).unwrap().rating_delta, 30.0);
        assert_eq!(result.for_participant(&b.participant).unwrap().rating_delta, -30.0);

        assert!(store.load_round(2).unwrap().is_some());
        let saved = store.load_participants().unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().any(|p| p.rating == 1030.0));
    }

    #[tokio::test]
    async fn test_simulator_failure_uses_fallback() {
        let arena = arena_with(Arc::new(MemoryStore::new()), Arc::new(Broken)).await;
        let mut rx = arena.bus().subscribe();
        let mut tasks = JoinSet::new();
        run_to_results(&arena, &mut tasks).await;

        let result = arena.round_results(1).await.unwrap().unwrap();
        assert_eq!(result.actual_outcome, 50.0);

        let mut saw_results = false;
        while let Ok(frame) = rx.try_recv() {
            saw_results |= frame.contains("\"type\":\"round-results\"");
        }
        assert!(saw_results);
    }

    #[tokio::test]
    async fn test_resume_after_stored_rounds() {
        let store = Arc::new(MemoryStore::new());
        {
            let arena = arena_with(store.clone(), Arc::new(FixedOutcome(10.0))).await;
            let mut tasks = JoinSet::new();
            run_to_results(&arena, &mut tasks).await;
        }
        assert_eq!(store.last_round_number().unwrap(), 1);

        let restarted = arena_with(store, Arc::new(FixedOutcome(10.0))).await;
        let snapshot = restarted.snapshot().await;
        assert_eq!(snapshot.round.number, 2);
        assert_eq!(snapshot.round.phase, Phase::Guessing);
        // Older rounds come from the store
        assert!(restarted.round_results(1).await.unwrap().is_some());
        assert!(restarted.round_results(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mode_requests_report_effective_round() {
        let arena = arena_with(Arc::new(MemoryStore::new()), Arc::new(FixedOutcome(50.0))).await;
        let who = identity(3);

        assert!(matches!(
            arena.set_mode(&who.participant, ParticipantMode::Playing).await,
            Err(RegistryError::UnknownParticipant(_))
        ));

        arena.connect(&who).await;
        assert_eq!(arena.set_mode(&who.participant, ParticipantMode::Playing).await, Ok(2));

        let response = arena.leave(&who.participant).await.unwrap();
        assert_eq!(response.current_mode, ParticipantMode::Spectating);
        assert_eq!(response.pending_mode, None);

        let stats = arena.user_stats(&who.participant).await.unwrap();
        assert!(stats.connected);
        arena.disconnect(&who.participant).await;
        assert!(!arena.user_stats(&who.participant).await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_results_published_before_next_round() {
        let config = ArenaConfig {
            round: RoundConfig {
                guess_secs: 1,
                results_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let arena = Arena::open(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(JwtVerifier::new(AuthConfig::default())),
            Arc::new(SlowOutcome(Duration::from_millis(50), 64.0)),
            Box::new(FixedPair),
        )
        .await
        .unwrap();
        let mut rx = arena.bus().subscribe();
        let mut tasks = JoinSet::new();

        // Seal, then cross the boundary while the outcome is still pending
        arena.step(Utc::now(), &mut tasks).await;
        arena.step(Utc::now(), &mut tasks).await;
        assert_eq!(arena.snapshot().await.round.number, 2);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        let position = |kind: &str| {
            let needle = format!("\"type\":\"{}\"", kind);
            frames.iter().position(|f| f.contains(&needle))
        };
        let results = position("round-results").unwrap();
        let next = position("new-round").unwrap();
        assert!(results < next);

        // The simulator's answer was used, not the boundary fallback
        let result = arena.round_results(1).await.unwrap().unwrap();
        assert_eq!(result.actual_outcome, 64.0);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_reconnected_participant() {
        let arena = arena_with(Arc::new(MemoryStore::new()), Arc::new(FixedOutcome(50.0))).await;
        let who = identity(5);
        let sessions = arena.sessions();

        let first = sessions.open().await;
        sessions.authenticate(first, who.participant).await.unwrap();
        arena.connect(&who).await;

        // Old socket closes as the last connection, then a new one
        // authenticates before the disconnect is applied
        assert_eq!(sessions.close(first).await, Some(who.participant));
        let second = sessions.open().await;
        sessions.authenticate(second, who.participant).await.unwrap();
        arena.connect(&who).await;
        arena.disconnect(&who.participant).await;
        assert!(arena.user_stats(&who.participant).await.unwrap().connected);

        assert_eq!(sessions.close(second).await, Some(who.participant));
        arena.disconnect(&who.participant).await;
        assert!(!arena.user_stats(&who.participant).await.unwrap().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let arena = arena_with(store.clone(), Arc::new(FixedOutcome(50.0))).await;
        arena.connect(&identity(4)).await;

        let driver = tokio::spawn(arena.clone().run(Clock::new(Duration::from_millis(10))));
        tokio::time::sleep(Duration::from_millis(25)).await;
        arena.shutdown();
        driver.await.unwrap();

        assert_eq!(store.load_participants().unwrap().len(), 1);
    }
}
