//! Outcome Resolver
//!
//! Wraps the external outcome simulator. Each round is resolved at most
//! once: the first answer (or the fallback) is cached and every later call
//! for the same round returns it unchanged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::core::rng::SeededRng;
use crate::round::state::Competitor;

/// Outcome used when the simulator fails or times out.
pub const FALLBACK_OUTCOME: f64 = 50.0;

/// Duels played by the default simulator per round.
pub const DUELS_PER_ROUND: u32 = 200;

/// Resolver errors. Never fatal to the scheduler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolverError {
    /// Simulator returned an error or panicked.
    #[error("outcome simulator unavailable: {0}")]
    Unavailable(String),
    /// Simulator did not answer in time.
    #[error("outcome simulator timed out after {0:?}")]
    TimedOut(Duration),
    /// Simulator answered outside [0, 100].
    #[error("outcome {0} outside [0, 100]")]
    OutOfRange(f64),
}

/// External outcome simulator: two competitors in, A's win probability out.
pub trait OutcomeSimulator: Send + Sync + 'static {
    /// Win probability of `a` against `b`, in [0, 100].
    fn simulate(&self, a: &Competitor, b: &Competitor, round_number: u64) -> Result<f64, ResolverError>;
}

/// Resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upper bound on one simulator call.
    pub timeout: Duration,
    /// Outcome substituted on failure.
    pub fallback_outcome: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            fallback_outcome: FALLBACK_OUTCOME,
        }
    }
}

/// A frozen outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    /// Round the outcome belongs to.
    pub round_number: u64,
    /// Win probability of competitor A.
    pub outcome: f64,
    /// True when the fallback was substituted.
    pub fallback: bool,
}

/// Outcome resolver with a per-round cache.
pub struct OutcomeResolver {
    simulator: Arc<dyn OutcomeSimulator>,
    config: ResolverConfig,
    last: Mutex<Option<Resolution>>,
}

impl OutcomeResolver {
    /// Create a resolver around a simulator.
    pub fn new(simulator: Arc<dyn OutcomeSimulator>, config: ResolverConfig) -> Self {
        Self {
            simulator,
            config,
            last: Mutex::new(None),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Cached resolution for a round, if any.
    pub fn cached(&self, round_number: u64) -> Option<Resolution> {
        let last = self.last.lock().ok()?;
        (*last).filter(|r| r.round_number == round_number)
    }

    /// Resolve a round's outcome.
    ///
    /// Never fails: simulator errors and timeouts are logged and replaced
    /// by the fallback outcome, which is cached like any other answer.
    pub async fn resolve(&self, round_number: u64, a: &Competitor, b: &Competitor) -> Resolution {
        if let Some(cached) = self.cached(round_number) {
            return cached;
        }

        let resolution = match self.try_resolve(round_number, a, b).await {
            Ok(outcome) => {
                debug!("Round {} resolved to {:.2}", round_number, outcome);
                Resolution { round_number, outcome, fallback: false }
            }
            Err(e) => {
                error!(
                    "Round {} outcome unavailable ({}); using fallback {}",
                    round_number, e, self.config.fallback_outcome
                );
                Resolution {
                    round_number,
                    outcome: self.config.fallback_outcome,
                    fallback: true,
                }
            }
        };

        self.remember(resolution)
    }

    /// Call the simulator once with the configured timeout.
    pub async fn try_resolve(
        &self,
        round_number: u64,
        a: &Competitor,
        b: &Competitor,
    ) -> Result<f64, ResolverError> {
        let simulator = self.simulator.clone();
        let (a, b) = (a.clone(), b.clone());
        let call = tokio::task::spawn_blocking(move || simulator.simulate(&a, &b, round_number));

        let outcome = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => return Err(ResolverError::Unavailable(join_error.to_string())),
            Err(_) => return Err(ResolverError::TimedOut(self.config.timeout)),
        };

        if !outcome.is_finite() || !(0.0..=100.0).contains(&outcome) {
            return Err(ResolverError::OutOfRange(outcome));
        }
        Ok(outcome)
    }

    /// Store a resolution unless another caller got there first.
    fn remember(&self, resolution: Resolution) -> Resolution {
        match self.last.lock() {
            Ok(mut last) => match *last {
                Some(existing) if existing.round_number == resolution.round_number => existing,
                _ => {
                    *last = Some(resolution);
                    resolution
                }
            },
            Err(_) => resolution,
        }
    }
}

// =============================================================================
// DEFAULT SIMULATOR
// =============================================================================

/// Deterministic duel simulator.
///
/// Each competitor's strength comes from its name; the duel sequence is
/// seeded from (round, A, B), so a round always replays to the same answer.
#[derive(Debug, Clone)]
pub struct SeededDuelSimulator {
    duels: u32,
}

impl Default for SeededDuelSimulator {
    fn default() -> Self {
        Self { duels: DUELS_PER_ROUND }
    }
}

impl SeededDuelSimulator {
    /// Create a simulator playing `duels` duels per round.
    pub fn new(duels: u32) -> Self {
        Self { duels: duels.max(1) }
    }

    /// Base strength in [50, 150).
    fn strength(competitor: &Competitor) -> f64 {
        let mut rng = SeededRng::for_round(0, &competitor.name, "");
        50.0 + rng.next_unit() * 100.0
    }
}

impl OutcomeSimulator for SeededDuelSimulator {
    fn simulate(&self, a: &Competitor, b: &Competitor, round_number: u64) -> Result<f64, ResolverError> {
        let (sa, sb) = (Self::strength(a), Self::strength(b));
        let mut rng = SeededRng::for_round(round_number, &a.name, &b.name);

        let mut wins = 0u32;
        for _ in 0..self.duels {
            // Per-duel form swings each side by up to 25%
            let form_a = sa * (0.75 + rng.next_unit() * 0.5);
            let form_b = sb * (0.75 + rng.next_unit() * 0.5);
            if rng.next_unit() * (form_a + form_b) < form_a {
                wins += 1;
            }
        }

        Ok(wins as f64 * 100.0 / self.duels as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
    }

    impl OutcomeSimulator for Counting {
        fn simulate(&self, _: &Competitor, _: &Competitor, round_number: u64) -> Result<f64, ResolverError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((round_number as f64 + n as f64).min(100.0))
        }
    }

    struct Failing;

    impl OutcomeSimulator for Failing {
        fn simulate(&self, _: &Competitor, _: &Competitor, _: u64) -> Result<f64, ResolverError> {
            Err(ResolverError::Unavailable("offline".into()))
        }
    }

    struct Slow;

    impl OutcomeSimulator for Slow {
        fn simulate(&self, _: &Competitor, _: &Competitor, _: u64) -> Result<f64, ResolverError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(90.0)
        }
    }

    struct Wild;

    impl OutcomeSimulator for Wild {
        fn simulate(&self, _: &Competitor, _: &Competitor, _: u64) -> Result<f64, ResolverError> {
            Ok(140.0)
        }
    }

    fn pair() -> (Competitor, Competitor) {
        (Competitor::new(0, "Emberfang"), Competitor::new(1, "Tidewhisker"))
    }

    #[tokio::test]
    async fn test_simulator_called_once_per_round() {
        let counting = Arc::new(Counting { calls: AtomicU32::new(0) });
        let resolver = OutcomeResolver::new(counting.clone(), ResolverConfig::default());
        let (a, b) = pair();

        let first = resolver.resolve(7, &a, &b).await;
        let second = resolver.resolve(7, &a, &b).await;

        assert_eq!(first, second);
        assert_eq!(first.outcome, 7.0);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        let next = resolver.resolve(8, &a, &b).await;
        assert_eq!(next.outcome, 9.0);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_uses_fallback() {
        let resolver = OutcomeResolver::new(Arc::new(Failing), ResolverConfig::default());
        let (a, b) = pair();

        let resolution = resolver.resolve(3, &a, &b).await;
        assert!(resolution.fallback);
        assert_eq!(resolution.outcome, FALLBACK_OUTCOME);
        assert_eq!(resolver.cached(3), Some(resolution));
    }

    #[tokio::test]
    async fn test_timeout_uses_fallback() {
        let config = ResolverConfig {
            timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let resolver = OutcomeResolver::new(Arc::new(Slow), config);
        let (a, b) = pair();

        let err = resolver.try_resolve(1, &a, &b).await.unwrap_err();
        assert!(matches!(err, ResolverError::TimedOut(_)));

        let resolution = resolver.resolve(1, &a, &b).await;
        assert!(resolution.fallback);
        assert_eq!(resolution.outcome, FALLBACK_OUTCOME);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let resolver = OutcomeResolver::new(Arc::new(Wild), ResolverConfig::default());
        let (a, b) = pair();

        let err = resolver.try_resolve(1, &a, &b).await.unwrap_err();
        assert_eq!(err, ResolverError::OutOfRange(140.0));
        assert!(resolver.resolve(1, &a, &b).await.fallback);
    }

    #[test]
    fn test_duel_simulator_is_deterministic() {
        let sim = SeededDuelSimulator::default();
        let (a, b) = pair();

        let first = sim.simulate(&a, &b, 42).unwrap();
        let second = sim.simulate(&a, &b, 42).unwrap();
        assert_eq!(first, second);
        assert!((0.0..=100.0).contains(&first));
    }

    #[test]
    fn test_duel_simulator_range_over_rounds() {
        let sim = SeededDuelSimulator::new(50);
        let (a, b) = pair();
        for round in 1..200 {
            let outcome = sim.simulate(&a, &b, round).unwrap();
            assert!((0.0..=100.0).contains(&outcome));
        }
    }
}
