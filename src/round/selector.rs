//! Competitor Selection
//!
//! Picks the matchup for each new round. The default selector draws two
//! distinct roster entries from a seeded RNG.

use thiserror::Error;

use crate::core::rng::SeededRng;
use crate::round::state::Competitor;

/// Roster used when none is configured.
pub const DEFAULT_ROSTER: &[&str] = &[
    "Emberfang",
    "Tidewhisker",
    "Thornback",
    "Voltwing",
    "Frostmane",
    "Duskclaw",
    "Stoneshell",
    "Galehorn",
];

/// Selector errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    /// Fewer than two distinct competitors.
    #[error("roster needs at least 2 distinct competitors, got {0}")]
    RosterTooSmall(usize),
}

/// Chooses the competitor pair for a round.
pub trait CompetitorSelector: Send {
    /// Pair for `round_number`. Must return two different competitors.
    fn next_pair(&mut self, round_number: u64) -> (Competitor, Competitor);
}

/// Seeded roster selector.
#[derive(Debug, Clone)]
pub struct RosterSelector {
    roster: Vec<Competitor>,
    rng: SeededRng,
}

impl RosterSelector {
    /// Create from a list of names. Duplicates and blanks are dropped.
    pub fn new<I, S>(names: I, seed: u64) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut roster: Vec<Competitor> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || roster.iter().any(|c| c.name == name) {
                continue;
            }
            roster.push(Competitor::new(roster.len() as u32, name));
        }

        if roster.len() < 2 {
            return Err(SelectorError::RosterTooSmall(roster.len()));
        }

        Ok(Self {
            roster,
            rng: SeededRng::new(seed),
        })
    }

    /// Selector over `DEFAULT_ROSTER`.
    pub fn with_default_roster(seed: u64) -> Self {
        let roster = DEFAULT_ROSTER
            .iter()
            .enumerate()
            .map(|(i, name)| Competitor::new(i as u32, *name))
            .collect();
        Self {
            roster,
            rng: SeededRng::new(seed),
        }
    }

    /// Configured competitors.
    pub fn roster(&self) -> &[Competitor] {
        &self.roster
    }
}

impl CompetitorSelector for RosterSelector {
    fn next_pair(&mut self, _round_number: u64) -> (Competitor, Competitor) {
        // Construction guarantees at least two entries
        let (a, b) = self.rng.distinct_pair(self.roster.len()).unwrap_or((0, 1));
        (self.roster[a].clone(), self.roster[b].clone())
    }
}
