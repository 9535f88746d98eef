//! Round Engine
//!
//! Synchronous core of the arena. Nothing in here touches sockets; the
//! scheduler is driven by `crate::arena` and observed through `RoundEvent`s.

pub mod events;
pub mod ledger;
pub mod rating;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod selector;
pub mod state;
pub mod store;

pub use events::{ClosedRound, PlayerEntry, RoundEvent, RoundSnapshot};
pub use ledger::{Guess, GuessError, GuessLedger, InvalidGuess, LedgerError};
pub use rating::{accuracy_score, ParticipantResult, RatingConfig, RatingEngine, RoundResult};
pub use registry::{ModeChange, ParticipantRegistry, ParticipantStats, RegistryError};
pub use resolver::{
    OutcomeResolver, OutcomeSimulator, Resolution, ResolverConfig, ResolverError,
    SeededDuelSimulator, FALLBACK_OUTCOME,
};
pub use scheduler::{RoundConfig, RoundScheduler, SchedulerError};
pub use selector::{CompetitorSelector, RosterSelector, SelectorError, DEFAULT_ROSTER};
pub use state::{Competitor, Participant, ParticipantId, ParticipantMode, Phase, Round};
pub use store::{JsonFileStore, MemoryStore, RoundStore, StoreError};
