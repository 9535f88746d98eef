//! # Versus Oracle Server
//!
//! Synchronized prediction rounds. Every connected participant sees the same
//! round, guesses the win probability of competitor A before the window
//! closes, and is rated on accuracy against the field once the outcome is
//! resolved.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   VERSUS ORACLE SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── clock.rs    - One-second ticker                         │
//! │  └── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │                                                              │
//! │  round/          - Round engine (synchronous)                │
//! │  ├── scheduler.rs- Guessing/Results state machine            │
//! │  ├── ledger.rs   - One guess per participant per round       │
//! │  ├── registry.rs - Participants, modes, deferred intent      │
//! │  ├── resolver.rs - Outcome simulation with fallback          │
//! │  ├── rating.rs   - Accuracy-vs-field rating                  │
//! │  ├── selector.rs - Competitor matchups                       │
//! │  └── store.rs    - Participant and round persistence         │
//! │                                                              │
//! │  arena.rs        - Shared state and tick driver              │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket gateway                         │
//! │  ├── http.rs     - HTTP request/response surface             │
//! │  ├── broadcast.rs- Serialize-once fan-out                    │
//! │  ├── session.rs  - Connection bookkeeping                    │
//! │  ├── protocol.rs - Message types                             │
//! │  └── projection.rs - Client-side view                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Only the scheduler changes round state, one tick at a time under a
//! single lock. Broadcast messages are published in the order the
//! scheduler produced them, so every client observes the same sequence.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod arena;
pub mod config;
pub mod core;
pub mod network;
pub mod round;

// Re-export commonly used types
pub use arena::{Arena, ArenaError};
pub use config::{ArenaConfig, ConfigError};
pub use round::{
    Competitor, Participant, ParticipantId, ParticipantMode, Phase, Round, RoundResult,
    RoundScheduler,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
