//! Core primitives.
//!
//! Leaf types with no knowledge of rounds or connections.

pub mod clock;
pub mod rng;

pub use clock::{Clock, TICK_PERIOD};
pub use rng::{SeededRng, derive_round_seed};
