//! Configuration
//!
//! Every tunable is read from the environment once at startup and folded
//! into the per-component config structs.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::network::auth::AuthConfig;
use crate::network::server::ServerConfig;
use crate::network::session::SessionConfig;
use crate::round::rating::RatingConfig;
use crate::round::resolver::ResolverConfig;
use crate::round::scheduler::RoundConfig;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable is set but unusable.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// What was wrong.
        reason: String,
    },
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Phase timing.
    pub round: RoundConfig,
    /// Rating constants.
    pub rating: RatingConfig,
    /// Outcome resolution.
    pub resolver: ResolverConfig,
    /// Connection liveness.
    pub session: SessionConfig,
    /// Token validation.
    pub auth: AuthConfig,
    /// Directory for the JSON store; in-memory when unset.
    pub store_dir: Option<PathBuf>,
    /// Competitor names; the built-in roster when unset.
    pub roster: Option<Vec<String>>,
    /// Roster RNG seed.
    pub seed: u64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            round: RoundConfig::default(),
            rating: RatingConfig::default(),
            resolver: ResolverConfig::default(),
            session: SessionConfig::default(),
            auth: AuthConfig::default(),
            store_dir: None,
            roster: None,
            seed: time_seed(),
        }
    }
}

impl ArenaConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parse(&lookup, "ARENA_WS_ADDR")? {
            config.server.bind_addr = addr;
        }
        if let Some(addr) = parse(&lookup, "ARENA_HTTP_ADDR")? {
            config.server.http_addr = addr;
        }

        if let Some(secs) = positive(&lookup, "ARENA_GUESS_SECS")? {
            config.round.guess_secs = secs;
        }
        if let Some(secs) = positive(&lookup, "ARENA_RESULTS_SECS")? {
            config.round.results_secs = secs;
        }
        if let Some(secs) = positive::<u64, _>(&lookup, "ARENA_HEARTBEAT_SECS")? {
            config.session.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(missed) = positive(&lookup, "ARENA_MISSED_HEARTBEATS")? {
            config.session.missed_heartbeats = missed;
        }
        if let Some(ms) = positive::<u64, _>(&lookup, "ARENA_RESOLVER_TIMEOUT_MS")? {
            config.resolver.timeout = Duration::from_millis(ms);
        }

        if let Some(k) = finite(&lookup, "ARENA_RATING_K")? {
            if k <= 0.0 {
                return Err(invalid(
                    "ARENA_RATING_K",
                    &lookup("ARENA_RATING_K").unwrap_or_default(),
                    "must be greater than zero".into(),
                ));
            }
            config.rating.k_factor = k;
        }
        if let Some(max) = finite(&lookup, "ARENA_RATING_MAX_DELTA")? {
            config.rating.max_delta = max.abs();
        }
        if let Some(initial) = finite(&lookup, "ARENA_INITIAL_RATING")? {
            config.rating.initial_rating = initial;
        }

        config.store_dir = lookup("ARENA_STORE_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);
        config.roster = lookup("ARENA_ROSTER").map(|names| {
            names
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        });
        if let Some(seed) = parse(&lookup, "ARENA_SEED")? {
            config.seed = seed;
        }

        config.auth = AuthConfig::from_lookup(&lookup);
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| invalid(key, &raw, e.to_string()))
}

fn positive<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match parse::<T, F>(lookup, key)? {
        Some(value) if value <= T::default() => Err(invalid(
            key,
            &lookup(key).unwrap_or_default(),
            "must be greater than zero".into(),
        )),
        other => Ok(other),
    }
}

fn finite<F>(lookup: &F, key: &str) -> Result<Option<f64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse::<f64, F>(lookup, key)? {
        Some(value) if !value.is_finite() => Err(invalid(
            key,
            &lookup(key).unwrap_or_default(),
            "must be finite".into(),
        )),
        other => Ok(other),
    }
}

fn invalid(key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    }
}

fn time_seed() -> u64 {
    Utc::now().timestamp_micros().unsigned_abs()
}
