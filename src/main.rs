//! Versus Oracle Server
//!
//! Runs the round driver, the WebSocket gateway and the HTTP surface until
//! Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use versus_oracle::{
    arena::Arena,
    config::ArenaConfig,
    core::clock::Clock,
    network::{auth::JwtVerifier, http, server::ArenaServer},
    round::{
        resolver::SeededDuelSimulator,
        selector::{CompetitorSelector, RosterSelector},
        store::{JsonFileStore, MemoryStore, RoundStore},
    },
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ArenaConfig::from_env().context("invalid configuration")?;

    info!("Versus Oracle Server v{}", VERSION);
    info!(
        "Rounds: {}s guessing, {}s results; resolver timeout {:?}",
        config.round.guess_secs, config.round.results_secs, config.resolver.timeout
    );

    let store: Arc<dyn RoundStore> = match &config.store_dir {
        Some(dir) => Arc::new(
            JsonFileStore::open(dir)
                .with_context(|| format!("cannot open store at {}", dir.display()))?,
        ),
        None => {
            warn!("ARENA_STORE_DIR not set; ratings and history are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    if !config.auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; authentication will be refused");
    }

    let selector: Box<dyn CompetitorSelector> = match &config.roster {
        Some(names) => Box::new(RosterSelector::new(names, config.seed).context("invalid ARENA_ROSTER")?),
        None => Box::new(RosterSelector::with_default_roster(config.seed)),
    };

    let arena = Arena::open(
        &config,
        store,
        Arc::new(JwtVerifier::new(config.auth.clone())),
        Arc::new(SeededDuelSimulator::default()),
        selector,
    )
    .await
    .context("failed to restore arena state")?;

    let ws_server = ArenaServer::bind(config.server.clone(), arena.clone()).await?;
    let driver = tokio::spawn(arena.clone().run(Clock::every_second()));
    let ws_task = tokio::spawn(ws_server.run());
    let http_task = tokio::spawn(http::serve(config.server.http_addr, arena.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    arena.shutdown();

    let (driver, ws, http) = tokio::join!(driver, ws_task, http_task);
    driver?;
    ws??;
    http??;

    info!("Server stopped");
    Ok(())
}
