//! WebSocket Server
//!
//! Accepts client connections and bridges them to the arena. Each connection
//! gets an outbound queue drained by its own writer task; the read loop
//! multiplexes client messages, broadcast frames, the heartbeat watchdog
//! and the shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::arena::Arena;
use crate::network::broadcast::{encode, Frame, DEFAULT_BUS_CAPACITY};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::session::{ConnectionId, SessionError};
use crate::round::state::ParticipantMode;

/// Time allowed for queued frames to flush after a connection ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub bind_addr: SocketAddr,
    /// HTTP bind address.
    pub http_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Frames buffered per broadcast receiver.
    pub broadcast_capacity: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            max_connections: 1000,
            broadcast_capacity: DEFAULT_BUS_CAPACITY,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ArenaServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// The WebSocket server.
pub struct ArenaServer {
    config: ServerConfig,
    arena: Arc<Arena>,
    listener: TcpListener,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ArenaServer {
    /// Bind the listener.
    pub async fn bind(config: ServerConfig, arena: Arc<Arena>) -> Result<Self, ArenaServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let shutdown_rx = arena.subscribe_shutdown();
        Ok(Self { config, arena, listener, shutdown_rx })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ArenaServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown.
    #[instrument(skip_all)]
    pub async fn run(mut self) -> Result<(), ArenaServerError> {
        info!("WebSocket server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.arena.sessions().connection_count().await;
                            if count >= self.config.max_connections {
                                warn!("{} ({}), rejecting {}", ArenaServerError::ConnectionLimitReached, count, addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            tokio::spawn(handle_connection(stream, addr, self.arena.clone()));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("WebSocket server stopping");
                    break;
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Serve one WebSocket connection until it closes.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, arena: Arc<Arena>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let sessions = arena.sessions();
    let capacity = sessions.config().outbound_capacity.max(1);
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(capacity);

    // Subscribe before the snapshot so nothing falls between them
    let mut bus_rx = arena.bus().subscribe();
    let mut shutdown_rx = arena.subscribe_shutdown();
    let conn = sessions.open().await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sender.send(Message::Text(frame.as_str().to_owned())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    resync(&arena, &out_tx).await;

    let mut watchdog = interval(sessions.config().heartbeat_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut outbound = Outbound::new(out_tx.clone());

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        sessions.heartbeat(conn).await;
                        match ClientMessage::from_json(&text) {
                            Ok(client_msg) => handle_client_message(conn, client_msg, &arena, &out_tx).await,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                reply(&out_tx, &ServerMessage::error(
                                    ErrorCode::InvalidMessage,
                                    "Invalid message format",
                                )).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        sessions.heartbeat(conn).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
            frame = bus_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if !outbound.forward(&arena, frame).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Connection {} lagged by {} frames; resyncing", addr, skipped);
                        outbound.lagged(&arena).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = watchdog.tick() => {
                if sessions.is_expired(conn, Instant::now()).await {
                    info!("Connection {} lost: no heartbeat for {:?}", addr, sessions.config().liveness_timeout());
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                reply(&out_tx, &ServerMessage::Shutdown {
                    reason: "Server shutting down".to_string(),
                }).await;
                break;
            }
        }
    }

    // Cleanup
    if let Some(participant) = sessions.close(conn).await {
        arena.disconnect(&participant).await;
        debug!("Participant {} has no live connections", participant.short());
    }
    drop(outbound);
    drop(out_tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        debug!("Writer for {} did not flush in time", addr);
    }

    debug!("Client {} cleaned up", addr);
}

/// Broadcast side of one connection.
///
/// Frames are queued without waiting. Once a frame has been dropped for a
/// full queue or a lagging receiver, the next delivery is preceded by a fresh
/// `round-state` so the client never acts on a gap.
struct Outbound {
    tx: mpsc::Sender<Frame>,
    needs_resync: bool,
}

impl Outbound {
    fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx, needs_resync: false }
    }

    /// Queue one broadcast frame. Returns false once the writer is gone.
    async fn forward(&mut self, arena: &Arena, frame: Frame) -> bool {
        if self.needs_resync {
            self.needs_resync = !resync(arena, &self.tx).await;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.needs_resync {
                    warn!("Outbound queue full; will resync");
                }
                self.needs_resync = true;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// The bus dropped frames for this receiver.
    async fn lagged(&mut self, arena: &Arena) {
        self.needs_resync = !resync(arena, &self.tx).await;
    }
}

/// Dispatch one parsed client message.
async fn handle_client_message(
    conn: ConnectionId,
    msg: ClientMessage,
    arena: &Arena,
    sender: &mpsc::Sender<Frame>,
) {
    match msg {
        ClientMessage::Authenticate { token } => {
            handle_authenticate(conn, &token, arena, sender).await;
        }
        ClientMessage::SubmitGuess { round_number, value } => {
            handle_submit_guess(conn, round_number, value, arena, sender).await;
        }
        ClientMessage::SetMode { mode } => {
            handle_set_mode(conn, mode, arena, sender).await;
        }
        ClientMessage::Heartbeat => {}
        ClientMessage::SyncRequest => {
            reply(sender, &ServerMessage::RoundState(arena.snapshot().await)).await;
        }
    }
}

/// Handle authentication.
async fn handle_authenticate(
    conn: ConnectionId,
    token: &str,
    arena: &Arena,
    sender: &mpsc::Sender<Frame>,
) {
    let identity = match arena.verify(token) {
        Ok(identity) => identity,
        Err(e) => {
            debug!("Authentication failed on {}: {}", conn, e);
            reply(sender, &ServerMessage::Authenticated {
                success: false,
                identity: None,
                display_name: None,
                error: Some(e.to_string()),
            }).await;
            return;
        }
    };

    match arena.sessions().authenticate(conn, identity.participant).await {
        Ok(_) => {
            arena.connect(&identity).await;
            debug!("Connection {} authenticated as {}", conn, identity.participant.short());
            reply(sender, &ServerMessage::Authenticated {
                success: true,
                identity: Some(identity.participant),
                display_name: Some(identity.display_name),
                error: None,
            }).await;
        }
        Err(e @ SessionError::AlreadyAuthenticated(_)) => {
            reply(sender, &ServerMessage::error(ErrorCode::AuthenticationFailed, e.to_string())).await;
        }
        Err(e @ SessionError::UnknownConnection(_)) => {
            error!("{}", e);
            reply(sender, &ServerMessage::error(ErrorCode::InternalError, "Connection not registered")).await;
        }
    }
}

/// Handle a guess.
async fn handle_submit_guess(
    conn: ConnectionId,
    round_number: u64,
    value: f64,
    arena: &Arena,
    sender: &mpsc::Sender<Frame>,
) {
    let Some(participant) = arena.sessions().participant_of(conn).await else {
        reply(sender, &ServerMessage::GuessResult {
            round_number,
            accepted: false,
            error: Some(ErrorCode::NotAuthenticated),
        }).await;
        return;
    };

    let result = arena.submit_guess(participant, round_number, value).await;
    reply(sender, &ServerMessage::GuessResult {
        round_number,
        accepted: result.is_ok(),
        error: result.as_ref().err().map(ErrorCode::from),
    }).await;
}

/// Handle a mode request.
async fn handle_set_mode(
    conn: ConnectionId,
    mode: ParticipantMode,
    arena: &Arena,
    sender: &mpsc::Sender<Frame>,
) {
    let Some(participant) = arena.sessions().participant_of(conn).await else {
        reply(sender, &ServerMessage::error(ErrorCode::NotAuthenticated, "Must authenticate first")).await;
        return;
    };

    match arena.set_mode(&participant, mode).await {
        Ok(effective_round) => {
            reply(sender, &ServerMessage::ModeAck { mode, effective_round }).await;
        }
        Err(e) => {
            reply(sender, &ServerMessage::error(ErrorCode::from(&e), e.to_string())).await;
        }
    }
}

/// Queue a direct reply, waiting for room.
async fn reply(sender: &mpsc::Sender<Frame>, msg: &ServerMessage) {
    if let Some(frame) = encode(msg) {
        let _ = sender.send(frame).await;
    }
}

/// Queue a fresh `round-state` without waiting. Returns false if the queue is full.
async fn resync(arena: &Arena, sender: &mpsc::Sender<Frame>) -> bool {
    let snapshot = ServerMessage::RoundState(arena.snapshot().await);
    match encode(&snapshot) {
        Some(frame) => !matches!(sender.try_send(frame), Err(TrySendError::Full(_))),
        None => true,
    }
}
