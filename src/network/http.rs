//! HTTP Surface
//!
//! Request/response endpoints next to the WebSocket stream. Handlers read
//! through the shared `Arena`; nothing here mutates round state except
//! join and leave, which only record intent.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Liveness and counters |
//! | GET | `/round` | Snapshot of the live round |
//! | GET | `/rounds/:number/results` | Result of a closed round |
//! | GET | `/leaderboard?limit=` | Ranked participants |
//! | GET | `/users/:identity/stats` | One participant's statistics |
//! | POST | `/join` | Play from the next round (bearer token) |
//! | POST | `/leave` | Spectate from the next round (bearer token) |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::arena::Arena;
use crate::network::auth::{bearer_token, Identity};
use crate::network::protocol::ErrorCode;
use crate::round::registry::RegistryError;
use crate::round::state::ParticipantId;

/// Shared handler state.
pub type AppState = Arc<Arena>;

type HandlerResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// Default leaderboard size.
const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Build the router.
pub fn create_router(arena: Arc<Arena>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/round", get(handle_get_round))
        .route("/rounds/:number/results", get(handle_get_round_results))
        .route("/leaderboard", get(handle_get_leaderboard))
        .route("/users/:identity/stats", get(handle_get_user_stats))
        .route("/join", post(handle_join))
        .route("/leave", post(handle_leave))
        .layer(cors)
        .with_state(arena)
}

/// Serve the router until the arena shuts down.
pub async fn serve(addr: SocketAddr, arena: Arc<Arena>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    let mut shutdown_rx = arena.subscribe_shutdown();
    axum::serve(listener, create_router(arena))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    #[serde(default)]
    limit: Option<usize>,
}

fn error_response(status: StatusCode, code: ErrorCode, msg: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "code": code, "error": msg })))
}

fn to_body<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map(Json).map_err(|e| {
        error!("Failed to serialize response: {}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, "serialization failed")
    })
}

/// Resolve the caller from the `Authorization` header.
fn authorize(arena: &Arena, headers: &HeaderMap) -> Result<Identity, (StatusCode, Json<Value>)> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, ErrorCode::NotAuthenticated, "missing bearer token")
        })?;

    arena.verify(token).map_err(|e| {
        error_response(StatusCode::UNAUTHORIZED, ErrorCode::AuthenticationFailed, &e.to_string())
    })
}

// ── GET handlers ────────────────────────────────────────────────────

async fn handle_health(State(arena): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "version": crate::VERSION,
        "startedAt": arena.started_at(),
        "connections": arena.sessions().connection_count().await,
    }))
}

async fn handle_get_round(State(arena): State<AppState>) -> HandlerResult {
    to_body(&arena.snapshot().await)
}

async fn handle_get_round_results(
    State(arena): State<AppState>,
    Path(number): Path<u64>,
) -> HandlerResult {
    match arena.round_results(number).await {
        Ok(Some(result)) => to_body(&result),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            ErrorCode::InvalidValue,
            "round not found or not yet closed",
        )),
        Err(e) => {
            error!("Failed to load round {}: {}", number, e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, "store unavailable"))
        }
    }
}

async fn handle_get_leaderboard(
    State(arena): State<AppState>,
    Query(params): Query<LeaderboardQuery>,
) -> HandlerResult {
    let entries = arena
        .leaderboard(params.limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT))
        .await;
    to_body(&entries)
}

async fn handle_get_user_stats(
    State(arena): State<AppState>,
    Path(identity): Path<String>,
) -> HandlerResult {
    let id: ParticipantId = identity.parse().map_err(|e: crate::round::state::IdParseError| {
        error_response(StatusCode::BAD_REQUEST, ErrorCode::InvalidValue, &e.to_string())
    })?;

    match arena.user_stats(&id).await {
        Some(stats) => to_body(&stats),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            ErrorCode::UnknownParticipant,
            "unknown participant",
        )),
    }
}

// ── POST handlers ───────────────────────────────────────────────────

async fn handle_join(State(arena): State<AppState>, headers: HeaderMap) -> HandlerResult {
    let identity = authorize(&arena, &headers)?;
    to_body(&arena.join(&identity).await)
}

async fn handle_leave(State(arena): State<AppState>, headers: HeaderMap) -> HandlerResult {
    let identity = authorize(&arena, &headers)?;
    match arena.leave(&identity.participant).await {
        Ok(response) => to_body(&response),
        Err(e @ RegistryError::UnknownParticipant(_)) => Err(error_response(
            StatusCode::NOT_FOUND,
            ErrorCode::from(&e),
            &e.to_string(),
        )),
        Err(e) => Err(error_response(StatusCode::BAD_REQUEST, ErrorCode::from(&e), &e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::network::auth::{AuthError, AuthVerifier};
    use crate::round::resolver::SeededDuelSimulator;
    use crate::round::selector::RosterSelector;
    use crate::round::store::MemoryStore;
    use axum::http::HeaderValue;

    /// Accepts any token and uses it as the display name.
    struct NameVerifier;

    impl AuthVerifier for NameVerifier {
        fn verify(&self, token: &str) -> Result<Identity, AuthError> {
            if token == "bad" {
                return Err(AuthError::InvalidSignature);
            }
            let mut id = [0u8; 16];
            id[..token.len().min(16)].copy_from_slice(&token.as_bytes()[..token.len().min(16)]);
            Ok(Identity {
                participant: ParticipantId::new(id),
                display_name: token.to_string(),
            })
        }
    }

    async fn test_arena() -> Arc<Arena> {
        Arena::open(
            &ArenaConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(NameVerifier),
            Arc::new(SeededDuelSimulator::default()),
            Box::new(RosterSelector::with_default_roster(1)),
        )
        .await
        .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_round_snapshot() {
        let arena = test_arena().await;
        let Json(body) = handle_get_round(State(arena)).await.unwrap();
        assert_eq!(body["round"]["number"], 1);
        assert_eq!(body["round"]["phase"], "guessing");
        assert_eq!(body["totalParticipants"], 0);
    }

    #[tokio::test]
    async fn test_join_requires_token() {
        let arena = test_arena().await;

        let (status, _) = handle_join(State(arena.clone()), HeaderMap::new()).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, Json(body)) = handle_join(State(arena), bearer("bad")).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "authentication_failed");
    }

    #[tokio::test]
    async fn test_join_then_leave() {
        let arena = test_arena().await;

        let Json(body) = handle_join(State(arena.clone()), bearer("alice")).await.unwrap();
        assert_eq!(body["currentMode"], "spectating");
        assert_eq!(body["pendingMode"], "playing");
        assert_eq!(body["effectiveRound"], 2);

        let Json(body) = handle_leave(State(arena), bearer("alice")).await.unwrap();
        assert_eq!(body["pendingMode"], Value::Null);
    }

    #[tokio::test]
    async fn test_leave_unknown_participant() {
        let arena = test_arena().await;
        let (status, Json(body)) = handle_leave(State(arena), bearer("nobody")).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "unknown_participant");
    }

    #[tokio::test]
    async fn test_missing_round_results() {
        let arena = test_arena().await;
        let (status, _) = handle_get_round_results(State(arena), Path(5)).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_user_stats_lookup() {
        let arena = test_arena().await;
        let (status, _) = handle_get_user_stats(State(arena.clone()), Path("zz".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let Json(joined) = handle_join(State(arena.clone()), bearer("carol")).await.unwrap();
        let identity = joined["identity"].as_str().unwrap().to_string();
        let Json(stats) = handle_get_user_stats(State(arena), Path(identity)).await.unwrap();
        assert_eq!(stats["displayName"], "carol");
        assert_eq!(stats["gamesPlayed"], 0);
        assert_eq!(stats["pendingMode"], "playing");
        assert_eq!(stats["rank"], Value::Null);
    }

    #[tokio::test]
    async fn test_empty_leaderboard_and_health() {
        let arena = test_arena().await;
        let Json(board) = handle_get_leaderboard(State(arena.clone()), Query(LeaderboardQuery { limit: Some(0) }))
            .await
            .unwrap();
        assert_eq!(board, json!([]));

        let Json(health) = handle_health(State(arena)).await;
        assert_eq!(health["status"], "OK");
        assert_eq!(health["connections"], 0);
    }

    #[tokio::test]
    async fn test_router_builds() {
        let _router = create_router(test_arena().await);
    }
}
