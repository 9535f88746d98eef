//! Network Layer
//!
//! WebSocket gateway, wire protocol, broadcast fan-out and the HTTP
//! surface. Round truth lives in `round/`; this layer only relays it.

pub mod auth;
pub mod broadcast;
pub mod http;
pub mod projection;
pub mod protocol;
pub mod server;
pub mod session;

pub use auth::{AuthConfig, AuthError, AuthVerifier, Identity, JwtVerifier, TokenClaims, validate_token};
pub use broadcast::{BroadcastBus, Frame};
pub use projection::{displayed_countdown, RoundProjection};
pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use server::{ArenaServer, ArenaServerError, ServerConfig};
pub use session::{ConnectionId, SessionConfig, SessionError, SessionManager};
