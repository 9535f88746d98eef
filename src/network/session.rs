//! Connection Sessions
//!
//! Bookkeeping for live WebSocket connections: which participant (if any)
//! each connection authenticated as, and when it last showed signs of life.
//! A participant may hold several connections; it counts as connected until
//! the last one closes. Disconnecting never touches the participant's mode.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::round::state::ParticipantId;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Liveness and queue settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Expected client heartbeat period.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before the connection is dropped.
    pub missed_heartbeats: u32,
    /// Outbound frames queued per connection.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            outbound_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Silence after which a connection is treated as lost.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Connection id not known (already closed).
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Connection already bound to another participant.
    #[error("Connection already authenticated as {0}")]
    AlreadyAuthenticated(ParticipantId),
}

/// A live connection.
#[derive(Debug)]
pub struct Connection {
    /// Connection id.
    pub id: ConnectionId,
    /// Authenticated participant, if any.
    pub participant: Option<ParticipantId>,
    /// Last inbound message.
    pub last_heartbeat: Instant,
}

/// Tracks every live connection.
pub struct SessionManager {
    config: SessionConfig,
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
}

impl SessionManager {
    /// Create a session manager.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Active settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a new, unauthenticated connection.
    pub async fn open(&self) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut connections = self.connections.write().await;
        connections.insert(id, Connection {
            id,
            participant: None,
            last_heartbeat: Instant::now(),
        });
        id
    }

    /// Bind a connection to a participant.
    ///
    /// Returns true when this is the participant's only live connection.
    pub async fn authenticate(
        &self,
        id: ConnectionId,
        participant: ParticipantId,
    ) -> Result<bool, SessionError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or(SessionError::UnknownConnection(id))?;

        match connection.participant {
            Some(existing) if existing != participant => {
                return Err(SessionError::AlreadyAuthenticated(existing));
            }
            Some(_) => return Ok(false),
            None => connection.participant = Some(participant),
        }
        connection.last_heartbeat = Instant::now();

        let live = connections
            .values()
            .filter(|c| c.participant == Some(participant))
            .count();
        Ok(live == 1)
    }

    /// Record a sign of life. Returns false for unknown connections.
    pub async fn heartbeat(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(&id) {
            Some(connection) => {
                connection.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Participant bound to a connection.
    pub async fn participant_of(&self, id: ConnectionId) -> Option<ParticipantId> {
        let connections = self.connections.read().await;
        connections.get(&id).and_then(|c| c.participant)
    }

    /// Whether a connection has been silent past the liveness timeout.
    pub async fn is_expired(&self, id: ConnectionId, now: Instant) -> bool {
        let connections = self.connections.read().await;
        match connections.get(&id) {
            Some(c) => now.duration_since(c.last_heartbeat) > self.config.liveness_timeout(),
            None => true,
        }
    }

    /// Remove a connection.
    ///
    /// Returns the participant when this was its last live connection.
    pub async fn close(&self, id: ConnectionId) -> Option<ParticipantId> {
        let mut connections = self.connections.write().await;
        let participant = connections.remove(&id)?.participant?;
        let still_connected = connections
            .values()
            .any(|c| c.participant == Some(participant));
        (!still_connected).then_some(participant)
    }

    /// Live connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Live connections held by one participant.
    pub async fn connections_for(&self, participant: &ParticipantId) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.participant.as_ref() == Some(participant))
            .count()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> ParticipantId {
        ParticipantId::new([n; 16])
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let manager = SessionManager::default();
        let id = manager.open().await;

        assert_eq!(manager.connection_count().await, 1);
        assert_eq!(manager.participant_of(id).await, None);
        // Anonymous connections have no participant to report
        assert_eq!(manager.close(id).await, None);
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_last_connection_reports_participant() {
        let manager = SessionManager::default();
        let c1 = manager.open().await;
        let c2 = manager.open().await;

        assert_eq!(manager.authenticate(c1, pid(1)).await, Ok(true));
        assert_eq!(manager.authenticate(c2, pid(1)).await, Ok(false));
        assert_eq!(manager.connections_for(&pid(1)).await, 2);

        assert_eq!(manager.close(c1).await, None);
        assert_eq!(manager.close(c2).await, Some(pid(1)));
    }

    #[tokio::test]
    async fn test_cannot_switch_identity() {
        let manager = SessionManager::default();
        let id = manager.open().await;

        manager.authenticate(id, pid(1)).await.unwrap();
        assert_eq!(manager.authenticate(id, pid(1)).await, Ok(false));
        assert_eq!(
            manager.authenticate(id, pid(2)).await,
            Err(SessionError::AlreadyAuthenticated(pid(1)))
        );
        assert_eq!(
            manager.authenticate(Uuid::nil(), pid(1)).await,
            Err(SessionError::UnknownConnection(Uuid::nil()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_expire() {
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            ..Default::default()
        };
        let manager = SessionManager::new(config);
        let id = manager.open().await;

        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(!manager.is_expired(id, Instant::now()).await);
        assert!(manager.heartbeat(id).await);

        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(!manager.is_expired(id, Instant::now()).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(manager.is_expired(id, Instant::now()).await);

        // Closed connections count as expired
        manager.close(id).await;
        assert!(manager.is_expired(id, Instant::now()).await);
    }

    #[test]
    fn test_liveness_timeout() {
        let config = SessionConfig::default();
        assert_eq!(config.liveness_timeout(), Duration::from_secs(15));
    }
}
