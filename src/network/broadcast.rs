//! Broadcast Bus
//!
//! One-to-many fan-out of server messages. Each message is serialized once
//! and every connection receives the same `Arc<String>` frame.
//!
//! ```text
//! driver ──→ publish(ServerMessage) ──→ broadcast::Sender<Frame>
//!                                          │
//!                                    ┌─────┼─────┐
//!                                    ▼     ▼     ▼
//!                                  conn1 conn2 conn3
//! ```
//!
//! A receiver that falls more than `capacity` frames behind gets
//! `RecvError::Lagged`; the connection answers that with a fresh
//! `round-state` instead of dropping the client.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::error;

use crate::network::protocol::ServerMessage;

/// A serialized message shared by every receiver.
pub type Frame = Arc<String>;

/// Default frames buffered per receiver (about a minute of ticks).
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Broadcast bus. Clone freely.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Frame>,
}

impl BroadcastBus {
    /// Create a bus buffering `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Serialize once and send to every subscriber.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, msg: &ServerMessage) -> usize {
        match encode(msg) {
            Some(frame) => self.publish_frame(frame),
            None => 0,
        }
    }

    /// Send an already-serialized frame.
    pub fn publish_frame(&self, frame: Frame) -> usize {
        // No receivers is not an error
        self.tx.send(frame).unwrap_or(0)
    }

    /// Subscribe to future frames.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }

    /// Current subscriber count.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Serialize a message into a frame, logging failures.
pub fn encode(msg: &ServerMessage) -> Option<Frame> {
    match msg.to_json() {
        Ok(text) => Some(Arc::new(text)),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::state::Phase;
    use tokio::sync::broadcast::error::RecvError;

    fn tick(n: u32) -> ServerMessage {
        ServerMessage::Tick {
            round_number: 1,
            phase: Phase::Guessing,
            time_remaining: n,
        }
    }

    #[tokio::test]
    async fn test_all_subscribers_share_frame() {
        let bus = BroadcastBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(&tick(30)), 2);

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&f1, &f2));
        assert!(f1.contains("\"timeRemaining\":30"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = BroadcastBus::default();
        assert_eq!(bus.receiver_count(), 0);
        assert_eq!(bus.publish(&tick(1)), 0);
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let bus = BroadcastBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(&tick(n));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        // After the lag the receiver continues with the oldest retained frame
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"timeRemaining\":3"));
    }
}
