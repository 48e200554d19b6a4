use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use dashmap::DashMap;
use lobby_core::{ConnectionId, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A bound WebSocket connection.
pub struct Connection {
    pub id: ConnectionId,
    pub session_id: SessionId,
    tx: mpsc::Sender<Message>,
    last_seen: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Connection {
    fn new(id: ConnectionId, session_id: SessionId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            session_id,
            tx,
            last_seen: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    /// Any inbound frame (pong or data) proves the peer is alive.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        Instant::now().saturating_duration_since(*self.last_seen.lock()) < timeout
    }

    /// Fires when the server wants this connection torn down.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Registry of all bound connections, keyed by connection id.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout,
        }
    }

    /// Track a connection and return it with the receiving end of its
    /// outbound queue.
    pub fn register(
        &self,
        id: ConnectionId,
        session_id: SessionId,
    ) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(id.clone(), session_id, tx));
        let _ = self.connections.insert(id, Arc::clone(&conn));
        (conn, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Queue a frame for every connection bound to `session_id` except
    /// `except`. Returns how many queues accepted it.
    pub fn broadcast_to_session(
        &self,
        session_id: &SessionId,
        message: &Message,
        except: Option<&ConnectionId>,
    ) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|e| &e.value().session_id == session_id && Some(e.key()) != except)
            .map(|e| Arc::clone(e.value()))
            .collect();
        targets
            .iter()
            .filter(|conn| enqueue(conn, message.clone()))
            .count()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Cancel and forget connections that stopped answering heartbeats. The
    /// connection task notices the cancellation and releases its participant.
    pub fn cleanup_dead(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|e| !e.value().is_alive(self.client_timeout))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if let Some((_, conn)) = self.connections.remove(&id) {
                conn.cancel.cancel();
                removed += 1;
                tracing::info!(connection_id = %id, session_id = %conn.session_id, "Cleaned up dead connection");
            }
        }
        removed
    }

    /// Cancel every connection, used on shutdown.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            entry.value().cancel.cancel();
            closed += 1;
        }
        closed
    }
}

fn enqueue(conn: &Connection, message: Message) -> bool {
    match conn.tx.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(connection_id = %conn.id, "Send queue full, dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Start a background task that periodically cleans up dead connections.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead();
                    if removed > 0 {
                        tracing::info!(removed, "Dead connection cleanup");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Message {
        Message::Text(s.to_string().into())
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new(8, Duration::from_secs(60));
        let (a, _rx_a) = registry.register(ConnectionId::new(), sid("sess_1"));
        let (b, _rx_b) = registry.register(ConnectionId::new(), sid("sess_1"));
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister(&a.id));
        assert!(!registry.unregister(&a.id));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.broadcast_to_session(&sid("sess_1"), &text("x"), Some(&b.id)), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_session_members() {
        let registry = ConnectionRegistry::new(8, Duration::from_secs(60));
        let (_conn, mut rx) = registry.register(ConnectionId::new(), sid("sess_1"));
        assert_eq!(registry.broadcast_to_session(&sid("sess_1"), &text("hello"), None), 1);
        assert_eq!(rx.recv().await.unwrap(), text("hello"));
        assert_eq!(registry.broadcast_to_session(&sid("sess_9"), &text("nobody"), None), 0);
    }

    #[test]
    fn full_queue_drops() {
        let registry = ConnectionRegistry::new(2, Duration::from_secs(60));
        let (_conn, _rx) = registry.register(ConnectionId::new(), sid("sess_1"));
        let session = sid("sess_1");
        assert_eq!(registry.broadcast_to_session(&session, &text("1"), None), 1);
        assert_eq!(registry.broadcast_to_session(&session, &text("2"), None), 1);
        assert_eq!(registry.broadcast_to_session(&session, &text("3"), None), 0);
    }

    #[test]
    fn broadcast_skips_sender_and_other_sessions() {
        let registry = ConnectionRegistry::new(8, Duration::from_secs(60));
        let (a, mut rx_a) = registry.register(ConnectionId::new(), sid("sess_1"));
        let (_b, mut rx_b) = registry.register(ConnectionId::new(), sid("sess_1"));
        let (_c, mut rx_c) = registry.register(ConnectionId::new(), sid("sess_2"));

        let delivered = registry.broadcast_to_session(&sid("sess_1"), &text("hi"), Some(&a.id));
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), text("hi"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_silent_connections() {
        let registry = ConnectionRegistry::new(8, Duration::from_secs(90));
        let (quiet, _rx1) = registry.register(ConnectionId::new(), sid("sess_1"));
        let (chatty, _rx2) = registry.register(ConnectionId::new(), sid("sess_1"));
        let quiet_token = quiet.cancelled();

        tokio::time::advance(Duration::from_secs(60)).await;
        chatty.touch();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(registry.cleanup_dead(), 1);
        assert!(quiet_token.is_cancelled());
        assert!(!chatty.cancelled().is_cancelled());
        assert_eq!(registry.count(), 1);
        assert!(!registry.unregister(&quiet.id));
        assert!(registry.unregister(&chatty.id));
    }

    #[test]
    fn close_all_cancels_everything() {
        let registry = ConnectionRegistry::new(8, Duration::from_secs(60));
        let (a, _rx_a) = registry.register(ConnectionId::new(), sid("sess_1"));
        let (b, _rx_b) = registry.register(ConnectionId::new(), sid("sess_2"));
        assert_eq!(registry.close_all(), 2);
        assert!(a.cancelled().is_cancelled());
        assert!(b.cancelled().is_cancelled());
    }
}
