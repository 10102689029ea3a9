//! Connection lifecycle and delivery: three indexes, heartbeat, idle reaper,
//! and fan-out helpers. Frames are only delivered to connections in the
//! `Active` or `Authenticated` states.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use wire_event::{CloseReason, ServerEvent, WireMessage};

use crate::connection::{Connection, ConnectionState};

/// Close codes per the WebSocket protocol: 1000 normal, 1002 protocol error.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
    pub cleanup_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            max_missed_pongs: 3,
            cleanup_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ManagerStats {
    pub connections: usize,
    pub users: usize,
    pub conversations: usize,
}

type DisconnectCallback = Arc<dyn Fn(Arc<Connection>, Option<String>) + Send + Sync>;
type ConnectCallback = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

pub struct ConnectionManager {
    config: ManagerConfig,
    connections: DashMap<String, Arc<Connection>>,
    user_index: DashMap<String, std::collections::HashSet<String>>,
    conversation_index: DashMap<String, std::collections::HashSet<String>>,
    on_connect: std::sync::RwLock<Vec<ConnectCallback>>,
    on_disconnect: std::sync::RwLock<Vec<DisconnectCallback>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections: DashMap::new(),
            user_index: DashMap::new(),
            conversation_index: DashMap::new(),
            on_connect: std::sync::RwLock::new(Vec::new()),
            on_disconnect: std::sync::RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Registers the connection in all three indexes and fires on-connect callbacks.
    pub fn connect(&self, connection: Arc<Connection>) {
        let id = connection.connection_id.clone();
        self.user_index
            .entry(connection.user_id.clone())
            .or_default()
            .insert(id.clone());
        self.conversation_index
            .entry(connection.conversation_id.clone())
            .or_default()
            .insert(id.clone());
        self.connections.insert(id, Arc::clone(&connection));

        connection.set_state(ConnectionState::Authenticated);
        if let Ok(callbacks) = self.on_connect.read() {
            for callback in callbacks.iter() {
                callback(Arc::clone(&connection));
            }
        }
        tracing::info!(
            connection_id = %connection.connection_id,
            user_id = %connection.user_id,
            "connection registered"
        );
    }

    /// Sends a close frame, removes the connection from every index, and fires
    /// on-disconnect callbacks. Unknown reasons map into the closed reason set.
    pub fn disconnect(&self, connection_id: &str, reason: Option<&str>, code: u16) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return;
        };
        connection.set_state(ConnectionState::Closing);

        let close_reason = CloseReason::from_reason(reason.unwrap_or("idle_timeout"));
        // Direct queue write: the connection is already out of the deliverable states.
        let _ = connection.try_send(
            WireMessage::new(ServerEvent::ConnectionClose {
                reason: close_reason,
                code,
            })
            .with_conversation_id(connection.conversation_id.clone()),
        );

        self.cleanup_indexes(&connection);
        connection.set_state(ConnectionState::Closed);

        if let Ok(callbacks) = self.on_disconnect.read() {
            for callback in callbacks.iter() {
                callback(Arc::clone(&connection), reason.map(str::to_string));
            }
        }
        tracing::info!(
            connection_id = %connection.connection_id,
            reason = reason.unwrap_or("none"),
            code,
            "connection removed"
        );
    }

    fn cleanup_indexes(&self, connection: &Connection) {
        if let Some(mut set) = self.user_index.get_mut(&connection.user_id) {
            set.remove(&connection.connection_id);
        }
        self.user_index
            .remove_if(&connection.user_id, |_, set| set.is_empty());
        if let Some(mut set) = self.conversation_index.get_mut(&connection.conversation_id) {
            set.remove(&connection.connection_id);
        }
        self.conversation_index
            .remove_if(&connection.conversation_id, |_, set| set.is_empty());
    }

    /// Delivers one frame. Connections outside `Active`/`Authenticated` never
    /// receive frames.
    pub fn send_to_connection(&self, connection_id: &str, message: WireMessage) -> bool {
        let Some(connection) = self.connections.get(connection_id) else {
            return false;
        };
        if !connection.state().can_receive_frames() {
            return false;
        }
        connection.try_send(message)
    }

    /// Delivers to every connection of one user; returns the delivery count.
    pub fn send_to_user(&self, user_id: &str, message: &WireMessage) -> usize {
        self.fan_out(self.user_index.get(user_id).map(|s| s.clone()), message)
    }

    /// Delivers to every connection of one conversation; returns the delivery count.
    pub fn broadcast_to_conversation(&self, conversation_id: &str, message: &WireMessage) -> usize {
        self.fan_out(
            self.conversation_index
                .get(conversation_id)
                .map(|s| s.clone()),
            message,
        )
    }

    pub fn broadcast_all(&self, message: &WireMessage) -> usize {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter(|id| self.send_to_connection(id, message.clone()))
            .count()
    }

    fn fan_out(
        &self,
        ids: Option<std::collections::HashSet<String>>,
        message: &WireMessage,
    ) -> usize {
        ids.map(|ids| {
            ids.iter()
                .filter(|id| self.send_to_connection(id, message.clone()))
                .count()
        })
        .unwrap_or(0)
    }

    pub fn handle_pong(&self, connection_id: &str) {
        if let Some(connection) = self.connections.get(connection_id) {
            connection.record_pong_received();
        }
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| Arc::clone(&c))
    }

    pub fn user_connections(&self, user_id: &str) -> Vec<String> {
        self.user_index
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_stats(&self) -> ManagerStats {
        ManagerStats {
            connections: self.connections.len(),
            users: self.user_index.len(),
            conversations: self.conversation_index.len(),
        }
    }

    pub fn on_connect(&self, callback: ConnectCallback) {
        if let Ok(mut callbacks) = self.on_connect.write() {
            callbacks.push(callback);
        }
    }

    pub fn on_disconnect(&self, callback: DisconnectCallback) {
        if let Ok(mut callbacks) = self.on_disconnect.write() {
            callbacks.push(callback);
        }
    }

    /// Spawns the heartbeat and idle-reaper tasks.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.heartbeat_sweep(),
                }
            }
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.reap_idle(),
                }
            }
        });
    }

    /// One heartbeat pass: count a missed pong for any unanswered ping, then
    /// disconnect or ping each active connection.
    pub fn heartbeat_sweep(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some(connection) = self.get_connection(&id) else {
                continue;
            };
            if connection.state() != ConnectionState::Active {
                continue;
            }
            if connection.ping_unanswered() {
                let missed = connection.record_missed_pong();
                if missed >= self.config.max_missed_pongs {
                    tracing::warn!(connection_id = %id, missed, "heartbeat timeout");
                    self.disconnect(&id, Some("heartbeat_timeout"), CLOSE_PROTOCOL_ERROR);
                    continue;
                }
            }
            let sent = self.send_to_connection(
                &id,
                WireMessage::new(ServerEvent::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                }),
            );
            if sent {
                connection.record_ping_sent();
            }
        }
    }

    /// One reaper pass: close exactly the connections idle past the timeout.
    pub fn reap_idle(&self) {
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.value().idle_seconds() > self.config.idle_timeout.as_secs_f64())
            .map(|e| e.key().clone())
            .collect();
        for id in idle {
            tracing::info!(connection_id = %id, "closing idle connection");
            self.disconnect(&id, Some("idle_timeout"), CLOSE_NORMAL);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id, Some("server_shutdown"), CLOSE_NORMAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_connection(
        id: &str,
        user: &str,
        conversation: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(id, user, conversation, "token", tx));
        (conn, rx)
    }

    #[tokio::test]
    async fn connect_indexes_by_user_and_conversation() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        let (a, _rx_a) = make_connection("c1", "u1", "conv1");
        let (b, _rx_b) = make_connection("c2", "u1", "conv2");
        manager.connect(a);
        manager.connect(b);

        let stats = manager.get_stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.users, 1);
        assert_eq!(stats.conversations, 2);
        assert_eq!(manager.user_connections("u1").len(), 2);
    }

    #[tokio::test]
    async fn send_respects_connection_state() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        let (conn, mut rx) = make_connection("c1", "u1", "conv1");
        manager.connect(Arc::clone(&conn));

        // Authenticated: deliverable.
        assert!(manager.send_to_connection("c1", WireMessage::new(ServerEvent::Ping { timestamp: 1 })));
        assert!(rx.recv().await.is_some());

        conn.set_state(ConnectionState::Closing);
        assert!(!manager.send_to_connection("c1", WireMessage::new(ServerEvent::Ping { timestamp: 2 })));
    }

    #[tokio::test]
    async fn disconnect_removes_from_user_index() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        let (conn, _rx) = make_connection("c1", "u1", "conv1");
        manager.connect(conn);
        manager.disconnect("c1", Some("user_logout"), CLOSE_NORMAL);

        assert!(manager.get_connection("c1").is_none());
        assert!(manager.user_connections("u1").is_empty());
        assert_eq!(manager.get_stats().connections, 0);
    }

    #[tokio::test]
    async fn heartbeat_disconnects_after_max_missed_pongs() {
        let manager = ConnectionManager::new(ManagerConfig {
            ping_interval: Duration::from_secs(1),
            max_missed_pongs: 2,
            ..Default::default()
        });
        let (conn, mut rx) = make_connection("c1", "u1", "conv1");
        manager.connect(Arc::clone(&conn));
        conn.set_state(ConnectionState::Active);

        // Sweep 1: ping sent, client answers.
        manager.heartbeat_sweep();
        assert!(rx.recv().await.is_some());
        manager.handle_pong("c1");

        // Sweep 2: ping sent, no answer.
        manager.heartbeat_sweep();
        assert_eq!(conn.missed_pongs(), 0);

        // Sweep 3: missed #1, still connected, ping re-sent.
        manager.heartbeat_sweep();
        assert_eq!(conn.missed_pongs(), 1);
        assert!(manager.get_connection("c1").is_some());

        // Sweep 4: missed #2 reaches the cap; disconnected with 1002.
        manager.heartbeat_sweep();
        assert!(manager.get_connection("c1").is_none());
        assert!(manager.user_connections("u1").is_empty());

        // Close frame carried the protocol-error code.
        let mut saw_close = false;
        while let Ok(msg) = rx.try_recv() {
            if let ServerEvent::ConnectionClose { code, reason } = msg.event {
                assert_eq!(code, CLOSE_PROTOCOL_ERROR);
                assert_eq!(reason, CloseReason::IdleTimeout); // heartbeat_timeout maps into the closed set
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn reaper_closes_only_idle_connections() {
        let manager = ConnectionManager::new(ManagerConfig {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let (idle, _rx_idle) = make_connection("idle", "u1", "conv1");
        let (fresh, _rx_fresh) = make_connection("fresh", "u2", "conv2");
        manager.connect(Arc::clone(&idle));
        manager.connect(Arc::clone(&fresh));

        tokio::time::sleep(Duration::from_millis(80)).await;
        fresh.touch();
        manager.reap_idle();

        assert!(manager.get_connection("idle").is_none());
        assert!(manager.get_connection("fresh").is_some());
    }

    #[tokio::test]
    async fn callbacks_fire_on_lifecycle_edges() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        let connects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let disconnects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&connects);
        manager.on_connect(Arc::new(move |_conn| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        let d = Arc::clone(&disconnects);
        manager.on_disconnect(Arc::new(move |_conn, _reason| {
            d.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let (conn, _rx) = make_connection("c1", "u1", "conv1");
        manager.connect(conn);
        manager.disconnect("c1", Some("user_logout"), CLOSE_NORMAL);
        assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
