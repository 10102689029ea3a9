//! One client connection: identity, lifecycle state, heartbeat bookkeeping,
//! and the outbound frame queue drained by the socket writer task.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use wire_event::WireMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticated = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Authenticated,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Frames are deliverable only in these states.
    pub fn can_receive_frames(self) -> bool {
        matches!(self, Self::Active | Self::Authenticated)
    }
}

pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    pub conversation_id: String,
    /// End-user bearer token, propagated to the Tools Provider.
    pub access_token: String,
    state: AtomicU8,
    outbound: mpsc::Sender<WireMessage>,
    last_ping_sent: Mutex<Option<Instant>>,
    last_pong_received: Mutex<Option<Instant>>,
    missed_pongs: AtomicU32,
    idle_since: Mutex<Instant>,
}

impl Connection {
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        access_token: impl Into<String>,
        outbound: mpsc::Sender<WireMessage>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            access_token: access_token.into(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound,
            last_ping_sent: Mutex::new(None),
            last_pong_received: Mutex::new(None),
            missed_pongs: AtomicU32::new(0),
            idle_since: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Queues a frame for the writer task. Fails when the queue is full or the
    /// writer has gone away.
    pub fn try_send(&self, message: WireMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    pub fn record_ping_sent(&self) {
        if let Ok(mut guard) = self.last_ping_sent.lock() {
            *guard = Some(Instant::now());
        }
    }

    pub fn record_pong_received(&self) {
        if let Ok(mut guard) = self.last_pong_received.lock() {
            *guard = Some(Instant::now());
        }
        self.missed_pongs.store(0, Ordering::SeqCst);
        self.touch();
    }

    /// True when a ping is outstanding with no later pong.
    pub fn ping_unanswered(&self) -> bool {
        let ping = self.last_ping_sent.lock().ok().and_then(|g| *g);
        let pong = self.last_pong_received.lock().ok().and_then(|g| *g);
        match (ping, pong) {
            (Some(ping), Some(pong)) => ping > pong,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn record_missed_pong(&self) -> u32 {
        self.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::SeqCst)
    }

    /// Resets the idle clock; called on any client activity.
    pub fn touch(&self) {
        if let Ok(mut guard) = self.idle_since.lock() {
            *guard = Instant::now();
        }
    }

    pub fn idle_seconds(&self) -> f64 {
        self.idle_since
            .lock()
            .map(|g| g.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (Connection::new("c1", "u1", "conv1", "token", tx), rx)
    }

    #[test]
    fn state_transitions_round_trip() {
        let (conn, _rx) = connection();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.set_state(ConnectionState::Active);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.state().can_receive_frames());
        conn.set_state(ConnectionState::Closing);
        assert!(!conn.state().can_receive_frames());
    }

    #[test]
    fn pong_resets_missed_counter_and_answers_ping() {
        let (conn, _rx) = connection();
        conn.record_ping_sent();
        assert!(conn.ping_unanswered());
        assert_eq!(conn.record_missed_pong(), 1);
        conn.record_pong_received();
        assert_eq!(conn.missed_pongs(), 0);
        assert!(!conn.ping_unanswered());
    }

    #[test]
    fn no_ping_means_nothing_outstanding() {
        let (conn, _rx) = connection();
        assert!(!conn.ping_unanswered());
    }
}
