// src/notify/connection.rs
// Connection lifecycle shared by the server-side registry and the
// consumer-edge reconnect controller. Transitions are validated in one
// place so an illegal hop (e.g. Closed → Open) can't creep in from either
// side.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::session::UserId;

use super::event::WsServerFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// Terminal, reachable only from `Connecting`. Reconnection is
    /// suppressed permanently for a handle that lands here.
    AuthFailed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::AuthFailed)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Connecting, AuthFailed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }
}

/// Shared, validated state cell.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<ConnectionState>>);

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap()
    }

    /// Apply a transition if it is legal; returns whether it happened.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.0.lock().unwrap();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            warn!("Ignoring illegal connection transition {:?} -> {:?}", *state, next);
            false
        }
    }
}

/// Consumer side of one subscription: the event receiver plus enough
/// identity to disconnect cleanly.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: UserId,
    state: StateCell,
    events: mpsc::Receiver<WsServerFrame>,
}

impl ConnectionHandle {
    pub(super) fn new(
        id: Uuid,
        user_id: UserId,
        state: StateCell,
        events: mpsc::Receiver<WsServerFrame>,
    ) -> Self {
        Self {
            id,
            user_id,
            state,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Await the next delivered frame. `None` once the connection is closed
    /// and the queue drained.
    pub async fn next_event(&mut self) -> Option<WsServerFrame> {
        self.events.recv().await
    }

    /// Non-blocking drain used by tests and the socket pump's flush path.
    pub fn try_next_event(&mut self) -> Option<WsServerFrame> {
        self.events.try_recv().ok()
    }
}

/// Registry side of one subscription.
pub(super) struct ConnectionSlot {
    pub id: Uuid,
    pub sender: mpsc::Sender<WsServerFrame>,
    pub state: StateCell,
}
