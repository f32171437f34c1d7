// src/notify/mod.rs
// Push-notification bus: per-user registry of open WebSocket connections,
// fanning out payload-free change events after each consolidation commit.
//
// Delivery is at-most-once and non-blocking. A connection whose bounded
// outbound queue is full drops the newest event (the one being published)
// with a log line; older queued events keep their order. Clients that miss
// an event reconcile by re-fetching the consolidated document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CONFIG;
use crate::session::UserId;

pub mod connection;
pub mod event;
pub mod reconnect;
pub mod ws;

pub use connection::{ConnectionHandle, ConnectionState};
pub use event::{NotificationEvent, WsServerFrame};
pub use reconnect::{CloseReason, ReconnectController, ReconnectDecision, ReconnectPolicy};

use connection::{ConnectionSlot, StateCell};

/// Counters for log-level observability; not a metrics surface.
#[derive(Debug, Clone, Copy)]
pub struct BusStats {
    pub delivered: u64,
    pub dropped: u64,
}

pub struct NotificationBus {
    channels: RwLock<HashMap<UserId, Arc<Mutex<Vec<ConnectionSlot>>>>>,
    queue_capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl NotificationBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            queue_capacity,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_config() -> Self {
        Self::new(CONFIG.ws_outbound_queue_capacity)
    }

    /// Register a connection for `user_id` after a successful handshake.
    /// Multiple concurrent handles per user are expected (browser tabs).
    pub async fn subscribe(&self, user_id: UserId) -> ConnectionHandle {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        let state = StateCell::new(ConnectionState::Connecting);
        state.advance(ConnectionState::Open);

        let entry = {
            let mut channels = self.channels.write().await;
            channels.entry(user_id).or_default().clone()
        };
        entry.lock().await.push(ConnectionSlot {
            id,
            sender,
            state: state.clone(),
        });

        info!("Notification subscription opened for user {} ({})", user_id, id);
        ConnectionHandle::new(id, user_id, state, receiver)
    }

    /// Deliver `event` to every `Open` connection of `event.target_user_id`
    /// and nobody else. Never blocks on a slow consumer. Returns how many
    /// connections accepted the event.
    pub async fn publish(&self, event: &NotificationEvent) -> usize {
        let user_id = event.target_user_id;
        let entry = { self.channels.read().await.get(&user_id).cloned() };
        let Some(entry) = entry else {
            debug!("No connections registered for user {}", user_id);
            return 0;
        };

        let frame = event.frame();
        let mut slots = entry.lock().await;
        let mut accepted = 0usize;

        for slot in slots.iter() {
            if slot.state.get() != ConnectionState::Open {
                continue;
            }
            match slot.sender.try_send(frame.clone()) {
                Ok(()) => {
                    accepted += 1;
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dropped notification for user {} connection {}: outbound queue full",
                        user_id, slot.id
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    // Receiver side is gone; retire the slot below.
                    slot.state.advance(ConnectionState::Closing);
                    slot.state.advance(ConnectionState::Closed);
                }
            }
        }

        slots.retain(|slot| !slot.state.get().is_terminal());
        accepted
    }

    /// Retire one connection. `normal` reflects the close code the peer
    /// sent; the server never reconnects either way, so it only affects the
    /// log line (the consumer edge owns reconnect policy).
    pub async fn disconnect(&self, user_id: UserId, connection_id: Uuid, normal: bool) {
        let entry = { self.channels.read().await.get(&user_id).cloned() };
        let Some(entry) = entry else { return };

        let mut slots = entry.lock().await;
        if let Some(slot) = slots.iter().find(|s| s.id == connection_id) {
            slot.state.advance(ConnectionState::Closing);
            slot.state.advance(ConnectionState::Closed);
            info!(
                "Notification subscription closed for user {} ({}) [{}]",
                user_id,
                connection_id,
                if normal { "normal" } else { "abnormal" }
            );
        }
        slots.retain(|slot| !slot.state.get().is_terminal());

        if slots.is_empty() {
            drop(slots);
            let mut channels = self.channels.write().await;
            // Re-check under the write lock; a new subscriber may have
            // arrived in between.
            if let Some(current) = channels.get(&user_id) {
                if current.try_lock().map(|v| v.is_empty()).unwrap_or(false) {
                    channels.remove(&user_id);
                }
            }
        }
    }

    /// Number of currently `Open` connections for a user.
    pub async fn connection_count(&self, user_id: UserId) -> usize {
        let entry = { self.channels.read().await.get(&user_id).cloned() };
        match entry {
            Some(entry) => {
                let slots = entry.lock().await;
                slots
                    .iter()
                    .filter(|s| s.state.get() == ConnectionState::Open)
                    .count()
            }
            None => 0,
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
