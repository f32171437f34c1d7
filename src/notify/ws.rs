// src/notify/ws.rs
// WebSocket edge of the notification bus. Authenticates the handshake,
// registers the connection, then pumps bus frames out and heartbeats until
// either side closes. No payload ever crosses this socket; clients
// re-fetch the consolidated document when told to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::CONFIG;
use crate::session::UserId;
use crate::state::AppState;

use super::event::WsServerFrame;

/// Close code sent when the handshake fails authentication. Clients treat
/// it as terminal and suppress reconnection.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4401;

/// Handshake authentication seam. Real token validation lives with the
/// workflow's auth layer; this core only consumes the verdict.
#[async_trait]
pub trait ConnectionAuthenticator: Send + Sync {
    async fn authenticate(&self, user_id: UserId, token: &str) -> bool;
}

/// Shared-secret authenticator for local development and tests.
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl ConnectionAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, _user_id: UserId, token: &str) -> bool {
        !self.token.is_empty() && token == self.token
    }
}

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub user_id: UserId,
    pub token: String,
}

/// Creates the notification WebSocket router
pub fn ws_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_notify_handler))
        .with_state(app_state)
}

pub async fn ws_notify_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuthQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, auth: WsAuthQuery) {
    // Connecting → AuthFailed: reject before the connection ever registers.
    if !state
        .authenticator
        .authenticate(auth.user_id, &auth.token)
        .await
    {
        warn!("WebSocket auth failure for user {}", auth.user_id);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: AUTH_FAILURE_CLOSE_CODE,
                reason: "authentication failed".into(),
            })))
            .await;
        return;
    }

    let mut handle = state.bus.subscribe(auth.user_id).await;
    let connection_id = handle.id;
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(Duration::from_secs(CONFIG.ws_heartbeat_interval));
    let idle_timeout = Duration::from_secs(CONFIG.ws_connection_timeout);
    let mut last_activity = Instant::now();
    let mut normal_close = false;

    loop {
        tokio::select! {
            frame = handle.next_event() => {
                let Some(frame) = frame else { break };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode notification frame: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        normal_close = frame
                            .map(|f| f.code == close_code::NORMAL)
                            .unwrap_or(false);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {
                        // Clients have nothing to say on this channel, but
                        // any traffic still counts as liveness.
                        last_activity = Instant::now();
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket receive error for user {}: {}", auth.user_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    info!(
                        "Closing idle notification connection for user {} after {:?}",
                        auth.user_id,
                        last_activity.elapsed()
                    );
                    break;
                }
                let ping = WsServerFrame::Ping { ts: Utc::now().to_rfc3339() };
                let json = serde_json::to_string(&ping).unwrap_or_default();
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state
        .bus
        .disconnect(auth.user_id, connection_id, normal_close)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_authenticator() {
        let auth = StaticTokenAuthenticator::new("sekrit");
        assert!(auth.authenticate(7, "sekrit").await);
        assert!(!auth.authenticate(7, "wrong").await);
        assert!(!auth.authenticate(7, "").await);

        // An empty configured secret rejects everything rather than
        // accepting everything.
        let unset = StaticTokenAuthenticator::new("");
        assert!(!unset.authenticate(7, "").await);
    }
}
