// src/notify/event.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{SessionId, UserId};

/// Internal change event routed through the bus. Deliberately payload-free:
/// recipients re-fetch the consolidated document, so the bus never needs
/// ordering or replay guarantees.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub target_user_id: UserId,
    pub session_id: SessionId,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn session_updated(target_user_id: UserId, session_id: SessionId, revision: u64) -> Self {
        Self {
            target_user_id,
            session_id,
            revision,
            timestamp: Utc::now(),
        }
    }

    /// The wire frame sent to clients. `targetUserId` never leaves the
    /// server; routing already happened by the time a frame is built.
    pub fn frame(&self) -> WsServerFrame {
        WsServerFrame::SessionUpdated {
            session_id: self.session_id,
            revision: self.revision,
            timestamp: self.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WsServerFrame {
    #[serde(rename = "session_updated")]
    #[serde(rename_all = "camelCase")]
    SessionUpdated {
        session_id: SessionId,
        revision: u64,
        timestamp: String,
    },
    #[serde(rename = "ping")]
    Ping { ts: String },
    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape_matches_wire_contract() {
        let event = NotificationEvent::session_updated(7, 501, 3);
        let value = serde_json::to_value(event.frame()).unwrap();

        assert_eq!(value["type"], "session_updated");
        assert_eq!(value["sessionId"], 501);
        assert_eq!(value["revision"], 3);
        assert!(value["timestamp"].is_string());
        // No payload body, ever.
        assert!(value.get("phases").is_none());
        assert!(value.get("targetUserId").is_none());
    }
}
