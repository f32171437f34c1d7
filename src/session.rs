// src/session.rs
// Shared session-level identifiers and the session→owner seam. The mapping
// itself lives in the workflow's relational store; this core only consumes
// it when routing notification events.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

pub type SessionId = i64;
pub type UserId = i64;

/// Resolves which user a repair session belongs to.
#[async_trait]
pub trait SessionOwnerLookup: Send + Sync {
    async fn owner_of(&self, session_id: SessionId) -> Option<UserId>;
}

/// In-memory owner table for tests and local development.
#[derive(Default)]
pub struct InMemorySessionOwners {
    owners: RwLock<HashMap<SessionId, UserId>>,
}

impl InMemorySessionOwners {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assign(&self, session_id: SessionId, user_id: UserId) {
        self.owners.write().await.insert(session_id, user_id);
    }
}

#[async_trait]
impl SessionOwnerLookup for InMemorySessionOwners {
    async fn owner_of(&self, session_id: SessionId) -> Option<UserId> {
        self.owners.read().await.get(&session_id).copied()
    }
}
