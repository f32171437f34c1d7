// src/consolidate/pointer.rs
// The latest-revision pointer is a small record in the workflow's primary
// store mapping a session to the key of its current consolidated document.
// This core updates it but does not own it, so it is modeled as an injected
// trait with a compare-and-swap primitive.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::session::SessionId;
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestPointer {
    pub key: String,
    pub revision: u64,
}

#[async_trait]
pub trait LatestPointerStore: Send + Sync {
    async fn get(&self, session_id: SessionId) -> Result<Option<LatestPointer>, StorageError>;

    /// Atomically swap the pointer to `new`, but only if it still references
    /// the revision the caller read (`expected` is `None` for "no pointer
    /// yet"). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected: Option<u64>,
        new: LatestPointer,
    ) -> Result<bool, StorageError>;
}

/// In-memory pointer table. Used by unit tests and by the offline backfill
/// tool, where the primary store's pointer row is reconciled separately.
#[derive(Default)]
pub struct InMemoryPointerStore {
    pointers: Mutex<HashMap<SessionId, LatestPointer>>,
}

impl InMemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LatestPointerStore for InMemoryPointerStore {
    async fn get(&self, session_id: SessionId) -> Result<Option<LatestPointer>, StorageError> {
        Ok(self.pointers.lock().await.get(&session_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected: Option<u64>,
        new: LatestPointer,
    ) -> Result<bool, StorageError> {
        let mut pointers = self.pointers.lock().await;
        let current = pointers.get(&session_id).map(|p| p.revision);
        if current != expected {
            return Ok(false);
        }
        pointers.insert(session_id, new);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_succeeds_only_against_read_revision() {
        let store = InMemoryPointerStore::new();

        // First writer creates the pointer.
        assert!(store
            .compare_and_swap(
                501,
                None,
                LatestPointer {
                    key: "sess/501/r000001".into(),
                    revision: 1
                }
            )
            .await
            .unwrap());

        // A second writer that also read "no pointer" loses.
        assert!(!store
            .compare_and_swap(
                501,
                None,
                LatestPointer {
                    key: "sess/501/r000001".into(),
                    revision: 1
                }
            )
            .await
            .unwrap());

        // Conditioned on the current revision, the swap goes through.
        assert!(store
            .compare_and_swap(
                501,
                Some(1),
                LatestPointer {
                    key: "sess/501/r000002".into(),
                    revision: 2
                }
            )
            .await
            .unwrap());

        let ptr = store.get(501).await.unwrap().unwrap();
        assert_eq!(ptr.revision, 2);
    }
}
