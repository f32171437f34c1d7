// src/consolidate/mod.rs
// Merges per-phase updates into one canonical versioned document per
// session. Documents are append-only (a fresh revision-stamped key per
// commit) with a compare-and-swap'd latest pointer, so concurrent writers
// can race safely and lose nothing.
//
// Consolidation is a best-effort mirror of the primary store, never the
// system of record: a failure here is surfaced to the caller but must not
// roll back the workflow's own write.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::dedup::{Deduplicator, DedupError};
use crate::session::SessionId;
use crate::storage::{retry_backoff, ObjectStore, StorageError, WriteMode};

pub mod pointer;
pub mod record;

pub use pointer::{InMemoryPointerStore, LatestPointer, LatestPointerStore};
pub use record::{revision_key, RepairPhase, SessionRecord, SESSION_PREFIX};

/// Error types for consolidation
#[derive(Debug, thiserror::Error)]
pub enum ConsolidationError {
    #[error("Consolidation failed for session {session_id} ({context}) after {attempts} attempts")]
    Failed {
        session_id: SessionId,
        context: String,
        attempts: u32,
    },

    #[error("No consolidated document exists for session {0}")]
    NoDocument(SessionId),

    #[error("Attachment error: {0}")]
    Attachment(#[from] DedupError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stored document for session {0} could not be decoded: {1}")]
    Decode(SessionId, String),
}

/// Emitted after every successfully committed revision. Carries no payload
/// body; the notification layer only needs enough to tell clients what to
/// re-fetch.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub session_id: SessionId,
    pub revision: u64,
    pub committed_at: chrono::DateTime<Utc>,
}

pub struct SessionConsolidator {
    store: Arc<dyn ObjectStore>,
    dedup: Arc<Deduplicator>,
    pointers: Arc<dyn LatestPointerStore>,
    commit_tx: broadcast::Sender<CommitEvent>,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl SessionConsolidator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dedup: Arc<Deduplicator>,
        pointers: Arc<dyn LatestPointerStore>,
        max_retries: u32,
        retry_base_delay_ms: u64,
    ) -> Self {
        let (commit_tx, _) = broadcast::channel(64);
        Self {
            store,
            dedup,
            pointers,
            commit_tx,
            max_retries,
            retry_base_delay_ms,
        }
    }

    /// Subscribe to commit events. Receivers that fall behind see a lagged
    /// error and simply miss signals, matching the bus's no-replay model.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommitEvent> {
        self.commit_tx.subscribe()
    }

    /// Merge `data` into the session's `phase` slot and commit a new
    /// revision. Updates may arrive in any phase order.
    pub async fn record_phase(
        &self,
        session_id: SessionId,
        phase: &str,
        data: serde_json::Value,
    ) -> Result<SessionRecord, ConsolidationError> {
        self.commit_mutation(session_id, &format!("phase {phase}"), |record| {
            record.merge_phase(phase, data.clone());
            true
        })
        .await
    }

    /// Deduplicate `bytes` and merge the resulting ref into the session's
    /// attachment list. Re-submitting the same content for the same purpose
    /// is a no-op beyond the dedup lookup.
    pub async fn record_attachment(
        &self,
        session_id: SessionId,
        purpose: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<SessionRecord, ConsolidationError> {
        let att = self
            .dedup
            .resolve_or_store(bytes, content_type, purpose)
            .await?;

        self.commit_mutation(session_id, &format!("attachment {purpose}"), move |record| {
            record.merge_attachment(att.clone())
        })
        .await
    }

    /// Resolve the current consolidated document through the latest
    /// pointer. Never served from a cache, so reads always reflect the most
    /// recently committed revision.
    pub async fn get_consolidated(
        &self,
        session_id: SessionId,
    ) -> Result<SessionRecord, ConsolidationError> {
        let pointer = self
            .pointers
            .get(session_id)
            .await?
            .ok_or(ConsolidationError::NoDocument(session_id))?;
        self.read_document(session_id, &pointer.key).await
    }

    async fn read_document(
        &self,
        session_id: SessionId,
        key: &str,
    ) -> Result<SessionRecord, ConsolidationError> {
        let bytes = self.store.get(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ConsolidationError::Decode(session_id, e.to_string()))
    }

    /// Read the latest document (or a fresh one) together with the pointer
    /// revision the read was conditioned on.
    async fn load_current(
        &self,
        session_id: SessionId,
    ) -> Result<(Option<u64>, SessionRecord), ConsolidationError> {
        match self.pointers.get(session_id).await? {
            Some(pointer) => {
                let record = self.read_document(session_id, &pointer.key).await?;
                Ok((Some(pointer.revision), record))
            }
            // First write for this session: no pointer means no prior
            // document, not an error.
            None => Ok((None, SessionRecord::fresh(session_id))),
        }
    }

    /// The optimistic commit loop shared by both record operations:
    /// read → apply → append-only write → pointer CAS, retried on revision
    /// conflicts and transient storage failures, bounded by `max_retries`.
    async fn commit_mutation(
        &self,
        session_id: SessionId,
        context: &str,
        apply: impl Fn(&mut SessionRecord) -> bool,
    ) -> Result<SessionRecord, ConsolidationError> {
        let mut attempt = 0u32;
        loop {
            match self.try_commit_once(session_id, &apply).await {
                Ok(CommitOutcome::Committed(record)) => {
                    debug!(
                        "Committed session {} revision {} ({})",
                        session_id, record.revision, context
                    );
                    let _ = self.commit_tx.send(CommitEvent {
                        session_id,
                        revision: record.revision,
                        committed_at: record.updated_at,
                    });
                    return Ok(record);
                }
                Ok(CommitOutcome::Unchanged(record)) => {
                    debug!(
                        "Session {} unchanged by {}, no new revision",
                        session_id, context
                    );
                    return Ok(record);
                }
                Ok(CommitOutcome::Conflict) => {
                    debug!(
                        "Revision conflict on session {} ({}), attempt {}",
                        session_id,
                        context,
                        attempt + 1
                    );
                }
                Err(err) if err_is_retryable(&err) => {
                    warn!(
                        "Transient failure consolidating session {} ({}): {}",
                        session_id, context, err
                    );
                }
                Err(err) => return Err(err),
            }

            attempt += 1;
            if attempt > self.max_retries {
                return Err(ConsolidationError::Failed {
                    session_id,
                    context: context.to_string(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(retry_backoff(self.retry_base_delay_ms, attempt - 1)).await;
        }
    }

    async fn try_commit_once(
        &self,
        session_id: SessionId,
        apply: &impl Fn(&mut SessionRecord) -> bool,
    ) -> Result<CommitOutcome, ConsolidationError> {
        let (expected, mut record) = self.load_current(session_id).await?;
        if !apply(&mut record) {
            return Ok(CommitOutcome::Unchanged(record));
        }

        record.revision += 1;
        record.updated_at = Utc::now();
        let key = revision_key(session_id, record.revision);
        let body = serde_json::to_vec(&record)
            .map_err(|e| ConsolidationError::Decode(session_id, e.to_string()))?;

        // Create-only put: at most one writer can claim a revision number,
        // so a conflict here is an optimistic-concurrency loss, not damage.
        match self
            .store
            .put(&key, body, "application/json", WriteMode::Create)
            .await
        {
            Ok(_) => {}
            Err(StorageError::KeyConflict(_)) => return Ok(CommitOutcome::Conflict),
            Err(err) => return Err(err.into()),
        }

        let new_pointer = LatestPointer {
            key: key.clone(),
            revision: record.revision,
        };
        if self
            .pointers
            .compare_and_swap(session_id, expected, new_pointer)
            .await?
        {
            Ok(CommitOutcome::Committed(record))
        } else {
            // Lost the pointer race after writing: the revision object is
            // orphaned. Clean it up so the loser's key is free for whoever
            // legitimately commits that revision number next.
            let _ = self.store.delete(&key).await;
            Ok(CommitOutcome::Conflict)
        }
    }
}

enum CommitOutcome {
    Committed(SessionRecord),
    Unchanged(SessionRecord),
    Conflict,
}

fn err_is_retryable(err: &ConsolidationError) -> bool {
    match err {
        ConsolidationError::Storage(e) => e.is_retryable(),
        ConsolidationError::Attachment(DedupError::Storage(e)) => e.is_retryable(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use serde_json::json;

    fn consolidator(store: Arc<InMemoryObjectStore>) -> SessionConsolidator {
        let dedup = Arc::new(Deduplicator::new(store.clone(), false));
        SessionConsolidator::new(store, dedup, Arc::new(InMemoryPointerStore::new()), 4, 1)
    }

    #[tokio::test]
    async fn test_first_commit_is_revision_one() {
        let store = Arc::new(InMemoryObjectStore::default());
        let consolidator = consolidator(store);

        let record = consolidator
            .record_phase(501, "Started", json!({"deviceType": "Laptop"}))
            .await
            .unwrap();
        assert_eq!(record.revision, 1);
    }

    #[tokio::test]
    async fn test_get_without_document_is_no_document() {
        let store = Arc::new(InMemoryObjectStore::default());
        let consolidator = consolidator(store);

        let err = consolidator.get_consolidated(999).await.unwrap_err();
        assert!(matches!(err, ConsolidationError::NoDocument(999)));
    }

    #[tokio::test]
    async fn test_transient_storage_failure_is_retried() {
        let store = Arc::new(InMemoryObjectStore::default());
        let consolidator = consolidator(store.clone());

        store.inject_unavailable(2);
        let record = consolidator
            .record_phase(501, "Started", json!({"deviceType": "Laptop"}))
            .await
            .unwrap();
        assert_eq!(record.revision, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_failed() {
        let store = Arc::new(InMemoryObjectStore::default());
        let consolidator = consolidator(store.clone());

        // More transient failures than the retry budget allows.
        store.inject_unavailable(50);
        let err = consolidator
            .record_phase(501, "Started", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsolidationError::Failed { .. }));
    }
}
