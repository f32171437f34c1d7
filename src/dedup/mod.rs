// src/dedup/mod.rs
// Content-addressed attachment storage. Identical bytes always resolve to
// one physical object, one hash and one URL, no matter how many phases or
// purposes reference them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::storage::{ObjectStore, StorageError, WriteMode};

/// Every content-addressed object lives under this key prefix so the
/// attachment key space can be audited with a single prefix listing.
pub const ATTACHMENT_PREFIX: &str = "att/";

/// Reference to deduplicated attachment bytes. `purpose` differentiates
/// logical usage of the same physical object; the rest is derived from the
/// content itself and never mutates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub content_hash: String,
    pub url: String,
    pub content_type: String,
    pub size: u64,
    pub purpose: String,
}

/// Error types for attachment deduplication
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stored object {key} failed digest verification (expected {expected}, found {actual})")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

/// SHA-256 over the raw bytes, lowercase hex.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content-addressed key for a digest. Derived from the hash alone so that
/// identical bytes map to the same key regardless of declared content type.
pub fn content_key(hash: &str) -> String {
    format!("{ATTACHMENT_PREFIX}{hash}")
}

pub struct Deduplicator {
    store: Arc<dyn ObjectStore>,
    verify_after_store: bool,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn ObjectStore>, verify_after_store: bool) -> Self {
        Self {
            store,
            verify_after_store,
        }
    }

    /// Resolve `bytes` to an existing content-addressed object, or store it
    /// if this is the first time the content is seen.
    ///
    /// The ref is only returned after the object is durably stored, so a
    /// half-completed upload can never be referenced. A `KeyConflict` from a
    /// racing first upload of the same content is folded into the hit path:
    /// both writers carried identical bytes, so whichever landed is correct.
    pub async fn resolve_or_store(
        &self,
        bytes: &[u8],
        content_type: &str,
        purpose: &str,
    ) -> Result<AttachmentRef, DedupError> {
        let hash = digest(bytes);
        let key = content_key(&hash);

        if self.store.exists(&key).await? {
            debug!("Attachment {} already stored, reusing", hash);
            return Ok(self.make_ref(&hash, &key, content_type, bytes.len(), purpose));
        }

        match self
            .store
            .put(&key, bytes.to_vec(), content_type, WriteMode::Create)
            .await
        {
            Ok(url) => {
                debug!("Stored new attachment {} ({} bytes)", hash, bytes.len());
                let att = AttachmentRef {
                    content_hash: hash,
                    url,
                    content_type: content_type.to_string(),
                    size: bytes.len() as u64,
                    purpose: purpose.to_string(),
                };
                if self.verify_after_store {
                    self.verify_stored(&att).await?;
                }
                Ok(att)
            }
            Err(StorageError::KeyConflict(_)) => {
                debug!("Attachment {} landed concurrently, reusing", hash);
                Ok(self.make_ref(&hash, &key, content_type, bytes.len(), purpose))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read-back verification for high-assurance callers: re-fetch the
    /// object and recompute its digest. A mismatch is fatal for that
    /// attachment and never silently ignored.
    pub async fn verify_stored(&self, att: &AttachmentRef) -> Result<(), DedupError> {
        let key = content_key(&att.content_hash);
        let stored = self.store.get(&key).await?;
        let actual = digest(&stored);
        if actual != att.content_hash {
            error!(
                "Attachment integrity failure at {}: expected {}, found {}",
                key, att.content_hash, actual
            );
            return Err(DedupError::IntegrityMismatch {
                key,
                expected: att.content_hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn make_ref(
        &self,
        hash: &str,
        key: &str,
        content_type: &str,
        size: usize,
        purpose: &str,
    ) -> AttachmentRef {
        AttachmentRef {
            content_hash: hash.to_string(),
            url: self.store.url_for(key),
            content_type: content_type.to_string(),
            size: size as u64,
            purpose: purpose.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    fn dedup(verify: bool) -> (Arc<InMemoryObjectStore>, Deduplicator) {
        let store = Arc::new(InMemoryObjectStore::default());
        let dedup = Deduplicator::new(store.clone(), verify);
        (store, dedup)
    }

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(digest(b"abc").len(), 64);
    }

    #[tokio::test]
    async fn test_double_store_yields_one_object() {
        let (store, dedup) = dedup(false);
        let bytes = vec![7u8; 1024];

        let first = dedup
            .resolve_or_store(&bytes, "audio/wav", "diagnostic_audio")
            .await
            .unwrap();
        let second = dedup
            .resolve_or_store(&bytes, "audio/wav", "diagnostic_audio")
            .await
            .unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.url, second.url);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_purposes_share_physical_bytes() {
        let (store, dedup) = dedup(false);
        let bytes = b"same physical content".to_vec();

        let a = dedup
            .resolve_or_store(&bytes, "image/png", "diagnostic_image")
            .await
            .unwrap();
        let b = dedup
            .resolve_or_store(&bytes, "image/png", "guide_illustration")
            .await
            .unwrap();

        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.url, b.url);
        assert_ne!(a.purpose, b.purpose);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let (store, dedup) = dedup(true);
        let att = dedup
            .resolve_or_store(b"original", "text/plain", "note")
            .await
            .unwrap();

        // Corrupt the stored object behind the deduplicator's back.
        store
            .put(
                &content_key(&att.content_hash),
                b"tampered".to_vec(),
                "text/plain",
                WriteMode::Overwrite,
            )
            .await
            .unwrap();

        let err = dedup.verify_stored(&att).await.unwrap_err();
        assert!(matches!(err, DedupError::IntegrityMismatch { .. }));
    }
}
