// src/storage/mod.rs
// Flat-namespace blob store abstraction. The workflow layer never talks to
// the remote service directly; everything goes through the injected
// `ObjectStore` trait so tests can substitute the in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

pub mod error;
pub mod memory;
pub mod remote;

pub use error::StorageError;
pub use memory::InMemoryObjectStore;
pub use remote::HttpObjectStore;

/// Keys are opaque flat strings; longer than this and the backend rejects
/// them anyway.
const MAX_KEY_LEN: usize = 1024;

/// Page size used by the lazy listing stream.
const LIST_PAGE_SIZE: usize = 256;

/// Write semantics for `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `KeyConflict` if the key already holds an object.
    /// Used for content-addressed and revision-stamped keys.
    Create,
    /// Replace whatever the key holds. Pointer-style keys only.
    Overwrite,
}

/// Abstract remote blob service: a single logical bucket of flat UTF-8 keys.
/// Implementations must treat keys as opaque strings end to end: no
/// directory semantics, no special-casing of separator characters.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, returning the object's public URL.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        mode: WriteMode,
    ) -> Result<String, StorageError>;

    /// Fetch the object's bytes. `NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Cheap existence check; never transfers the payload.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Best-effort delete; absence of the key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Best-effort delete of every key under `prefix`; returns how many
    /// objects were removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StorageError>;

    /// One page of keys starting lexicographically after `start_after`,
    /// filtered by `prefix`. Building block for `list_by_prefix`.
    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;

    /// Deterministic public URL for a key. Needed so a dedup hit can mint a
    /// ref without re-uploading.
    fn url_for(&self, key: &str) -> String;
}

/// Lazy, finite, restartable listing over every key under `prefix`.
/// Diagnostics and backfill only, never on the hot write path.
pub fn list_by_prefix<'a>(
    store: &'a dyn ObjectStore,
    prefix: &'a str,
) -> impl Stream<Item = Result<String, StorageError>> + 'a {
    async_stream::try_stream! {
        let mut start_after: Option<String> = None;
        loop {
            let page = store
                .list_page(prefix, start_after.as_deref(), LIST_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            start_after = page.last().cloned();
            for key in page {
                yield key;
            }
        }
    }
}

/// Count the physical objects stored under `prefix`. Used by tests and the
/// backfill summary to assert dedup actually deduplicated.
pub async fn count_objects(store: &dyn ObjectStore, prefix: &str) -> Result<u64, StorageError> {
    use tokio_stream::StreamExt;

    let stream = list_by_prefix(store, prefix);
    tokio::pin!(stream);
    let mut count = 0u64;
    while let Some(key) = stream.next().await {
        key?;
        count += 1;
    }
    Ok(count)
}

/// Structural key validation. The store has no directories, so any
/// hierarchical hint in a key is either cosmetic or a mistake; the mistakes
/// are rejected here once instead of being cleaned up reactively later.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason| StorageError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(invalid("key too long"));
    }
    if key.starts_with('/') {
        return Err(invalid("leading separator"));
    }
    if key.ends_with('/') {
        return Err(invalid("trailing separator"));
    }
    // Embedded separators are cosmetic only, but empty and dot segments are
    // hierarchy hints with no flat-namespace meaning.
    for segment in key.split('/') {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if segment == "." || segment == ".." {
            return Err(invalid("relative segment"));
        }
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(invalid("control character"));
    }
    Ok(())
}

/// Exponential backoff with full jitter, capped at 10s. Shared by the
/// transport retry loop and the consolidator's commit retry loop.
pub(crate) fn retry_backoff(base_ms: u64, attempt: u32) -> Duration {
    use rand::Rng;

    let exp = base_ms.saturating_mul(1u64 << attempt.min(8)).min(10_000);
    let jitter = rand::rng().random_range(0..=exp / 2);
    Duration::from_millis(exp / 2 + jitter)
}
