// src/storage/memory.rs
// In-memory ObjectStore used by unit tests and local development. Keeps the
// same contract as the remote store, including create-only conflicts and
// lexicographic listing, so tests exercise real semantics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_key, ObjectStore, StorageError, WriteMode};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    #[allow(dead_code)]
    content_type: String,
}

pub struct InMemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    // Number of upcoming calls that should fail as transient, for retry tests.
    inject_unavailable: AtomicU32,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            inject_unavailable: AtomicU32::new(0),
        }
    }

    /// Make the next `n` store calls fail with `StorageUnavailable`.
    pub fn inject_unavailable(&self, n: u32) {
        self.inject_unavailable.store(n, Ordering::SeqCst);
    }

    /// Total number of stored objects, across all keys.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn check_injected_failure(&self) -> Result<(), StorageError> {
        let remaining = self.inject_unavailable.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inject_unavailable.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new("test")
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        mode: WriteMode,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        self.check_injected_failure()?;

        let mut objects = self.objects.write().await;
        if mode == WriteMode::Create && objects.contains_key(key) {
            return Err(StorageError::KeyConflict(key.to_string()));
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.check_injected_failure()?;

        self.objects
            .read()
            .await
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        self.check_injected_failure()?;

        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut objects = self.objects.write().await;
        let doomed: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let removed = doomed.len() as u64;
        for key in doomed {
            objects.remove(&key);
        }
        Ok(removed)
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.read().await;
        let page = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| start_after.is_none_or(|after| k.as_str() > after))
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    fn url_for(&self, key: &str) -> String {
        format!("memory://{}/{}", self.bucket, key)
    }
}
