// src/storage/remote.rs
// reqwest-backed ObjectStore for the remote blob service. One logical
// bucket; the service knows nothing about directories, and neither do we.
//
// Transport-level transient failures (connect errors, timeouts, 5xx/429)
// are retried here with jittered backoff; everything else propagates so the
// caller can classify it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::config::CONFIG;

use super::{retry_backoff, validate_key, ObjectStore, StorageError, WriteMode};

pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    bucket: String,
    timeout: Duration,
    transport_retries: u32,
    retry_base_delay_ms: u64,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        bucket: &str,
        timeout: Duration,
        transport_retries: u32,
        retry_base_delay_ms: u64,
    ) -> anyhow::Result<Self> {
        // Validate the endpoint once up front instead of failing per-request.
        Url::parse(base_url)?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            timeout,
            transport_retries,
            retry_base_delay_ms,
        })
    }

    /// Build a store from the global config.
    pub fn from_config() -> anyhow::Result<Self> {
        Self::new(
            &CONFIG.blob_base_url,
            &CONFIG.blob_bucket,
            CONFIG.blob_timeout_duration(),
            CONFIG.blob_transport_retries,
            CONFIG.blob_retry_base_delay_ms,
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, key)
    }

    fn listing_url(&self) -> String {
        format!("{}/{}", self.base_url, self.bucket)
    }

    fn classify(&self, err: reqwest::Error) -> StorageError {
        if err.is_timeout() {
            StorageError::Timeout(self.timeout)
        } else {
            StorageError::Unavailable(err.to_string())
        }
    }

    /// Run `build` up to `transport_retries + 1` times, retrying transient
    /// transport failures and retryable status codes.
    async fn send_with_retry(
        &self,
        op: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StorageError> {
        let mut attempt = 0u32;
        loop {
            let result = build().send().await;
            let retryable = match &result {
                Ok(resp) => {
                    let status = resp.status();
                    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
                }
                Err(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            };

            if retryable && attempt < self.transport_retries {
                let delay = retry_backoff(self.retry_base_delay_ms, attempt);
                debug!(
                    "Blob {} attempt {} failed transiently, retrying in {:?}",
                    op,
                    attempt + 1,
                    delay
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
                continue;
            }

            return match result {
                Ok(resp) => Ok(resp),
                Err(err) => Err(self.classify(err)),
            };
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        mode: WriteMode,
    ) -> Result<String, StorageError> {
        validate_key(key)?;

        let url = self.object_url(key);
        let content_type = content_type.to_string();
        let resp = self
            .send_with_retry("put", || {
                let mut req = self
                    .client
                    .put(&url)
                    .header("Content-Type", content_type.clone())
                    .body(bytes.clone());
                if mode == WriteMode::Create {
                    // Create-only semantics: the service refuses to replace
                    // an existing object when this precondition is present.
                    req = req.header("If-None-Match", "*");
                }
                req
            })
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(url),
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                Err(StorageError::KeyConflict(key.to_string()))
            }
            s => Err(StorageError::Unavailable(format!(
                "put {key} returned {s}"
            ))),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;

        let url = self.object_url(key);
        let resp = self.send_with_retry("get", || self.client.get(&url)).await?;

        match resp.status() {
            s if s.is_success() => Ok(resp
                .bytes()
                .await
                .map_err(|e| self.classify(e))?
                .to_vec()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            s => Err(StorageError::Unavailable(format!(
                "get {key} returned {s}"
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;

        let url = self.object_url(key);
        let resp = self
            .send_with_retry("head", || self.client.head(&url))
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Unavailable(format!(
                "head {key} returned {s}"
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;

        let url = self.object_url(key);
        let resp = self
            .send_with_retry("delete", || self.client.delete(&url))
            .await?;

        // Absence is not an error for best-effort cleanup.
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => Err(StorageError::Unavailable(format!(
                "delete {key} returned {s}"
            ))),
        }
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut removed = 0u64;
        let mut start_after: Option<String> = None;
        loop {
            let page = self
                .list_page(prefix, start_after.as_deref(), 256)
                .await?;
            if page.is_empty() {
                break;
            }
            start_after = page.last().cloned();
            for key in page {
                if let Err(err) = self.delete(&key).await {
                    warn!("Best-effort prefix delete skipped {}: {}", key, err);
                    continue;
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let url = self.listing_url();
        let prefix = prefix.to_string();
        let start_after = start_after.map(str::to_string);
        let resp = self
            .send_with_retry("list", || {
                let mut req = self
                    .client
                    .get(&url)
                    .query(&[("prefix", prefix.clone()), ("max-keys", limit.to_string())]);
                if let Some(after) = &start_after {
                    req = req.query(&[("start-after", after.clone())]);
                }
                req
            })
            .await?;

        match resp.status() {
            s if s.is_success() => resp
                .json::<Vec<String>>()
                .await
                .map_err(|e| StorageError::Unavailable(format!("bad listing body: {e}"))),
            s => Err(StorageError::Unavailable(format!(
                "list returned {s}"
            ))),
        }
    }

    fn url_for(&self, key: &str) -> String {
        self.object_url(key)
    }
}
