//! Object-store access behind the [`ObjectPutter`] capability.
//!
//! The daemon only ever puts objects and checks that its bucket exists, so
//! the trait stays that narrow. [`HttpObjectStore`] is the thin production
//! client; [`MockObjectStore`] is the in-memory double used by tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Result type alias for object-store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for object-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The configured bucket URL did not parse.
    #[error("invalid bucket url: {0}")]
    InvalidUrl(String),

    /// Transport-level failure talking to the store.
    #[error("remote call: {0}")]
    Remote(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("remote status: {0}")]
    Status(u16),

    /// Reading the source file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal put-side capability of an object store.
#[async_trait]
pub trait ObjectPutter: Send + Sync {
    /// True when the configured bucket is reachable and exists.
    async fn bucket_exists(&self) -> StoreResult<bool>;

    /// Store `data` under `key`.
    async fn put_object(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Store the file at `path` under `key`, streaming from disk.
    async fn put_file(&self, key: &str, path: &Path) -> StoreResult<()>;
}

/// HTTP client for a COS-style bucket endpoint.
///
/// Transport details beyond authenticated PUT/HEAD are out of scope here;
/// anything heavier belongs behind its own [`ObjectPutter`] implementation.
pub struct HttpObjectStore {
    base: String,
    secret_id: String,
    secret_key: String,
    client: reqwest::Client,
}

impl HttpObjectStore {
    /// Build a client for `url` with the given credentials. `timeout_secs`
    /// bounds every remote call; 0 leaves calls unbounded.
    pub fn new(
        url: &str,
        secret_id: &str,
        secret_key: &str,
        timeout_secs: u64,
    ) -> StoreResult<Self> {
        if reqwest::Url::parse(url).is_err() {
            return Err(StoreError::InvalidUrl(url.to_string()));
        }
        let mut builder = reqwest::Client::builder();
        if timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(timeout_secs));
        }
        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            secret_id: secret_id.to_string(),
            secret_key: secret_key.to_string(),
            client: builder.build()?,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectPutter for HttpObjectStore {
    async fn bucket_exists(&self) -> StoreResult<bool> {
        let resp = self
            .client
            .head(&self.base)
            .basic_auth(&self.secret_id, Some(&self.secret_key))
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Status(status.as_u16())),
        }
    }

    async fn put_object(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let resp = self
            .client
            .put(self.object_url(key))
            .basic_auth(&self.secret_id, Some(&self.secret_key))
            .body(data.to_vec())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StoreError::Status(resp.status().as_u16()));
        }
        debug!(key, bytes = data.len(), "object stored");
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> StoreResult<()> {
        let data = tokio::fs::read(path).await?;
        self.put_object(key, &data).await
    }
}

/// Per-operation counters for [`MockObjectStore`].
#[derive(Debug, Clone, Default)]
pub struct MockStoreStats {
    pub puts: u64,
    pub file_puts: u64,
    pub exists_checks: u64,
    pub total_bytes_stored: u64,
}

/// In-memory object store for tests.
#[derive(Default)]
pub struct MockObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    stats: Mutex<MockStoreStats>,
    bucket_present: AtomicBool,
    fail_puts: AtomicU32,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self {
            bucket_present: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Make `bucket_exists` answer `false`.
    pub fn remove_bucket(&self) {
        self.bucket_present.store(false, Ordering::SeqCst);
    }

    /// Fail the next `n` put operations with a status error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MockStoreStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn take_failure(&self) -> bool {
        self.fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        if self.take_failure() {
            return Err(StoreError::Status(500));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        let mut stats = self.stats.lock().unwrap();
        stats.puts += 1;
        stats.total_bytes_stored += data.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl ObjectPutter for MockObjectStore {
    async fn bucket_exists(&self) -> StoreResult<bool> {
        self.stats.lock().unwrap().exists_checks += 1;
        Ok(self.bucket_present.load(Ordering::SeqCst))
    }

    async fn put_object(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.store(key, data)
    }

    async fn put_file(&self, key: &str, path: &Path) -> StoreResult<()> {
        let data = std::fs::read(path)?;
        self.stats.lock().unwrap().file_puts += 1;
        self.store(key, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_stores_and_returns_objects() {
        let store = MockObjectStore::new();
        store.put_object("a/b.log", b"payload").await.unwrap();

        assert_eq!(store.object("a/b.log").unwrap(), b"payload");
        assert_eq!(store.keys(), vec!["a/b.log".to_string()]);
        assert_eq!(store.stats().puts, 1);
        assert_eq!(store.stats().total_bytes_stored, 7);
    }

    #[tokio::test]
    async fn mock_bucket_can_be_removed() {
        let store = MockObjectStore::new();
        assert!(store.bucket_exists().await.unwrap());
        store.remove_bucket();
        assert!(!store.bucket_exists().await.unwrap());
        assert_eq!(store.stats().exists_checks, 2);
    }

    #[tokio::test]
    async fn mock_scripted_failures_are_consumed_in_order() {
        let store = MockObjectStore::new();
        store.fail_next_puts(2);

        assert!(store.put_object("k", b"x").await.is_err());
        assert!(store.put_object("k", b"x").await.is_err());
        store.put_object("k", b"x").await.unwrap();
    }

    #[tokio::test]
    async fn mock_put_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.log");
        std::fs::write(&path, b"from disk").unwrap();

        let store = MockObjectStore::new();
        store.put_file("f.log", &path).await.unwrap();
        assert_eq!(store.object("f.log").unwrap(), b"from disk");
        assert_eq!(store.stats().file_puts, 1);
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(matches!(
            HttpObjectStore::new("not a url", "id", "key", 5),
            Err(StoreError::InvalidUrl(_))
        ));
    }

    #[test]
    fn object_urls_join_cleanly() {
        let store = HttpObjectStore::new("https://bucket.example.com/", "id", "key", 5).unwrap();
        assert_eq!(
            store.object_url("20240115/a.log"),
            "https://bucket.example.com/20240115/a.log"
        );
    }
}
