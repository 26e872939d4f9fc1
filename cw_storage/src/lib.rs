//! ABOUTME: Object storage abstraction for detection snapshots
//! ABOUTME: Stores annotated images under stable keys with retry on transient failures

use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use bytes::Bytes;
use object_store::{local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore, PutPayload};
use thiserror::Error;
use tracing::{debug, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for cw_core::Error {
    fn from(err: StorageError) -> Self {
        cw_core::Error::Storage(err.to_string())
    }
}

/// Image persistence used by detection jobs
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store `data` under `key`, returning the reference recorded with the result
    async fn put(&self, key: &str, data: Bytes) -> cw_core::Result<String>;

    async fn get(&self, reference: &str) -> cw_core::Result<Bytes>;
}

/// Build the storage key for a snapshot taken by a detection job
pub fn snapshot_key(camera_id: cw_core::CameraId, job_id: &cw_core::Id, timestamp_ms: i64) -> String {
    format!("{}/{}/{}.jpg", camera_id, job_id, timestamp_ms)
}

/// `ImageStore` over any `object_store` backend
#[derive(Debug, Clone)]
pub struct ObjectImageStore {
    store: Arc<dyn ObjectStore>,
    max_elapsed: Duration,
}

impl ObjectImageStore {
    /// Local filesystem storage rooted at `base_dir`, created if missing
    pub fn local(base_dir: impl AsRef<FsPath>) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir)?;
        let store = LocalFileSystem::new_with_prefix(base_dir)?;
        debug!("Initialized local image storage at {:?}", base_dir);
        Ok(Self::with_store(Arc::new(store)))
    }

    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemory::new()))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            max_elapsed: Duration::from_secs(10),
        }
    }

    fn object_path(key: &str) -> Result<Path, StorageError> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|p| p == "..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Path::parse(key).map_err(|e| StorageError::InvalidKey(format!("{}: {}", key, e)))
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        }
    }

    async fn put_with_retry(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        retry(self.backoff(), || async {
            self.store
                .put(path, payload.clone())
                .await
                .map(|_| ())
                .map_err(|e| {
                    warn!("Snapshot write failed, will retry: {}", e);
                    backoff::Error::transient(e)
                })
        })
        .await
        .map_err(StorageError::ObjectStore)
    }
}

#[async_trait]
impl ImageStore for ObjectImageStore {
    async fn put(&self, key: &str, data: Bytes) -> cw_core::Result<String> {
        let path = Self::object_path(key)?;
        let size = data.len();
        self.put_with_retry(&path, PutPayload::from(data)).await?;
        debug!(key, size, "Stored snapshot");
        Ok(path.to_string())
    }

    async fn get(&self, reference: &str) -> cw_core::Result<Bytes> {
        let path = Self::object_path(reference)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(StorageError::ObjectStore)?;
        let bytes = result.bytes().await.map_err(StorageError::ObjectStore)?;
        Ok(bytes)
    }
}
