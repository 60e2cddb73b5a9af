//! Backend collaborators: the photo table with its change feed, and the
//! blob store behind uploads.
//!
//! Both are consumed through object-safe traits so the hub and the uploader
//! never know which adapter they talk to:
//! - [`LocalBackend`]: SQLite table and filesystem blobs, shared by every
//!   process pointed at the same data directory
//! - [`RestBackend`]: PostgREST-style table API plus a storage API over HTTP
//!
//! [`Backend::connect`] pairs either one with a [`PollingFeed`], so changes
//! made by any process or device show up in the live feed.

pub mod error;
pub mod local;
pub mod polling;
pub mod rest;
pub mod schema;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::config::{BackendConfig, Config};
use crate::photo::{Delta, DeviceType, EventFilter, PhotoRecord};

pub use error::BackendError;
pub use local::LocalBackend;
pub use polling::PollingFeed;
pub use rest::RestBackend;

/// Live deltas for one subscription. The stream ending means the
/// connection dropped.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta, BackendError>> + Send>>;

/// Chunks of a stored blob.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, BackendError>> + Send>>;

/// Handle identifying one live subscription, used to tear it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub struct Subscription {
    pub id: SubscriptionId,
    pub stream: DeltaStream,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Ordering of a bulk fetch by `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::NewestFirst => "DESC",
            Self::OldestFirst => "ASC",
        }
    }

    /// Value of the PostgREST `order` parameter.
    pub fn query_param(&self) -> &'static str {
        match self {
            Self::NewestFirst => "created_at.desc",
            Self::OldestFirst => "created_at.asc",
        }
    }
}

/// Bulk query and live change subscription over the photos table.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Fetch every record in the table.
    async fn query(&self, order: SortOrder) -> Result<Vec<PhotoRecord>, BackendError>;

    /// Open a live subscription delivering the delta kinds in `filter`.
    async fn subscribe(&self, filter: EventFilter) -> Result<Subscription, BackendError>;

    /// Release a subscription. Unknown or already released ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}

/// Location of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub storage_key: String,
    pub public_url: String,
}

/// Blob storage and record writes behind uploads, deletes and downloads.
#[async_trait]
pub trait UploadService: Send + Sync {
    /// Store `bytes` under `key`. Fails if the key already exists.
    async fn store(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredBlob, BackendError>;

    /// Insert the table row for a stored blob and return it as created.
    async fn insert_record(
        &self,
        blob: &StoredBlob,
        device_type: DeviceType,
    ) -> Result<PhotoRecord, BackendError>;

    /// Remove a blob. Removing a missing blob is not an error.
    async fn delete_blob(&self, key: &str) -> Result<(), BackendError>;

    /// Remove a row. Removing a missing row is not an error.
    async fn delete_record(&self, id: &str) -> Result<(), BackendError>;

    async fn find_record(&self, id: &str) -> Result<Option<PhotoRecord>, BackendError>;

    /// Stream the contents of a record's blob.
    async fn open_blob(&self, record: &PhotoRecord) -> Result<BlobStream, BackendError>;
}

/// The backend handles for one process, created once at startup and
/// passed to every consumer.
#[derive(Clone)]
pub struct Backend {
    pub feed: Arc<dyn ChangeFeed>,
    pub uploads: Arc<dyn UploadService>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl Backend {
    pub async fn connect(config: &Config) -> Result<Self, BackendError> {
        match &config.backend {
            BackendConfig::Local { data_dir } => {
                let local = Arc::new(LocalBackend::open(data_dir).await?);
                tracing::debug!(data_dir = %data_dir.display(), "Using local backend");
                // Uploads and deletes usually come from other processes
                // sharing the database, which the broadcast feed never sees.
                Ok(Self {
                    feed: Arc::new(PollingFeed::new(local.clone(), config.poll_interval)),
                    uploads: local,
                })
            }
            BackendConfig::Rest {
                url,
                api_key,
                table,
                bucket,
            } => {
                let rest = Arc::new(RestBackend::new(
                    url,
                    api_key,
                    table,
                    bucket,
                    config.retry.clone(),
                )?);
                tracing::debug!(%url, %table, %bucket, "Using REST backend");
                Ok(Self {
                    feed: Arc::new(PollingFeed::new(rest.clone(), config.poll_interval)),
                    uploads: rest,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use futures_util::StreamExt;
    use std::path::PathBuf;
    use std::time::Duration;

    fn local_config(name: &str) -> Config {
        let dir = std::env::temp_dir()
            .join("photowall")
            .join("backend_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Config {
            backend: BackendConfig::Local {
                data_dir: PathBuf::from(&dir),
            },
            retry: RetryConfig::immediate(0),
            poll_interval: Duration::from_millis(50),
        }
    }

    async fn next_delta(sub: &mut Subscription) -> Delta {
        tokio::time::timeout(Duration::from_secs(2), sub.stream.next())
            .await
            .expect("delta in time")
            .expect("stream open")
            .expect("delta ok")
    }

    /// `watch` and `upload` run as separate processes that only share the
    /// data directory.
    #[tokio::test]
    async fn test_local_feed_sees_writes_from_another_connection() {
        let config = local_config("shared_dir");
        let watcher = Backend::connect(&config).await.unwrap();
        let writer = Backend::connect(&config).await.unwrap();
        let mut sub = watcher.feed.subscribe(EventFilter::ALL).await.unwrap();

        let blob = writer
            .uploads
            .store("photos/a.jpg", b"jpeg".to_vec(), "image/jpeg")
            .await
            .unwrap();
        let record = writer
            .uploads
            .insert_record(&blob, DeviceType::Desktop)
            .await
            .unwrap();
        assert_eq!(next_delta(&mut sub).await, Delta::Insert(record.clone()));

        writer.uploads.delete_record(&record.id).await.unwrap();
        assert_eq!(
            next_delta(&mut sub).await,
            Delta::Delete { id: record.id }
        );

        watcher.feed.unsubscribe(sub.id).await;
    }
}
