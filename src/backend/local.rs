//! Self-contained backend: SQLite photos table and blobs on the local
//! filesystem.
//!
//! The broadcast change feed only reaches subscribers in the same process.
//! Other processes sharing the database see changes through a
//! [`PollingFeed`](super::PollingFeed) wrapped around this backend.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use rusqlite::{Connection, OptionalExtension};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::error::BackendError;
use super::schema;
use super::{
    BlobStream, ChangeFeed, SortOrder, StoredBlob, Subscription, SubscriptionId, UploadService,
};
use crate::photo::{Delta, DeviceType, EventFilter, PhotoRecord};

/// Buffered deltas per subscriber before it is considered lagging.
const FEED_CAPACITY: usize = 256;

const DB_FILE_NAME: &str = "photowall.db";
const BLOB_DIR_NAME: &str = "blobs";

pub struct LocalBackend {
    /// rusqlite::Connection is not Sync; never held across an await.
    conn: Mutex<Connection>,
    path: PathBuf,
    blob_dir: PathBuf,
    events: broadcast::Sender<Delta>,
    subscriptions: Mutex<HashMap<u64, CancellationToken>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("path", &self.path)
            .field("blob_dir", &self.blob_dir)
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    /// Open or create the database and blob directory under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, BackendError> {
        let data_dir = data_dir.to_path_buf();
        let path = data_dir.join(DB_FILE_NAME);

        let (conn, blob_dir) = tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                let blob_dir = data_dir.join(BLOB_DIR_NAME);
                std::fs::create_dir_all(&blob_dir).map_err(|e| BackendError::Blob {
                    key: blob_dir.display().to_string(),
                    source: e,
                })?;
                let blob_dir = std::fs::canonicalize(&blob_dir).map_err(|e| BackendError::Blob {
                    key: blob_dir.display().to_string(),
                    source: e,
                })?;

                let conn = Connection::open(&path).map_err(|e| BackendError::Open {
                    path: path.clone(),
                    source: e,
                })?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "NORMAL")?;
                schema::migrate(&conn)?;

                Ok::<_, BackendError>((conn, blob_dir))
            }
        })
        .await??;

        Ok(Self::from_parts(conn, path, blob_dir))
    }

    /// In-memory table with blobs under `blob_dir` (for testing).
    #[cfg(test)]
    pub fn open_in_memory(blob_dir: &Path) -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(|e| BackendError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        std::fs::create_dir_all(blob_dir).map_err(|e| BackendError::Blob {
            key: blob_dir.display().to_string(),
            source: e,
        })?;
        Ok(Self::from_parts(
            conn,
            PathBuf::from(":memory:"),
            blob_dir.to_path_buf(),
        ))
    }

    fn from_parts(conn: Connection, path: PathBuf, blob_dir: PathBuf) -> Self {
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            path,
            blob_dir,
            events,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Resolve a storage key to a path inside the blob directory.
    fn blob_path(&self, key: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(self.blob_dir.join(relative))
    }

    fn publish(&self, delta: Delta) {
        let kind = delta.kind();
        // No receivers is fine: nobody is watching.
        let receivers = self.events.send(delta).unwrap_or(0);
        tracing::debug!(kind = kind.as_str(), receivers, "Published delta");
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BackendError> {
        self.conn
            .lock()
            .map_err(|e| BackendError::Query(e.to_string()))
    }
}

#[async_trait]
impl ChangeFeed for LocalBackend {
    async fn query(&self, order: SortOrder) -> Result<Vec<PhotoRecord>, BackendError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, file_path, file_url, created_at, device_type FROM photos ORDER BY created_at {}",
            order.sql()
        );
        let mut stmt = conn.prepare(&sql).map_err(BackendError::query)?;
        let records = stmt
            .query_map([], row_to_photo)
            .map_err(BackendError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(BackendError::query)?;
        Ok(records)
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<Subscription, BackendError> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.subscriptions
            .lock()
            .map_err(|e| BackendError::Query(e.to_string()))?
            .insert(id, token.clone());

        let rx = self.events.subscribe();
        let stream = stream::unfold(Some((rx, token)), move |state| async move {
            let (mut rx, token) = state?;
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => return None,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(delta) if filter.accepts(delta.kind()) => {
                        return Some((Ok(delta), Some((rx, token))));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Missed deltas cannot be recovered; end the stream
                        // so the consumer resyncs from a fresh snapshot.
                        return Some((Err(BackendError::Lagged(missed)), None));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        tracing::debug!(subscription = id, ?filter, "Opened local subscription");
        Ok(Subscription {
            id: SubscriptionId(id),
            stream: Box::pin(stream),
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let token = match self.subscriptions.lock() {
            Ok(mut subs) => subs.remove(&id.0),
            Err(poisoned) => poisoned.into_inner().remove(&id.0),
        };
        if let Some(token) = token {
            token.cancel();
            tracing::debug!(subscription = id.0, "Closed local subscription");
        }
    }
}

#[async_trait]
impl UploadService for LocalBackend {
    async fn store(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredBlob, BackendError> {
        let path = self.blob_path(key)?;
        let blob_err = |e| BackendError::Blob {
            key: key.to_string(),
            source: e,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(blob_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(blob_err)?;
        file.write_all(&bytes).await.map_err(blob_err)?;
        file.flush().await.map_err(blob_err)?;

        tracing::debug!(%key, content_type, size = bytes.len(), "Stored blob");
        Ok(StoredBlob {
            storage_key: key.to_string(),
            public_url: format!("file://{}", path.display()),
        })
    }

    async fn insert_record(
        &self,
        blob: &StoredBlob,
        device_type: DeviceType,
    ) -> Result<PhotoRecord, BackendError> {
        let micros = Utc::now().timestamp_micros();
        let record = PhotoRecord {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: blob.storage_key.clone(),
            file_url: blob.public_url.clone(),
            created_at: DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH),
            device_type,
        };

        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO photos (id, file_path, file_url, created_at, device_type) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    &record.id,
                    &record.file_path,
                    &record.file_url,
                    micros,
                    record.device_type.as_str(),
                ],
            )
            .map_err(BackendError::query)?;
        }

        self.publish(Delta::Insert(record.clone()));
        Ok(record)
    }

    async fn delete_blob(&self, key: &str) -> Result<(), BackendError> {
        let path = self.blob_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(%key, "Blob already absent");
                Ok(())
            }
            Err(e) => Err(BackendError::Blob {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    async fn delete_record(&self, id: &str) -> Result<(), BackendError> {
        let removed = {
            let conn = self.lock()?;
            conn.execute("DELETE FROM photos WHERE id = ?1", [id])
                .map_err(BackendError::query)?
        };
        if removed > 0 {
            self.publish(Delta::Delete { id: id.to_string() });
        }
        Ok(())
    }

    async fn find_record(&self, id: &str) -> Result<Option<PhotoRecord>, BackendError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, file_path, file_url, created_at, device_type FROM photos WHERE id = ?1",
            [id],
            row_to_photo,
        )
        .optional()
        .map_err(BackendError::query)
    }

    async fn open_blob(&self, record: &PhotoRecord) -> Result<BlobStream, BackendError> {
        let path = self.blob_path(&record.file_path)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| BackendError::Blob {
                key: record.file_path.clone(),
                source: e,
            })?;
        Ok(Box::pin(stream::iter([Ok::<_, BackendError>(bytes)])))
    }
}

fn row_to_photo(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhotoRecord> {
    let created_at_us: i64 = row.get(3)?;
    let device_type: String = row.get(4)?;
    Ok(PhotoRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        file_url: row.get(2)?,
        created_at: DateTime::from_timestamp_micros(created_at_us).unwrap_or(DateTime::UNIX_EPOCH),
        device_type: DeviceType::from_str_lossy(&device_type),
    })
}
