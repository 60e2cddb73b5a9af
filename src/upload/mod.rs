//! Uploads, deletes and downloads on top of an [`UploadService`].
//!
//! The uploader never touches the live collection. A successful write
//! reaches every surface through the change feed like any other device's
//! write would.

pub mod error;
pub mod file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng as _;

use crate::backend::UploadService;
use crate::photo::{DeviceType, PhotoRecord};
use crate::retry::RetryConfig;

pub use error::UploadError;

/// Folder prefix of every storage key.
pub const STORAGE_PREFIX: &str = "photos";

const DEFAULT_EXTENSION: &str = "jpg";
const SUFFIX_LEN: usize = 6;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Lowercased extension of `file_name`, or `jpg` when it has none.
pub fn extension_of(file_name: &str) -> String {
    let name = file_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

pub fn content_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// `photos/{unix_millis}-{suffix}.{ext}`.
pub fn storage_key(file_name: &str, unix_millis: i64, suffix: &str) -> String {
    format!(
        "{}/{}-{}.{}",
        STORAGE_PREFIX,
        unix_millis,
        suffix,
        extension_of(file_name)
    )
}

#[derive(Clone)]
pub struct Uploader {
    service: Arc<dyn UploadService>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    pub fn new(service: Arc<dyn UploadService>, retry: RetryConfig) -> Self {
        Self { service, retry }
    }

    /// Store the bytes under a fresh key, then insert the row.
    ///
    /// If the insert fails the stored blob is removed again (best effort),
    /// so a failed upload leaves nothing visible behind.
    pub async fn upload(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        device_type: DeviceType,
    ) -> Result<PhotoRecord, UploadError> {
        let key = storage_key(file_name, Utc::now().timestamp_millis(), &random_suffix());
        let content_type = content_type_for(&extension_of(file_name));
        let size = bytes.len();

        let blob = self
            .service
            .store(&key, bytes, content_type)
            .await
            .map_err(|source| UploadError::Store {
                key: key.clone(),
                source,
            })?;

        match self.service.insert_record(&blob, device_type).await {
            Ok(record) => {
                tracing::info!(
                    id = %record.id,
                    %key,
                    size,
                    device = %device_type,
                    "Uploaded photo"
                );
                Ok(record)
            }
            Err(source) => {
                let blob_removed = match self.service.delete_blob(&key).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "Failed to remove blob after insert failure");
                        false
                    }
                };
                Err(UploadError::Insert {
                    key,
                    blob_removed,
                    source,
                })
            }
        }
    }

    pub async fn find(&self, id: &str) -> Result<PhotoRecord, UploadError> {
        self.service
            .find_record(id)
            .await
            .map_err(|source| UploadError::Lookup {
                id: id.to_string(),
                source,
            })?
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    /// Delete the row first, then the blob.
    ///
    /// A failed row delete changes nothing. Once the row is gone the photo
    /// disappears from every surface, so a failed blob delete is reported
    /// as [`UploadError::OrphanedBlob`] rather than rolled back.
    pub async fn delete(&self, record: &PhotoRecord) -> Result<(), UploadError> {
        self.service
            .delete_record(&record.id)
            .await
            .map_err(|source| UploadError::DeleteRecord {
                id: record.id.clone(),
                source,
            })?;

        if let Err(source) = self.service.delete_blob(&record.file_path).await {
            tracing::error!(
                id = %record.id,
                key = %record.file_path,
                error = %source,
                "Photo deleted but its blob was left behind"
            );
            return Err(UploadError::OrphanedBlob {
                id: record.id.clone(),
                key: record.file_path.clone(),
                source,
            });
        }

        tracing::info!(id = %record.id, key = %record.file_path, "Deleted photo");
        Ok(())
    }

    /// Save a photo into `directory` as `photo-{id}.{ext}`.
    pub async fn download(
        &self,
        record: &PhotoRecord,
        directory: &Path,
    ) -> Result<PathBuf, UploadError> {
        file::download_photo(self.service.as_ref(), record, directory, &self.retry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BlobStream, LocalBackend, StoredBlob};
    use crate::photo::tests::photo;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("photowall")
            .join("upload_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn server_error() -> BackendError {
        BackendError::HttpStatus {
            status: 500,
            url: "test".into(),
            message: "boom".into(),
        }
    }

    /// Records every call; individual steps can be made to fail.
    #[derive(Default)]
    struct FakeService {
        calls: Mutex<Vec<String>>,
        fail_store: bool,
        fail_insert: bool,
        fail_delete_record: bool,
        fail_delete_blob: bool,
        /// Number of `open_blob` calls that fail with a 503 before success.
        flaky_opens: AtomicU32,
    }

    impl FakeService {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UploadService for FakeService {
        async fn store(
            &self,
            key: &str,
            _bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<StoredBlob, BackendError> {
            self.log(format!("store {key} {content_type}"));
            if self.fail_store {
                return Err(server_error());
            }
            Ok(StoredBlob {
                storage_key: key.to_string(),
                public_url: format!("https://cdn.example.com/{key}"),
            })
        }

        async fn insert_record(
            &self,
            blob: &StoredBlob,
            device_type: DeviceType,
        ) -> Result<PhotoRecord, BackendError> {
            self.log(format!("insert {}", blob.storage_key));
            if self.fail_insert {
                return Err(server_error());
            }
            let mut record = photo("new", 0);
            record.file_path = blob.storage_key.clone();
            record.file_url = blob.public_url.clone();
            record.device_type = device_type;
            Ok(record)
        }

        async fn delete_blob(&self, key: &str) -> Result<(), BackendError> {
            self.log(format!("delete_blob {key}"));
            if self.fail_delete_blob {
                return Err(server_error());
            }
            Ok(())
        }

        async fn delete_record(&self, id: &str) -> Result<(), BackendError> {
            self.log(format!("delete_record {id}"));
            if self.fail_delete_record {
                return Err(server_error());
            }
            Ok(())
        }

        async fn find_record(&self, id: &str) -> Result<Option<PhotoRecord>, BackendError> {
            Ok((id == "known").then(|| photo("known", 0)))
        }

        async fn open_blob(&self, record: &PhotoRecord) -> Result<BlobStream, BackendError> {
            self.log(format!("open_blob {}", record.id));
            let remaining = self.flaky_opens.load(Ordering::SeqCst);
            if remaining > 0 {
                self.flaky_opens.store(remaining - 1, Ordering::SeqCst);
                return Err(BackendError::HttpStatus {
                    status: 503,
                    url: record.file_url.clone(),
                    message: String::new(),
                });
            }
            let chunks: Vec<Result<Vec<u8>, BackendError>> =
                vec![Ok(b"jp".to_vec()), Ok(b"eg".to_vec())];
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn uploader(service: FakeService) -> (Arc<FakeService>, Uploader) {
        let service = Arc::new(service);
        let uploader = Uploader::new(service.clone(), RetryConfig::immediate(2));
        (service, uploader)
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(
            storage_key("IMG_0001.JPG", 1_700_000_000_000, "k3j9zq"),
            "photos/1700000000000-k3j9zq.jpg"
        );
        assert_eq!(
            storage_key("capture", 5, "abc123"),
            "photos/5-abc123.jpg"
        );
        assert_eq!(
            storage_key("/tmp/shots.d/frame.png", 5, "abc123"),
            "photos/5-abc123.png"
        );
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("a.HEIC"), "heic");
        assert_eq!(extension_of(".hidden"), "jpg");
        assert_eq!(extension_of("trailing."), "jpg");
        assert_eq!(extension_of("dir.v2/noext"), "jpg");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("jpg"), "image/jpeg");
        assert_eq!(content_type_for("JPEG"), "image/jpeg");
        assert_eq!(content_type_for("png"), "image/png");
        assert_eq!(content_type_for("xyz"), "application/octet-stream");
    }

    #[test]
    fn test_random_suffix_is_base36() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn test_upload_stores_then_inserts() {
        let (service, uploader) = uploader(FakeService::default());
        let record = uploader
            .upload("shot.png", vec![1, 2, 3], DeviceType::Mobile)
            .await
            .unwrap();

        assert!(record.file_path.starts_with("photos/"));
        assert!(record.file_path.ends_with(".png"));
        assert_eq!(record.device_type, DeviceType::Mobile);
        let calls = service.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], format!("store {} image/png", record.file_path));
        assert_eq!(calls[1], format!("insert {}", record.file_path));
    }

    #[tokio::test]
    async fn test_upload_store_failure_writes_nothing() {
        let (service, uploader) = uploader(FakeService {
            fail_store: true,
            ..FakeService::default()
        });
        let err = uploader
            .upload("a.jpg", vec![0], DeviceType::Desktop)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Store { .. }));
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_insert_failure_removes_blob() {
        let (service, uploader) = uploader(FakeService {
            fail_insert: true,
            ..FakeService::default()
        });
        let err = uploader
            .upload("a.jpg", vec![0], DeviceType::Desktop)
            .await
            .unwrap_err();
        match err {
            UploadError::Insert {
                key, blob_removed, ..
            } => {
                assert!(blob_removed);
                assert_eq!(service.calls().last().unwrap(), &format!("delete_blob {key}"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_removes_record_before_blob() {
        let (service, uploader) = uploader(FakeService::default());
        let record = photo("p1", 0);
        uploader.delete(&record).await.unwrap();
        assert_eq!(
            service.calls(),
            vec!["delete_record p1", "delete_blob photos/p1.jpg"]
        );
    }

    #[tokio::test]
    async fn test_delete_record_failure_keeps_blob() {
        let (service, uploader) = uploader(FakeService {
            fail_delete_record: true,
            ..FakeService::default()
        });
        let err = uploader.delete(&photo("p1", 0)).await.unwrap_err();
        assert!(matches!(err, UploadError::DeleteRecord { .. }));
        assert_eq!(service.calls(), vec!["delete_record p1"]);
    }

    #[tokio::test]
    async fn test_delete_blob_failure_reports_orphan() {
        let (_, uploader) = uploader(FakeService {
            fail_delete_blob: true,
            ..FakeService::default()
        });
        let err = uploader.delete(&photo("p1", 0)).await.unwrap_err();
        match err {
            UploadError::OrphanedBlob { id, key, .. } => {
                assert_eq!(id, "p1");
                assert_eq!(key, "photos/p1.jpg");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_find_unknown_is_not_found() {
        let (_, uploader) = uploader(FakeService::default());
        assert_eq!(uploader.find("known").await.unwrap().id, "known");
        assert!(matches!(
            uploader.find("nope").await.unwrap_err(),
            UploadError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_download_retries_transient_failures() {
        let dir = test_dir("download_retry");
        let (service, uploader) = uploader(FakeService {
            flaky_opens: AtomicU32::new(2),
            ..FakeService::default()
        });
        let record = photo("p1", 0);
        let path = uploader.download(&record, &dir).await.unwrap();

        assert_eq!(path, dir.join("photo-p1.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg");
        assert!(!dir.join("photo-p1.jpg.part").exists());
        assert_eq!(service.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_download_gives_up_and_cleans_part_file() {
        let dir = test_dir("download_exhausted");
        let (_, uploader) = uploader(FakeService {
            flaky_opens: AtomicU32::new(10),
            ..FakeService::default()
        });
        let err = uploader.download(&photo("p1", 0), &dir).await.unwrap_err();
        assert!(matches!(err, UploadError::Download { .. }));
        assert!(!dir.join("photo-p1.jpg").exists());
        assert!(!dir.join("photo-p1.jpg.part").exists());
    }

    #[tokio::test]
    async fn test_round_trip_through_local_backend() {
        let dir = test_dir("local_round_trip");
        let backend = Arc::new(LocalBackend::open_in_memory(&dir.join("blobs")).unwrap());
        let uploader = Uploader::new(backend.clone(), RetryConfig::immediate(0));

        let record = uploader
            .upload("party.jpeg", b"raw image".to_vec(), DeviceType::Mobile)
            .await
            .unwrap();
        assert!(record.file_path.ends_with(".jpeg"));

        let saved = uploader.download(&record, &dir.join("out")).await.unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), b"raw image");

        uploader.delete(&record).await.unwrap();
        assert!(matches!(
            uploader.find(&record.id).await.unwrap_err(),
            UploadError::NotFound(_)
        ));
        assert!(!dir.join("blobs").join(&record.file_path).exists());
    }
}
