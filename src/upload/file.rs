use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::UploadError;
use crate::backend::UploadService;
use crate::photo::PhotoRecord;
use crate::retry::{self, RetryAction, RetryConfig};

/// `photo-{id}.{ext}`, with characters that are unsafe in file names
/// replaced.
pub fn download_file_name(record: &PhotoRecord) -> String {
    let id: String = record
        .id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("photo-{}.{}", id, record.extension().unwrap_or("jpg"))
}

fn part_path(download_path: &Path) -> PathBuf {
    let mut name = download_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    download_path.with_file_name(name)
}

/// Download a photo's blob into `directory` using a .part temp file.
///
/// Each attempt starts the .part file from scratch. On completion it is
/// renamed to the final path, which is returned. Transient backend
/// failures are retried with exponential backoff.
pub async fn download_photo(
    service: &dyn UploadService,
    record: &PhotoRecord,
    directory: &Path,
    retry_config: &RetryConfig,
) -> Result<PathBuf, UploadError> {
    fs::create_dir_all(directory).await?;
    let download_path = directory.join(download_file_name(record));
    let part_path = part_path(&download_path);

    let result = retry::retry_with_backoff(
        retry_config,
        |e: &UploadError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        || async {
            let _ = fs::remove_file(&part_path).await;
            attempt_download(service, record, &download_path, &part_path).await
        },
    )
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&part_path).await;
    }
    result.map(|()| download_path)
}

async fn attempt_download(
    service: &dyn UploadService,
    record: &PhotoRecord,
    download_path: &Path,
    part_path: &Path,
) -> Result<(), UploadError> {
    let to_download_error = |source| UploadError::Download {
        id: record.id.clone(),
        source,
    };
    let mut stream = service
        .open_blob(record)
        .await
        .map_err(to_download_error)?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await?;

    let mut bytes_written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::warn!(
                id = %record.id,
                bytes_so_far = bytes_written,
                error = %e,
                "Blob stream failed mid-transfer"
            );
            to_download_error(e)
        })?;
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    fs::rename(part_path, download_path).await?;
    tracing::debug!(
        id = %record.id,
        path = %download_path.display(),
        bytes = bytes_written,
        "Downloaded photo"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::tests::photo;

    #[test]
    fn test_download_file_name() {
        let mut record = photo("3f2a-9c", 0);
        record.file_path = "photos/1700000000000-k3j9.png".into();
        assert_eq!(download_file_name(&record), "photo-3f2a-9c.png");
    }

    #[test]
    fn test_download_file_name_sanitizes_id() {
        let mut record = photo("../etc/passwd", 0);
        record.file_path = "photos/x".into();
        assert_eq!(download_file_name(&record), "photo-___etc_passwd.jpg");
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/tmp/out/photo-1.jpg")),
            PathBuf::from("/tmp/out/photo-1.jpg.part")
        );
    }
}
