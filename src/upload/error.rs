use thiserror::Error;

use crate::backend::BackendError;

/// Typed upload, delete and download errors.
///
/// Each variant records which step failed, since that decides what state
/// the backend is left in.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Nothing was written.
    #[error("Failed to store {key}: {source}")]
    Store { key: String, source: BackendError },

    /// The blob was stored but its row was not. The blob has been removed
    /// again unless `blob_removed` is false.
    #[error("Failed to record {key}: {source}")]
    Insert {
        key: String,
        blob_removed: bool,
        source: BackendError,
    },

    #[error("Failed to look up photo {id}: {source}")]
    Lookup { id: String, source: BackendError },

    #[error("Photo {0} not found")]
    NotFound(String),

    /// Nothing was deleted.
    #[error("Failed to delete photo {id}: {source}")]
    DeleteRecord { id: String, source: BackendError },

    /// The row is gone but its blob could not be removed.
    #[error("Photo {id} deleted but blob {key} was left behind: {source}")]
    OrphanedBlob {
        id: String,
        key: String,
        source: BackendError,
    },

    #[error("Failed to download photo {id}: {source}")]
    Download { id: String, source: BackendError },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),
}

impl UploadError {
    /// Whether the failure happened on a transient backend condition, so
    /// repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Store { source, .. }
            | UploadError::Insert { source, .. }
            | UploadError::Lookup { source, .. }
            | UploadError::DeleteRecord { source, .. }
            | UploadError::Download { source, .. } => source.is_retryable(),
            UploadError::OrphanedBlob { .. }
            | UploadError::NotFound(_)
            | UploadError::Disk(_) => false,
        }
    }
}
