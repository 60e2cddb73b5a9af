//! Error types for the backend adapters.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the photo table, blob store or change feed.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// A blob store read or write failed.
    #[error("Blob store error for {key}: {source}")]
    Blob {
        key: String,
        source: std::io::Error,
    },

    /// A storage key that would escape the blob root.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("HTTP error {status} from {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },

    #[error("HTTP request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    /// The backend answered with something we could not interpret.
    #[error("Unexpected response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Photo {0} not found")]
    NotFound(String),

    /// A subscriber fell behind the change feed and events were dropped.
    #[error("Change feed subscriber lagged, {0} events dropped")]
    Lagged(u64),

    #[error("{0}")]
    Unsupported(&'static str),
}

impl BackendError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    /// Whether the failure is transient and the request worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Lagged(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> BackendError {
        BackendError::HttpStatus {
            status: code,
            url: "https://x/rest/v1/photos".into(),
            message: String::new(),
        }
    }

    #[test]
    fn test_client_errors_not_retryable() {
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!status(404).is_retryable());
    }

    #[test]
    fn test_rate_limit_and_server_errors_retryable() {
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
    }

    #[test]
    fn test_local_errors_not_retryable() {
        assert!(!BackendError::NotFound("x".into()).is_retryable());
        assert!(!BackendError::InvalidKey("../x".into()).is_retryable());
        assert!(BackendError::Lagged(3).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BackendError::NotFound("abc".into()).to_string(),
            "Photo abc not found"
        );
        assert_eq!(
            status(503).to_string(),
            "HTTP error 503 from https://x/rest/v1/photos: "
        );
    }
}
