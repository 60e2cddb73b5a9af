//! HTTP adapter for a hosted backend exposing a PostgREST-style table API
//! (`/rest/v1/{table}`) and an object storage API (`/storage/v1/object`).
//!
//! The table API has no push channel here; wrap the adapter in a
//! [`PollingFeed`](super::PollingFeed) to get live deltas.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::BackendError;
use super::{
    BlobStream, ChangeFeed, SortOrder, StoredBlob, Subscription, SubscriptionId, UploadService,
};
use crate::photo::{DeviceType, EventFilter, PhotoRecord};
use crate::retry::{self, RetryAction, RetryConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Browsers and CDNs may cache a stored photo for an hour.
const BLOB_CACHE_CONTROL: &str = "max-age=3600";

pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: String,
    table: String,
    bucket: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("table", &self.table)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct NewPhotoRow<'a> {
    file_path: &'a str,
    file_url: &'a str,
    device_type: DeviceType,
}

#[derive(Serialize)]
struct RemoveObjects<'a> {
    prefixes: [&'a str; 1],
}

impl RestBackend {
    pub fn new(
        base_url: &str,
        api_key: &str,
        table: &str,
        bucket: &str,
        retry: RetryConfig,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Http {
                url: base_url.to_string(),
                source: e,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            table: table.to_string(),
            bucket: bucket.to_string(),
            retry,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn record_url(&self, id: &str) -> String {
        format!(
            "{}?id=eq.{}",
            self.table_url(),
            urlencoding::encode(id)
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, key
        )
    }

    /// Public locator of a stored object.
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// Send a request built by `build`, retrying transient failures.
    async fn send<F>(&self, url: &str, build: F) -> Result<Response, BackendError>
    where
        F: Fn() -> RequestBuilder,
    {
        retry::retry_with_backoff(
            &self.retry,
            |e: &BackendError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || async {
                let response = self
                    .authorized(build())
                    .send()
                    .await
                    .map_err(|e| BackendError::Http {
                        url: url.to_string(),
                        source: e,
                    })?;
                check_status(url, response).await
            },
        )
        .await
    }
}

/// Turn a non-success response into `HttpStatus`, keeping the body text
/// as the message.
async fn check_status(url: &str, response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(BackendError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
        message,
    })
}

async fn decode_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, BackendError> {
    response.json::<T>().await.map_err(|e| BackendError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ChangeFeed for RestBackend {
    async fn query(&self, order: SortOrder) -> Result<Vec<PhotoRecord>, BackendError> {
        let url = format!(
            "{}?select=*&order={}",
            self.table_url(),
            order.query_param()
        );
        let response = self.send(&url, || self.client.get(&url)).await?;
        decode_json(&url, response).await
    }

    async fn subscribe(&self, _filter: EventFilter) -> Result<Subscription, BackendError> {
        Err(BackendError::Unsupported(
            "REST backend has no push feed; use a polling feed",
        ))
    }

    async fn unsubscribe(&self, _id: SubscriptionId) {}
}

#[async_trait]
impl UploadService for RestBackend {
    async fn store(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredBlob, BackendError> {
        let url = self.object_url(key);
        self.send(&url, || {
            self.client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .header(reqwest::header::CACHE_CONTROL, BLOB_CACHE_CONTROL)
                .header("x-upsert", "false")
                .body(bytes.clone())
        })
        .await?;

        tracing::debug!(%key, size = bytes.len(), "Stored blob");
        Ok(StoredBlob {
            storage_key: key.to_string(),
            public_url: self.public_url(key),
        })
    }

    async fn insert_record(
        &self,
        blob: &StoredBlob,
        device_type: DeviceType,
    ) -> Result<PhotoRecord, BackendError> {
        let url = self.table_url();
        let row = NewPhotoRow {
            file_path: &blob.storage_key,
            file_url: &blob.public_url,
            device_type,
        };
        let response = self
            .send(&url, || {
                self.client
                    .post(&url)
                    .header("Prefer", "return=representation")
                    .json(&row)
            })
            .await?;
        let mut rows: Vec<PhotoRecord> = decode_json(&url, response).await?;
        rows.pop().ok_or_else(|| BackendError::Decode {
            url,
            message: "insert returned no rows".to_string(),
        })
    }

    async fn delete_blob(&self, key: &str) -> Result<(), BackendError> {
        let url = format!("{}/storage/v1/object/{}", self.base_url, self.bucket);
        let body = RemoveObjects { prefixes: [key] };
        self.send(&url, || self.client.delete(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_record(&self, id: &str) -> Result<(), BackendError> {
        let url = self.record_url(id);
        self.send(&url, || self.client.delete(&url)).await?;
        Ok(())
    }

    async fn find_record(&self, id: &str) -> Result<Option<PhotoRecord>, BackendError> {
        let url = format!("{}&select=*", self.record_url(id));
        let response = self.send(&url, || self.client.get(&url)).await?;
        let mut rows: Vec<PhotoRecord> = decode_json(&url, response).await?;
        Ok(rows.pop())
    }

    async fn open_blob(&self, record: &PhotoRecord) -> Result<BlobStream, BackendError> {
        let url = record.file_url.clone();
        let response = self.send(&url, || self.client.get(&url)).await?;
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map(|b| b.to_vec()).map_err(|e| BackendError::Http {
                url: url.clone(),
                source: e,
            })
        });
        Ok(Box::pin(stream))
    }
}
