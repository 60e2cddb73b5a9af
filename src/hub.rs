//! Shared live photo collection.
//!
//! A [`FeedHub`] owns the only [`Reconciler`] in the process. Its background
//! task subscribes to the change feed, fetches the initial snapshot while
//! buffering deltas, and then applies deltas as they arrive. Surfaces get a
//! `watch` receiver and only ever see immutable snapshots, so any number of
//! them can share one subscription.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChangeFeed, DeltaStream, SortOrder};
use crate::photo::{EventFilter, PhotoRecord};
use crate::reconcile::{InsertStrategy, Reconciler, DEFAULT_TOMBSTONE_CAPACITY};
use crate::retry::RetryConfig;

/// Connection state shown alongside the photos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// Subscribing and fetching the initial snapshot.
    Connecting,
    Live,
    /// The initial fetch failed. Not retried unless reconnect is enabled.
    Failed(String),
    /// The live subscription dropped; photos may be stale.
    Disconnected(String),
    /// Torn down.
    Closed,
}

/// What a surface sees: the photos newest first plus the feed state.
#[derive(Debug, Clone)]
pub struct Gallery {
    pub photos: Arc<[PhotoRecord]>,
    pub status: FeedStatus,
}

impl Gallery {
    fn connecting() -> Self {
        Self {
            photos: Arc::from(Vec::new()),
            status: FeedStatus::Connecting,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub strategy: InsertStrategy,
    pub tombstone_capacity: usize,
    /// Resubscribe and refetch after a failure. `None` leaves the hub in
    /// the failed or disconnected state until teardown.
    pub reconnect: Option<RetryConfig>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            strategy: InsertStrategy::Positional,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
            reconnect: None,
        }
    }
}

pub struct FeedHub {
    view: watch::Receiver<Gallery>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FeedHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHub")
            .field("status", &self.view.borrow().status)
            .finish_non_exhaustive()
    }
}

impl FeedHub {
    /// Spawn the feed task. Must be called from within a tokio runtime.
    pub fn start(feed: Arc<dyn ChangeFeed>, settings: HubSettings) -> Self {
        let (tx, view) = watch::channel(Gallery::connecting());
        let token = CancellationToken::new();
        let task = tokio::spawn(run(feed, settings, tx, token.clone()));
        Self {
            view,
            token,
            task: Mutex::new(Some(task)),
        }
    }

    /// A new read-only view of the collection.
    pub fn view(&self) -> watch::Receiver<Gallery> {
        self.view.clone()
    }

    pub fn current(&self) -> Gallery {
        self.view.borrow().clone()
    }

    /// Stop the feed task, release the subscription and close the
    /// collection. Later calls are no-ops.
    pub async fn teardown(&self) {
        self.token.cancel();
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Photo feed task ended abnormally");
            }
            tracing::debug!("Photo feed torn down");
        }
    }
}

impl Drop for FeedHub {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum SessionEnd {
    Cancelled,
    FetchFailed(String),
    Dropped { message: String, was_live: bool },
}

fn publish(tx: &watch::Sender<Gallery>, reconciler: &Reconciler, status: FeedStatus) {
    tx.send_replace(Gallery {
        photos: reconciler.snapshot(),
        status,
    });
}

async fn run(
    feed: Arc<dyn ChangeFeed>,
    settings: HubSettings,
    tx: watch::Sender<Gallery>,
    token: CancellationToken,
) {
    let mut reconciler =
        Reconciler::with_tombstone_capacity(settings.strategy, settings.tombstone_capacity);
    let mut failures = 0u32;

    loop {
        let (status, was_live) = match session(feed.as_ref(), &mut reconciler, &tx, &token).await
        {
            SessionEnd::Cancelled => break,
            SessionEnd::FetchFailed(message) => {
                tracing::error!(error = %message, "Failed to load photos");
                (FeedStatus::Failed(message), false)
            }
            SessionEnd::Dropped { message, was_live } => {
                tracing::warn!(error = %message, "Photo feed disconnected");
                (FeedStatus::Disconnected(message), was_live)
            }
        };
        publish(&tx, &reconciler, status);
        if was_live {
            failures = 0;
        }

        let retry = match &settings.reconnect {
            Some(retry) if failures < retry.max_retries => retry,
            Some(_) => {
                tracing::error!(failures, "Giving up on photo feed reconnects");
                token.cancelled().await;
                break;
            }
            None => {
                token.cancelled().await;
                break;
            }
        };
        let delay = retry.delay_for_retry(failures);
        failures += 1;
        tracing::info!(
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting photo feed"
        );
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        reconciler.resync();
    }

    reconciler.close();
    publish(&tx, &reconciler, FeedStatus::Closed);
}

/// One subscribe + fetch + follow cycle. Every successful subscribe is
/// paired with exactly one unsubscribe.
async fn session(
    feed: &dyn ChangeFeed,
    reconciler: &mut Reconciler,
    tx: &watch::Sender<Gallery>,
    token: &CancellationToken,
) -> SessionEnd {
    tx.send_modify(|g| g.status = FeedStatus::Connecting);

    // Subscribe before fetching so no delta committed after the snapshot
    // can be missed.
    let subscribed = tokio::select! {
        _ = token.cancelled() => return SessionEnd::Cancelled,
        subscribed = feed.subscribe(EventFilter::ALL) => subscribed,
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(e) => {
            return SessionEnd::Dropped {
                message: format!("subscribe failed: {e}"),
                was_live: false,
            }
        }
    };

    let end = follow(feed, &mut subscription.stream, reconciler, tx, token).await;
    feed.unsubscribe(subscription.id).await;
    end
}

async fn follow(
    feed: &dyn ChangeFeed,
    stream: &mut DeltaStream,
    reconciler: &mut Reconciler,
    tx: &watch::Sender<Gallery>,
    token: &CancellationToken,
) -> SessionEnd {
    let mut fetch = feed.query(SortOrder::NewestFirst);

    // Deltas arriving before the snapshot are buffered by the reconciler.
    let fetched = loop {
        tokio::select! {
            _ = token.cancelled() => return SessionEnd::Cancelled,
            fetched = &mut fetch => break fetched,
            item = stream.next() => match item {
                Some(Ok(delta)) => {
                    tracing::debug!(kind = delta.kind().as_str(), id = delta.id(), "Buffered delta during fetch");
                    reconciler.apply(delta);
                }
                Some(Err(e)) => {
                    return SessionEnd::Dropped { message: e.to_string(), was_live: false };
                }
                None => {
                    return SessionEnd::Dropped {
                        message: "change feed closed".to_string(),
                        was_live: false,
                    };
                }
            },
        }
    };

    let records = match fetched {
        Ok(records) => records,
        Err(e) => return SessionEnd::FetchFailed(e.to_string()),
    };
    reconciler.initialize(records);
    publish(tx, reconciler, FeedStatus::Live);
    tracing::info!(photos = reconciler.len(), "Photo feed live");

    loop {
        let item = tokio::select! {
            _ = token.cancelled() => return SessionEnd::Cancelled,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(delta)) => {
                let kind = delta.kind();
                let id = delta.id().to_string();
                let outcome = reconciler.apply(delta);
                tracing::debug!(kind = kind.as_str(), %id, ?outcome, "Applied delta");
                if outcome.changed() {
                    publish(tx, reconciler, FeedStatus::Live);
                }
            }
            Some(Err(e)) => {
                return SessionEnd::Dropped {
                    message: e.to_string(),
                    was_live: true,
                }
            }
            None => {
                return SessionEnd::Dropped {
                    message: "change feed closed".to_string(),
                    was_live: true,
                }
            }
        }
    }
}
