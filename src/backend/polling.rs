//! Change feed for sources without a push channel: poll the table at a
//! fixed interval and turn the difference between consecutive snapshots
//! into deltas.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::error::BackendError;
use super::{ChangeFeed, SortOrder, Subscription, SubscriptionId};
use crate::photo::{Delta, EventFilter, PhotoRecord};

pub struct PollingFeed {
    source: Arc<dyn ChangeFeed>,
    interval: Duration,
    subscriptions: Mutex<HashMap<u64, CancellationToken>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for PollingFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingFeed")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl PollingFeed {
    pub fn new(source: Arc<dyn ChangeFeed>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }
}

/// State carried between polls of one subscription.
struct Poller {
    source: Arc<dyn ChangeFeed>,
    ticker: tokio::time::Interval,
    token: CancellationToken,
    filter: EventFilter,
    previous: HashMap<String, PhotoRecord>,
    pending: VecDeque<Delta>,
}

impl Poller {
    async fn next(mut self) -> Option<(Result<Delta, BackendError>, Self)> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Some((Ok(delta), self));
            }
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = self.ticker.tick() => {}
            }
            match self.source.query(SortOrder::NewestFirst).await {
                Ok(current) => {
                    let deltas = diff_snapshots(&self.previous, &current);
                    self.pending.extend(
                        deltas
                            .into_iter()
                            .filter(|d| self.filter.accepts(d.kind())),
                    );
                    self.previous = index_by_id(current);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "Poll failed, retrying on next tick");
                }
                Err(e) => {
                    // Report once, then end the stream.
                    self.token.cancel();
                    return Some((Err(e), self));
                }
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for PollingFeed {
    async fn query(&self, order: SortOrder) -> Result<Vec<PhotoRecord>, BackendError> {
        self.source.query(order).await
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<Subscription, BackendError> {
        // The baseline is taken at subscribe time, so only changes made
        // after this point are reported.
        let baseline = self.source.query(SortOrder::NewestFirst).await?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.subscriptions
            .lock()
            .map_err(|e| BackendError::Query(e.to_string()))?
            .insert(id, token.clone());

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; skip it since
        // the baseline was just fetched.
        ticker.reset();

        let poller = Poller {
            source: self.source.clone(),
            ticker,
            token,
            filter,
            previous: index_by_id(baseline),
            pending: VecDeque::new(),
        };
        let stream = stream::unfold(Some(poller), |poller| async move {
            let (item, poller) = poller?.next().await?;
            let carry = (!poller.token.is_cancelled()).then_some(poller);
            Some((item, carry))
        });

        tracing::debug!(
            subscription = id,
            interval_ms = self.interval.as_millis() as u64,
            "Opened polling subscription"
        );
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
            tracing::debug!(subscription = id.0, "Closed polling subscription");
        }
    }
}

fn index_by_id(records: Vec<PhotoRecord>) -> HashMap<String, PhotoRecord> {
    records.into_iter().map(|r| (r.id.clone(), r)).collect()
}

/// Deltas that turn `previous` into `current`.
///
/// Deletes come first, then updates, then inserts oldest first so a
/// consumer sees arrivals in creation order.
pub fn diff_snapshots(
    previous: &HashMap<String, PhotoRecord>,
    current: &[PhotoRecord],
) -> Vec<Delta> {
    let current_ids: std::collections::HashSet<&str> =
        current.iter().map(|r| r.id.as_str()).collect();

    let mut deleted: Vec<&PhotoRecord> = previous
        .values()
        .filter(|r| !current_ids.contains(r.id.as_str()))
        .collect();
    deleted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut deltas: Vec<Delta> = deleted
        .into_iter()
        .map(|r| Delta::Delete { id: r.id.clone() })
        .collect();

    let mut inserted: Vec<&PhotoRecord> = Vec::new();
    for record in current {
        match previous.get(&record.id) {
            Some(old) if old != record => deltas.push(Delta::Update(record.clone())),
            Some(_) => {}
            None => inserted.push(record),
        }
    }
    inserted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    deltas.extend(inserted.into_iter().map(|r| Delta::Insert(r.clone())));
    deltas
}
