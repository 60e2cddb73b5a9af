//! Reconciliation of change-feed deltas into an ordered photo collection.
//!
//! The collection is keyed by photo id and sorted by `created_at`, newest
//! first. A snapshot from the initial fetch and the live delta stream can
//! arrive in either order; deltas received before the snapshot are buffered
//! and replayed on top of it, and every apply operation is idempotent so the
//! replay never duplicates or resurrects a record.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::photo::{Delta, PhotoRecord};

/// Default number of deleted ids remembered to suppress resurrection.
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 4096;

/// Where a newly inserted record goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertStrategy {
    /// Binary-search the descending `created_at` position.
    #[default]
    Positional,
    /// Always insert at the front in O(1).
    ///
    /// Only keeps the collection sorted if the feed delivers inserts in
    /// non-decreasing `created_at` order with no gaps. An older insert
    /// delivered late ends up above newer records.
    PrependOnly,
}

/// Result of applying one delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted { index: usize },
    Updated { index: usize },
    /// Update changed `created_at` and the record was re-positioned.
    Moved { from: usize, to: usize },
    Removed { index: usize },
    /// Insert for an id already present.
    Duplicate,
    /// Update or delete for an id not present.
    Missing,
    /// Insert or update for an id deleted earlier.
    Tombstoned,
    /// Buffered until the next snapshot arrives.
    Deferred,
    /// The reconciler was closed; nothing changed.
    Closed,
}

impl Outcome {
    /// Whether the visible collection changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Self::Inserted { .. } | Self::Updated { .. } | Self::Moved { .. } | Self::Removed { .. }
        )
    }
}

#[derive(Debug)]
enum Phase {
    /// Waiting for a snapshot; deltas are queued in arrival order.
    Syncing(Vec<Delta>),
    Live,
    Closed,
}

/// Bounded FIFO set of deleted ids.
#[derive(Debug)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: &str) {
        if self.capacity == 0 || self.ids.contains(id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Ordered, duplicate-free photo collection fed by a snapshot plus deltas.
///
/// A new reconciler starts in the syncing phase: deltas are buffered until
/// [`initialize`](Self::initialize) supplies the first snapshot.
#[derive(Debug)]
pub struct Reconciler {
    records: Vec<PhotoRecord>,
    ids: HashSet<String>,
    tombstones: Tombstones,
    strategy: InsertStrategy,
    phase: Phase,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(InsertStrategy::default())
    }
}

impl Reconciler {
    pub fn new(strategy: InsertStrategy) -> Self {
        Self::with_tombstone_capacity(strategy, DEFAULT_TOMBSTONE_CAPACITY)
    }

    pub fn with_tombstone_capacity(strategy: InsertStrategy, capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            ids: HashSet::new(),
            tombstones: Tombstones::new(capacity),
            strategy,
            phase: Phase::Syncing(Vec::new()),
        }
    }

    /// Replace the collection with a freshly fetched snapshot, then replay
    /// every delta buffered since the last [`resync`](Self::resync).
    ///
    /// The snapshot is expected newest first; it is re-sorted if not, and
    /// duplicate or already-deleted ids are dropped.
    pub fn initialize(&mut self, snapshot: Vec<PhotoRecord>) {
        let backlog = match std::mem::replace(&mut self.phase, Phase::Live) {
            Phase::Syncing(backlog) => backlog,
            Phase::Live => Vec::new(),
            Phase::Closed => {
                self.phase = Phase::Closed;
                tracing::debug!("Ignoring snapshot for closed reconciler");
                return;
            }
        };

        self.records.clear();
        self.ids.clear();
        for record in snapshot {
            if self.tombstones.contains(&record.id) || self.ids.contains(&record.id) {
                continue;
            }
            self.ids.insert(record.id.clone());
            self.records.push(record);
        }
        // Stable, so records with equal timestamps keep their fetched order.
        self.records
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let replayed = backlog.len();
        for delta in backlog {
            self.apply(delta);
        }
        tracing::debug!(
            records = self.records.len(),
            replayed,
            "Reconciler initialized from snapshot"
        );
    }

    /// Go back to buffering deltas until the next snapshot.
    ///
    /// The current collection stays readable meanwhile. Anything buffered
    /// by an earlier, unfinished sync is dropped: those deltas predate the
    /// next snapshot.
    pub fn resync(&mut self) {
        if !matches!(self.phase, Phase::Closed) {
            self.phase = Phase::Syncing(Vec::new());
        }
    }

    /// Stop accepting snapshots and deltas.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Apply one delta of any kind.
    pub fn apply(&mut self, delta: Delta) -> Outcome {
        match delta {
            Delta::Insert(record) => self.apply_insert(record),
            Delta::Update(record) => self.apply_update(record),
            Delta::Delete { id } => self.apply_delete(&id),
        }
    }

    pub fn apply_insert(&mut self, record: PhotoRecord) -> Outcome {
        match &mut self.phase {
            Phase::Closed => return Outcome::Closed,
            Phase::Syncing(backlog) => {
                backlog.push(Delta::Insert(record));
                return Outcome::Deferred;
            }
            Phase::Live => {}
        }

        if self.tombstones.contains(&record.id) {
            return Outcome::Tombstoned;
        }
        if self.ids.contains(&record.id) {
            return Outcome::Duplicate;
        }

        let index = match self.strategy {
            InsertStrategy::Positional => self.position_for(&record),
            InsertStrategy::PrependOnly => 0,
        };
        self.ids.insert(record.id.clone());
        self.records.insert(index, record);
        Outcome::Inserted { index }
    }

    pub fn apply_update(&mut self, record: PhotoRecord) -> Outcome {
        match &mut self.phase {
            Phase::Closed => return Outcome::Closed,
            Phase::Syncing(backlog) => {
                backlog.push(Delta::Update(record));
                return Outcome::Deferred;
            }
            Phase::Live => {}
        }

        if self.tombstones.contains(&record.id) {
            return Outcome::Tombstoned;
        }
        let Some(from) = self.index_of(&record.id) else {
            return Outcome::Missing;
        };

        if self.records[from].created_at == record.created_at {
            self.records[from] = record;
            return Outcome::Updated { index: from };
        }

        self.records.remove(from);
        let to = self.position_for(&record);
        self.records.insert(to, record);
        Outcome::Moved { from, to }
    }

    pub fn apply_delete(&mut self, id: &str) -> Outcome {
        match &mut self.phase {
            Phase::Closed => return Outcome::Closed,
            Phase::Syncing(backlog) => {
                backlog.push(Delta::Delete { id: id.to_string() });
                return Outcome::Deferred;
            }
            Phase::Live => {}
        }

        self.tombstones.insert(id);
        let Some(index) = self.index_of(id) else {
            return Outcome::Missing;
        };
        self.records.remove(index);
        self.ids.remove(id);
        Outcome::Removed { index }
    }

    /// Records in display order.
    pub fn records(&self) -> &[PhotoRecord] {
        &self.records
    }

    /// Shared copy of the collection for readers.
    pub fn snapshot(&self) -> Arc<[PhotoRecord]> {
        Arc::from(self.records.as_slice())
    }

    pub fn get(&self, id: &str) -> Option<&PhotoRecord> {
        self.index_of(id).map(|i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the collection is sorted newest first.
    pub fn is_ordered(&self) -> bool {
        self.records
            .windows(2)
            .all(|w| w[0].created_at >= w[1].created_at)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.records.iter().position(|r| r.id == id)
    }

    /// First index whose record is not newer than `record`, so a new record
    /// lands above existing ones with the same timestamp.
    fn position_for(&self, record: &PhotoRecord) -> usize {
        self.records
            .partition_point(|r| r.created_at > record.created_at)
    }
}
