//! §4.8 Collection core — the source-of-truth type every live query and
//! effect ultimately subscribes to, and §6's "downward (source
//! collaborator) interface" that real storage adapters are expected to
//! implement. Storage/persistence adapters are explicitly out of scope
//! (spec.md §1); this module ships the one concrete, in-memory
//! implementation the coordinator (§4.10) and this crate's own test suite
//! subscribe to.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::change::Change;
use crate::expr::Expr;
use crate::index::{Direction, HashIndex, Nulls, SortedIndex};
use crate::key::Key;
use crate::value::Value;

/// §3 "status" state machine: `idle -> loading -> initialCommit -> ready`,
/// with `error` reachable from `loading|initialCommit`, and
/// `ready -> cleanedUp` after `gcTime` of zero subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStatus {
    Idle,
    Loading,
    InitialCommit,
    Ready,
    /// Carries a human-readable description rather than the full
    /// [`crate::error::IvmError`] — a status is a descriptive snapshot
    /// notified to subscribers, not a recoverable error value, and holding
    /// the full error type here would make `IvmError::Source` recursive.
    Error(String),
    CleanedUp,
}

impl CollectionStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, CollectionStatus::Ready | CollectionStatus::InitialCommit)
    }
}

/// Lifecycle events a collection notifies listeners of (§4.8 `on`/`once`/
/// `off`).
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    StatusChange(CollectionStatus),
    SubscribersChange(usize),
    IndexAdded(String),
    IndexRemoved(String),
}

/// Options for [`Collection::subscribe_changes`] (§4.8 `opts`).
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub include_initial_state: bool,
    pub where_expression: Option<Expr>,
}

/// Options for [`Collection::current_state_as_changes`] (§4.8).
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub where_expression: Option<Expr>,
}

fn matches(expr: &Option<Expr>, row: &Value) -> bool {
    match expr {
        None => true,
        Some(e) => matches!(e.eval(row).0, serde_json::Value::Bool(true)),
    }
}

struct Subscriber {
    id: u64,
    where_expression: Option<Expr>,
    callback: Box<dyn FnMut(&[Change])>,
}

struct Listener {
    id: u64,
    callback: Box<dyn FnMut(&CollectionEvent)>,
}

/// One registered index, dispatched by kind (§4.7).
enum IndexEntry {
    Hash(HashIndex),
    Sorted(SortedIndex),
}

impl IndexEntry {
    fn signature(&self) -> &str {
        match self {
            IndexEntry::Hash(h) => &h.signature,
            IndexEntry::Sorted(s) => &s.signature,
        }
    }
    fn add(&mut self, pk: Key, row: &Value) {
        match self {
            IndexEntry::Hash(h) => h.add(pk, row),
            IndexEntry::Sorted(s) => s.add(pk, row),
        }
    }
    fn remove(&mut self, pk: &Key, row: &Value) {
        match self {
            IndexEntry::Hash(h) => h.remove(pk, row),
            IndexEntry::Sorted(s) => s.remove(pk.clone(), row),
        }
    }
    fn update(&mut self, pk: Key, old: &Value, new: &Value) {
        match self {
            IndexEntry::Hash(h) => h.update(pk, old, new),
            IndexEntry::Sorted(s) => s.update(pk, old, new),
        }
    }
}

/// The in-memory reference collection (§4.8, §6 downward interface).
///
/// `getKey` is caller-provided (§6): the collection itself never derives
/// primary keys from row content.
pub struct Collection {
    rows: BTreeMap<Key, Value>,
    get_key: Box<dyn Fn(&Value) -> Key>,
    status: CollectionStatus,
    subscribers: Vec<Subscriber>,
    listeners: Vec<Listener>,
    indexes: Vec<IndexEntry>,
    next_sub_id: u64,
    next_listener_id: u64,
    gc_time: Option<Duration>,
    zero_subscribers_since: Option<Instant>,
}

impl Collection {
    pub fn new(get_key: impl Fn(&Value) -> Key + 'static) -> Self {
        Collection {
            rows: BTreeMap::new(),
            get_key: Box::new(get_key),
            status: CollectionStatus::Idle,
            subscribers: Vec::new(),
            listeners: Vec::new(),
            indexes: Vec::new(),
            next_sub_id: 0,
            next_listener_id: 0,
            gc_time: None,
            zero_subscribers_since: None,
        }
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    // -- §4.8 reads --

    pub fn get(&self, pk: &Key) -> Option<&Value> {
        self.rows.get(pk)
    }

    pub fn has(&self, pk: &Key) -> bool {
        self.rows.contains_key(pk)
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.rows.values()
    }

    pub fn status(&self) -> &CollectionStatus {
        &self.status
    }

    pub fn get_key(&self, value: &Value) -> Key {
        (self.get_key)(value)
    }

    // -- status machine --

    fn set_status(&mut self, status: CollectionStatus) {
        if self.status == status {
            return;
        }
        self.status = status.clone();
        tracing::debug!(status = ?status, "collection status change");
        self.notify_listeners(&CollectionEvent::StatusChange(status));
    }

    pub fn start_loading(&mut self) {
        self.set_status(CollectionStatus::Loading);
    }

    pub fn begin_initial_commit(&mut self) {
        self.set_status(CollectionStatus::InitialCommit);
    }

    pub fn mark_ready(&mut self) {
        self.set_status(CollectionStatus::Ready);
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.set_status(CollectionStatus::Error(reason.into()));
    }

    fn maybe_clean_up(&mut self, now: Instant) {
        if self.status == CollectionStatus::Ready && self.subscribers.is_empty() {
            if let (Some(since), Some(gc)) = (self.zero_subscribers_since, self.gc_time) {
                if now.duration_since(since) >= gc {
                    self.set_status(CollectionStatus::CleanedUp);
                }
            }
        }
    }

    /// Drives garbage-collection: call periodically (or at least once per
    /// `gc_time`) from the host's event loop. A collection with no
    /// `gc_time` configured never auto-cleans.
    pub fn tick_gc(&mut self, now: Instant) {
        self.maybe_clean_up(now);
    }

    // -- indexes (§4.7) --

    pub fn create_hash_index(&mut self, extract: &Expr, resolver: &str) -> String {
        let mut idx = HashIndex::new(extract, resolver);
        for (pk, row) in &self.rows {
            idx.add(pk.clone(), row);
        }
        let sig = idx.signature.clone();
        self.indexes.push(IndexEntry::Hash(idx));
        self.notify_listeners(&CollectionEvent::IndexAdded(sig.clone()));
        sig
    }

    pub fn create_sorted_index(&mut self, extract: &Expr, direction: Direction, nulls: Nulls, resolver: &str) -> String {
        let mut idx = SortedIndex::new(extract, direction, nulls, resolver);
        for (pk, row) in &self.rows {
            idx.add(pk.clone(), row);
        }
        let sig = idx.signature.clone();
        self.indexes.push(IndexEntry::Sorted(idx));
        self.notify_listeners(&CollectionEvent::IndexAdded(sig.clone()));
        sig
    }

    pub fn remove_index(&mut self, signature: &str) {
        if let Some(pos) = self.indexes.iter().position(|i| i.signature() == signature) {
            self.indexes.remove(pos);
            self.notify_listeners(&CollectionEvent::IndexRemoved(signature.to_string()));
        }
    }

    pub fn sorted_index(&self, signature: &str) -> Option<&SortedIndex> {
        self.indexes.iter().find_map(|i| match i {
            IndexEntry::Sorted(s) if s.signature == signature => Some(s),
            _ => None,
        })
    }

    pub fn hash_index(&self, signature: &str) -> Option<&HashIndex> {
        self.indexes.iter().find_map(|i| match i {
            IndexEntry::Hash(h) if h.signature == signature => Some(h),
            _ => None,
        })
    }

    // -- subscriptions (§4.8 `subscribeChanges`) --

    /// Subscribes to future changes. Returns a subscriber id usable with
    /// [`Collection::unsubscribe`]. If `opts.include_initial_state`, the
    /// callback is invoked immediately (before this call returns) with
    /// insert changes for every currently matching row.
    pub fn subscribe_changes(&mut self, opts: SubscribeOptions, mut callback: impl FnMut(&[Change]) + 'static) -> u64 {
        if opts.include_initial_state {
            let initial: Vec<Change> = self
                .rows
                .iter()
                .filter(|(_, v)| matches(&opts.where_expression, v))
                .map(|(k, v)| Change::Insert { key: k.clone(), value: v.clone() })
                .collect();
            if !initial.is_empty() {
                callback(&initial);
            }
        }
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.zero_subscribers_since = None;
        self.subscribers.push(Subscriber { id, where_expression: opts.where_expression, callback: Box::new(callback) });
        self.notify_listeners(&CollectionEvent::SubscribersChange(self.subscribers.len()));
        id
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.subscribers.retain(|s| s.id != id);
        if self.subscribers.is_empty() {
            self.zero_subscribers_since = Some(Instant::now());
        }
        self.notify_listeners(&CollectionEvent::SubscribersChange(self.subscribers.len()));
    }

    /// `currentStateAsChanges(opts)` (§4.8): a synchronous snapshot as
    /// insert changes, independent of any subscription.
    pub fn current_state_as_changes(&self, opts: &SnapshotOptions) -> Vec<Change> {
        self.rows
            .iter()
            .filter(|(_, v)| matches(&opts.where_expression, v))
            .map(|(k, v)| Change::Insert { key: k.clone(), value: v.clone() })
            .collect()
    }

    // -- event listeners (§4.8 `on`/`once`/`off`) --

    pub fn on(&mut self, callback: impl FnMut(&CollectionEvent) + 'static) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push(Listener { id, callback: Box::new(callback) });
        id
    }

    pub fn off(&mut self, id: u64) {
        self.listeners.retain(|l| l.id != id);
    }

    fn notify_listeners(&mut self, event: &CollectionEvent) {
        for l in &mut self.listeners {
            (l.callback)(event);
        }
    }

    // -- mutation (single-writer, §5) --

    /// Applies one batch of changes: maintains every index synchronously,
    /// then notifies each subscriber with the subset of the batch matching
    /// its `where_expression` (§4.8, §5 "subscribers always see a
    /// consistent index state").
    pub fn apply_batch(&mut self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        for change in &changes {
            match change {
                Change::Insert { key, value } => {
                    for idx in &mut self.indexes {
                        idx.add(key.clone(), value);
                    }
                    self.rows.insert(key.clone(), value.clone());
                }
                Change::Delete { key, value } => {
                    for idx in &mut self.indexes {
                        idx.remove(key, value);
                    }
                    self.rows.remove(key);
                }
                Change::Update { key, previous_value, value } => {
                    for idx in &mut self.indexes {
                        idx.update(key.clone(), previous_value, value);
                    }
                    self.rows.insert(key.clone(), value.clone());
                }
            }
        }
        for sub in &mut self.subscribers {
            let matching: Vec<Change> = changes
                .iter()
                .filter(|c| matches_change(&sub.where_expression, c))
                .cloned()
                .collect();
            if !matching.is_empty() {
                (sub.callback)(&matching);
            }
        }
    }

    pub fn insert(&mut self, value: Value) {
        let key = self.get_key(&value);
        self.apply_batch(vec![Change::Insert { key, value }]);
    }

    pub fn update(&mut self, value: Value) {
        let key = self.get_key(&value);
        let previous_value = self.rows.get(&key).cloned().unwrap_or(Value::null());
        self.apply_batch(vec![Change::Update { key, previous_value, value }]);
    }

    pub fn delete(&mut self, pk: &Key) {
        if let Some(value) = self.rows.get(pk).cloned() {
            self.apply_batch(vec![Change::Delete { key: pk.clone(), value }]);
        }
    }

    /// Truncate semantics (§4.8 "Truncate"): subscribers see deletes for
    /// every row currently known, followed by inserts for `new_rows`,
    /// within one batch.
    pub fn truncate(&mut self, new_rows: Vec<Value>) {
        let mut batch: Vec<Change> = self
            .rows
            .iter()
            .map(|(k, v)| Change::Delete { key: k.clone(), value: v.clone() })
            .collect();
        for value in new_rows {
            let key = self.get_key(&value);
            batch.push(Change::Insert { key, value });
        }
        self.apply_batch(batch);
    }
}

fn matches_change(expr: &Option<Expr>, change: &Change) -> bool {
    match change {
        Change::Insert { value, .. } | Change::Delete { value, .. } => matches(expr, value),
        Change::Update { previous_value, value, .. } => matches(expr, previous_value) || matches(expr, value),
    }
}
