//! The remote store contract.
//!
//! The remote store is the durable backend: CRUD on named collections plus a
//! push feed of row changes. Its feed is at-least-once, may reorder, and may
//! silently drop changes after a connectivity gap, which it signals with a
//! [`RemoteChange::ResyncRequired`] marker.

use crate::RemoteResult;
use async_trait::async_trait;
use feedsync_model::{Collection, Entity, EntityKey, EntityPatch};
use feedsync_types::{Timestamp, UserId};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Row operation reported by the push feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RawOp {
    Insert,
    Update,
    Delete,
}

/// A row change as the remote pushes it.
///
/// Deletes usually carry only the key columns in `old`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub table: String,
    #[serde(rename = "eventType")]
    pub op: RawOp,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
    pub commit_timestamp: Timestamp,
}

/// An item of the push feed.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Row(RawChange),
    /// Changes may have been lost; the subscriber must resync.
    ResyncRequired,
}

/// Every row of a collection at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSnapshot {
    pub rows: Vec<Value>,
    /// Server time the snapshot reflects.
    pub as_of: Timestamp,
}

/// Server-side row filter for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionFilter {
    #[default]
    All,
    /// Rows whose column equals a value.
    Eq { column: String, value: String },
}

impl SubscriptionFilter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        SubscriptionFilter::Eq {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Whether a row passes the filter.
    ///
    /// Rows lacking the filtered column (key-only delete payloads) pass.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Eq { column, value } => match row.get(column) {
                Some(Value::String(s)) => s == value,
                Some(other) => other.to_string() == *value,
                None => true,
            },
        }
    }
}

/// The durable backend the sync core writes to and listens on.
///
/// Every write carries the caller's identity; the core never derives it.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts a record, returning it with server-assigned fields.
    async fn insert(&self, caller: UserId, record: Entity) -> RemoteResult<Entity>;

    /// Applies a partial update, returning the new record.
    async fn update(&self, caller: UserId, key: EntityKey, patch: EntityPatch)
    -> RemoteResult<Entity>;

    /// Deletes a record.
    async fn delete(&self, caller: UserId, key: EntityKey) -> RemoteResult<()>;

    /// Opens a push feed of row changes for one collection.
    async fn subscribe(
        &self,
        collection: Collection,
        filter: SubscriptionFilter,
    ) -> RemoteResult<BoxStream<'static, RemoteChange>>;

    /// Fetches every row of a collection.
    async fn snapshot(&self, collection: Collection) -> RemoteResult<RawSnapshot>;
}

/// In-memory remote store for tests and simulations.
pub mod memory {
    use super::*;
    use crate::RemoteError;
    use feedsync_types::EntityId;
    use futures::StreamExt;
    use futures::channel::mpsc;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tokio::sync::watch;
    use tracing::debug;

    /// A call received by [`MemoryRemote`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RemoteCall {
        Insert(EntityKey),
        Update(EntityKey),
        Delete(EntityKey),
        Subscribe(Collection),
        Snapshot(Collection),
    }

    struct Subscriber {
        collection: Collection,
        filter: SubscriptionFilter,
        tx: mpsc::UnboundedSender<RemoteChange>,
    }

    #[derive(Default)]
    struct Inner {
        clock: Timestamp,
        tables: HashMap<Collection, BTreeMap<EntityKey, Entity>>,
        subscribers: Vec<Subscriber>,
        failures: VecDeque<RemoteError>,
        snapshot_failures: usize,
        feed_interrupted: bool,
        latency: Duration,
        calls: Vec<RemoteCall>,
    }

    impl Inner {
        fn tick(&mut self) -> Timestamp {
            self.clock = self.clock.tick();
            self.clock
        }

        fn table(&mut self, collection: Collection) -> &mut BTreeMap<EntityKey, Entity> {
            self.tables.entry(collection).or_default()
        }

        fn is_live(&self, key: &EntityKey) -> bool {
            self.tables
                .get(&key.collection())
                .is_some_and(|t| t.contains_key(key))
        }

        fn publish(&mut self, collection: Collection, change: RemoteChange) {
            if self.feed_interrupted {
                debug!(%collection, "feed interrupted, change dropped");
                return;
            }
            self.subscribers.retain(|sub| {
                if sub.collection != collection {
                    return true;
                }
                let wanted = match &change {
                    RemoteChange::Row(raw) => raw
                        .new
                        .as_ref()
                        .or(raw.old.as_ref())
                        .is_none_or(|row| sub.filter.matches(row)),
                    RemoteChange::ResyncRequired => true,
                };
                !wanted || sub.tx.unbounded_send(change.clone()).is_ok()
            });
        }

        fn publish_row(&mut self, op: RawOp, record: &Entity, at: Timestamp) {
            let collection = record.collection();
            let row = record.to_row().ok();
            let (new, old) = match op {
                RawOp::Delete => (None, Some(key_row(&record.key()))),
                RawOp::Insert | RawOp::Update => (row, None),
            };
            self.publish(
                collection,
                RemoteChange::Row(RawChange {
                    table: collection.table_name().to_string(),
                    op,
                    new,
                    old,
                    commit_timestamp: at,
                }),
            );
        }
    }

    /// The key columns of a record, as sent in delete payloads.
    pub fn key_row(key: &EntityKey) -> Value {
        match *key {
            EntityKey::Profile { id } => json!({ "id": id }),
            EntityKey::Post { id } | EntityKey::Comment { id } => json!({ "id": id }),
            EntityKey::Like { post_id, user_id } => {
                json!({ "post_id": post_id, "user_id": user_id })
            }
            EntityKey::Follow {
                follower_id,
                followee_id,
            } => json!({ "follower_id": follower_id, "followee_id": followee_id }),
        }
    }

    /// A remote store held in memory.
    ///
    /// Assigns server ids to posts and comments, stamps every write with a
    /// monotonic server timestamp, and pushes row changes to subscribers.
    /// Test hooks inject failures, hold writes, and simulate feed gaps.
    pub struct MemoryRemote {
        inner: Mutex<Inner>,
        gate: watch::Sender<bool>,
    }

    impl Default for MemoryRemote {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryRemote {
        pub fn new() -> Self {
            let (gate, _) = watch::channel(true);
            Self {
                inner: Mutex::new(Inner::default()),
                gate,
            }
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        // ── Test hooks ───────────────────────────────────────────

        /// Stores a record directly, stamped with a fresh server timestamp,
        /// without notifying subscribers. Returns the stored record.
        pub fn seed(&self, record: impl Into<Entity>) -> Entity {
            let mut inner = self.lock();
            let at = inner.tick();
            let record: Entity = record.into();
            let record = record.with_version(at);
            inner.table(record.collection()).insert(record.key(), record.clone());
            record
        }

        /// Returns the server's copy of a record.
        pub fn get(&self, key: &EntityKey) -> Option<Entity> {
            self.lock()
                .tables
                .get(&key.collection())
                .and_then(|t| t.get(key).cloned())
        }

        /// Number of rows in a table.
        pub fn row_count(&self, collection: Collection) -> usize {
            self.lock().tables.get(&collection).map_or(0, BTreeMap::len)
        }

        /// The current server time.
        pub fn now(&self) -> Timestamp {
            self.lock().clock
        }

        /// Delays every write by `latency` before it is applied.
        pub fn set_latency(&self, latency: Duration) {
            self.lock().latency = latency;
        }

        /// Makes the next write fail with `err`.
        pub fn fail_next(&self, err: RemoteError) {
            self.lock().failures.push_back(err);
        }

        /// Makes the next `count` snapshot fetches fail with a network error.
        pub fn fail_next_snapshots(&self, count: usize) {
            self.lock().snapshot_failures += count;
        }

        /// Holds every write until [`release`](Self::release).
        pub fn hold(&self) {
            self.gate.send_replace(false);
        }

        /// Lets held writes proceed.
        pub fn release(&self) {
            self.gate.send_replace(true);
        }

        /// Calls received so far, in order.
        pub fn calls(&self) -> Vec<RemoteCall> {
            self.lock().calls.clone()
        }

        /// Stops delivering changes; they are dropped, as over a broken link.
        pub fn interrupt_feed(&self) {
            self.lock().feed_interrupted = true;
        }

        /// Resumes delivery and tells every subscriber to resync.
        pub fn restore_feed(&self) {
            let mut inner = self.lock();
            inner.feed_interrupted = false;
            for collection in Collection::ALL {
                inner.publish(collection, RemoteChange::ResyncRequired);
            }
        }

        /// Pushes a raw change to the subscribers of `collection`, as if
        /// another client had written it.
        pub fn push(&self, collection: Collection, change: RemoteChange) {
            self.lock().publish(collection, change);
        }

        /// Pushes the current server copy of a record again (a duplicate
        /// delivery).
        pub fn redeliver(&self, key: &EntityKey) {
            let mut inner = self.lock();
            let Some(record) = inner
                .tables
                .get(&key.collection())
                .and_then(|t| t.get(key).cloned())
            else {
                return;
            };
            let at = record.updated_at();
            inner.publish_row(RawOp::Update, &record, at);
        }

        // ── Internals ────────────────────────────────────────────

        async fn admit(&self, call: RemoteCall) -> RemoteResult<()> {
            self.lock().calls.push(call);
            let mut open = self.gate.subscribe();
            if open.wait_for(|open| *open).await.is_err() {
                return Err(RemoteError::Network("remote shut down".into()));
            }
            let latency = self.lock().latency;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match self.lock().failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn apply_insert(&self, caller: UserId, record: Entity) -> RemoteResult<Entity> {
            let mut inner = self.lock();
            let at = inner.tick();
            let record = match record {
                Entity::Post(mut post) => {
                    post.id = EntityId::new();
                    post.author_id = caller;
                    post.created_at = at;
                    post.updated_at = at;
                    post.deleted = false;
                    Entity::Post(post)
                }
                Entity::Comment(mut comment) => {
                    if !inner.is_live(&EntityKey::post(comment.post_id)) {
                        return Err(RemoteError::NotFound);
                    }
                    comment.id = EntityId::new();
                    comment.author_id = caller;
                    comment.created_at = at;
                    comment.updated_at = at;
                    comment.deleted = false;
                    Entity::Comment(comment)
                }
                other => {
                    if inner.is_live(&other.key()) {
                        return Err(RemoteError::Conflict);
                    }
                    if let Entity::Like(like) = &other {
                        if !inner.is_live(&EntityKey::post(like.post_id)) {
                            return Err(RemoteError::NotFound);
                        }
                    }
                    other.with_version(at)
                }
            };
            inner.table(record.collection()).insert(record.key(), record.clone());
            inner.publish_row(RawOp::Insert, &record, at);
            Ok(record)
        }

        fn apply_update(&self, key: EntityKey, patch: EntityPatch) -> RemoteResult<Entity> {
            let mut inner = self.lock();
            let current = inner
                .tables
                .get(&key.collection())
                .and_then(|t| t.get(&key))
                .ok_or(RemoteError::NotFound)?;
            let patched = patch
                .apply(current)
                .map_err(|e| RemoteError::Rejected(e.to_string()))?;
            let at = inner.tick();
            let record = patched.with_version(at);
            inner.table(key.collection()).insert(key, record.clone());
            inner.publish_row(RawOp::Update, &record, at);
            Ok(record)
        }

        fn apply_delete(&self, key: EntityKey) -> RemoteResult<()> {
            let mut inner = self.lock();
            let record = inner
                .table(key.collection())
                .remove(&key)
                .ok_or(RemoteError::NotFound)?;
            let at = inner.tick();
            inner.publish_row(RawOp::Delete, &record, at);
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn insert(&self, caller: UserId, record: Entity) -> RemoteResult<Entity> {
            self.admit(RemoteCall::Insert(record.key())).await?;
            self.apply_insert(caller, record)
        }

        async fn update(
            &self,
            _caller: UserId,
            key: EntityKey,
            patch: EntityPatch,
        ) -> RemoteResult<Entity> {
            self.admit(RemoteCall::Update(key)).await?;
            self.apply_update(key, patch)
        }

        async fn delete(&self, _caller: UserId, key: EntityKey) -> RemoteResult<()> {
            self.admit(RemoteCall::Delete(key)).await?;
            self.apply_delete(key)
        }

        async fn subscribe(
            &self,
            collection: Collection,
            filter: SubscriptionFilter,
        ) -> RemoteResult<BoxStream<'static, RemoteChange>> {
            let (tx, rx) = mpsc::unbounded();
            let mut inner = self.lock();
            inner.calls.push(RemoteCall::Subscribe(collection));
            inner.subscribers.push(Subscriber {
                collection,
                filter,
                tx,
            });
            Ok(rx.boxed())
        }

        async fn snapshot(&self, collection: Collection) -> RemoteResult<RawSnapshot> {
            let mut inner = self.lock();
            inner.calls.push(RemoteCall::Snapshot(collection));
            if inner.snapshot_failures > 0 {
                inner.snapshot_failures -= 1;
                return Err(RemoteError::Network("snapshot unavailable".into()));
            }
            let rows = inner
                .tables
                .get(&collection)
                .into_iter()
                .flat_map(BTreeMap::values)
                .filter_map(|record| record.to_row().ok())
                .collect();
            Ok(RawSnapshot {
                rows,
                as_of: inner.clock,
            })
        }
    }
}
