//! The entity store.

use feedsync_model::{Collection, Entity, EntityKey};
use feedsync_types::Timestamp;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type Partition = BTreeMap<EntityKey, StoredValue>;

/// A deletion marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub key: EntityKey,
    /// Server timestamp of the delete; stale writes at or below it lose.
    pub deleted_at: Timestamp,
    /// The record as it was deleted (with its tombstone flag set), when known.
    pub last_known: Option<Entity>,
    /// Local time the tombstone was recorded, for grace-period expiry.
    pub recorded_at: Instant,
}

/// What the store holds for one identity.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Live(Entity),
    Tombstone(Tombstone),
}

impl StoredValue {
    /// The version any incoming write must beat.
    pub fn version(&self) -> Timestamp {
        match self {
            StoredValue::Live(entity) => entity.updated_at(),
            StoredValue::Tombstone(t) => t.deleted_at,
        }
    }

    /// The record a reader sees: live records as-is, tombstones as their
    /// last known record (flagged deleted) when one is retained.
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            StoredValue::Live(entity) => Some(entity),
            StoredValue::Tombstone(t) => t.last_known.as_ref(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, StoredValue::Tombstone(_))
    }

    fn from_entity(entity: Entity) -> Self {
        if entity.is_deleted() {
            StoredValue::Tombstone(Tombstone {
                key: entity.key(),
                deleted_at: entity.updated_at(),
                last_known: Some(entity),
                recorded_at: Instant::now(),
            })
        } else {
            StoredValue::Live(entity)
        }
    }
}

/// Normalized, in-memory keyed cache of all known entities.
///
/// Holds at most one value per identity. Clones share storage until one of
/// them is written, so a clone is a point-in-time snapshot.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    partitions: HashMap<Collection, Arc<Partition>>,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for a key, if known.
    ///
    /// Tombstoned records are returned with their deleted flag set.
    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.stored(key).and_then(StoredValue::entity).cloned()
    }

    /// Returns the raw stored value for a key.
    pub fn stored(&self, key: &EntityKey) -> Option<&StoredValue> {
        self.partitions.get(&key.collection())?.get(key)
    }

    /// Returns the current version of a key, live or tombstoned.
    pub fn version(&self, key: &EntityKey) -> Option<Timestamp> {
        self.stored(key).map(StoredValue::version)
    }

    /// Whether the key is currently held as a live record.
    pub fn is_live(&self, key: &EntityKey) -> bool {
        matches!(self.stored(key), Some(StoredValue::Live(_)))
    }

    /// Whether the key is currently tombstoned.
    pub fn is_tombstoned(&self, key: &EntityKey) -> bool {
        matches!(self.stored(key), Some(StoredValue::Tombstone(_)))
    }

    /// Applies a record under last-write-wins.
    ///
    /// The record is applied only if its `updated_at` is strictly newer than
    /// the stored version. Records carrying the deleted flag become
    /// tombstones. Returns whether the store changed.
    pub fn upsert(&mut self, entity: Entity) -> bool {
        let key = entity.key();
        let at = entity.updated_at();
        if !self.accepts(&key, at) {
            debug!(%key, %at, "upsert rejected: not newer than stored version");
            return false;
        }
        self.partition_mut(key.collection())
            .insert(key, StoredValue::from_entity(entity));
        true
    }

    /// Tombstones a key under last-write-wins.
    ///
    /// The tombstone retains `last_known` (or the currently stored record)
    /// with its deleted flag set. Returns whether the store changed.
    pub fn remove(&mut self, key: &EntityKey, at: Timestamp, last_known: Option<Entity>) -> bool {
        if !self.accepts(key, at) {
            debug!(%key, %at, "remove rejected: not newer than stored version");
            return false;
        }
        let last_known = last_known
            .or_else(|| self.get(key))
            .and_then(|entity| entity.tombstoned(at))
            .or_else(|| Entity::tombstone_for_key(key, at));
        self.partition_mut(key.collection()).insert(
            *key,
            StoredValue::Tombstone(Tombstone {
                key: *key,
                deleted_at: at,
                last_known,
                recorded_at: Instant::now(),
            }),
        );
        true
    }

    /// Writes a record regardless of the stored version.
    ///
    /// Used for optimistic projections and for confirmations of the
    /// engine's own writes. Returns whether the visible record changed.
    pub fn replace(&mut self, entity: Entity) -> bool {
        let key = entity.key();
        let changed = self.get(&key).as_ref() != Some(&entity);
        self.partition_mut(key.collection())
            .insert(key, StoredValue::from_entity(entity));
        changed
    }

    /// Puts back a previously captured value (or its absence).
    pub fn restore(&mut self, key: &EntityKey, snapshot: Option<StoredValue>) {
        let partition = self.partition_mut(key.collection());
        match snapshot {
            Some(value) => {
                partition.insert(*key, value);
            }
            None => {
                partition.remove(key);
            }
        }
    }

    /// Drops a key entirely, tombstone included.
    pub fn erase(&mut self, key: &EntityKey) -> Option<StoredValue> {
        let collection = key.collection();
        if !self.partitions.get(&collection)?.contains_key(key) {
            return None;
        }
        self.partition_mut(collection).remove(key)
    }

    /// Erases tombstones recorded more than `grace` before `now`.
    ///
    /// Returns the number of tombstones purged.
    pub fn purge_expired(&mut self, now: Instant, grace: Duration) -> usize {
        let mut purged = 0;
        for partition in self.partitions.values_mut() {
            let expired = |value: &StoredValue| match value {
                StoredValue::Tombstone(t) => now.saturating_duration_since(t.recorded_at) >= grace,
                StoredValue::Live(_) => false,
            };
            if !partition.values().any(expired) {
                continue;
            }
            let partition = Arc::make_mut(partition);
            let before = partition.len();
            partition.retain(|_, value| !expired(value));
            purged += before - partition.len();
        }
        purged
    }

    /// Lazily yields the live records of a collection matching `predicate`.
    ///
    /// The query captures a snapshot at call time; later writes to the store
    /// are not observed. Iterating the query again restarts it.
    pub fn query<F>(&self, collection: Collection, predicate: F) -> Query<F>
    where
        F: Fn(&Entity) -> bool,
    {
        Query {
            partition: self.partitions.get(&collection).cloned(),
            predicate,
        }
    }

    /// All live records of a collection.
    pub fn all(&self, collection: Collection) -> Query<fn(&Entity) -> bool> {
        self.query(collection, any_entity as fn(&Entity) -> bool)
    }

    /// Number of live records in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.all(collection).count()
    }

    /// Number of tombstones held for a collection.
    pub fn tombstone_count(&self, collection: Collection) -> usize {
        self.partitions
            .get(&collection)
            .map(|p| p.values().filter(|v| v.is_tombstone()).count())
            .unwrap_or(0)
    }

    /// Whether the store holds no live records at all.
    pub fn is_empty(&self) -> bool {
        Collection::ALL.iter().all(|c| self.len(*c) == 0)
    }

    fn accepts(&self, key: &EntityKey, at: Timestamp) -> bool {
        self.version(key).is_none_or(|current| at > current)
    }

    fn partition_mut(&mut self, collection: Collection) -> &mut Partition {
        Arc::make_mut(self.partitions.entry(collection).or_default())
    }
}

fn any_entity(_: &Entity) -> bool {
    true
}

/// A lazy, restartable query over a snapshot of one collection.
pub struct Query<F> {
    partition: Option<Arc<Partition>>,
    predicate: F,
}

impl<F> Query<F>
where
    F: Fn(&Entity) -> bool,
{
    /// Iterates matching live records in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.partition
            .iter()
            .flat_map(|p| p.values())
            .filter_map(|value| match value {
                StoredValue::Live(entity) => Some(entity),
                StoredValue::Tombstone(_) => None,
            })
            .filter(|entity| (self.predicate)(*entity))
    }

    /// Number of matching records.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

impl<'a, F> IntoIterator for &'a Query<F>
where
    F: Fn(&Entity) -> bool,
{
    type Item = &'a Entity;
    type IntoIter = Box<dyn Iterator<Item = &'a Entity> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
