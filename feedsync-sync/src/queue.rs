//! The mutation queue: in-flight local intents, distinct from confirmed
//! truth.
//!
//! Entries are grouped into one FIFO lane per identity. Only the head of a
//! lane is projected into the store; the entries behind it receive their
//! projection, and the snapshot they roll back to, when they reach the
//! head. This keeps at most one outstanding write per identity.
//!
//! The queue is driven by the reconciliation engine, which hands it the
//! store it owns; nothing else writes through it.

use crate::RollbackReason;
use crate::intent::{Intent, Mutation};
use feedsync_model::{Entity, EntityKey};
use feedsync_storage::{EntityStore, StoredValue};
use feedsync_types::{CorrelationToken, Timestamp, UserId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// How a mutation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The server accepted the write; `key` is the record's final identity.
    Confirmed { key: EntityKey },
    /// The target was already gone on the server; a tombstone was applied
    /// in place of a confirmation.
    Tombstoned { key: EntityKey },
    /// The optimistic projection was reverted.
    RolledBack { reason: RollbackReason },
}

/// State captured when an entry reaches the head of its lane.
#[derive(Debug, Clone)]
pub(crate) struct Activation {
    /// What the store held before the projection.
    pub snapshot: Option<StoredValue>,
    /// What the projection wrote, if anything.
    pub projection: Option<Entity>,
    /// The version the mutation was computed against.
    pub base_version: Timestamp,
}

/// A queued mutation.
#[derive(Debug)]
pub struct PendingEntry {
    token: CorrelationToken,
    caller: UserId,
    intent: Intent,
    mutation: Mutation,
    enqueued_at: Instant,
    activation: Option<Activation>,
    in_flight: bool,
    outcome: Option<oneshot::Sender<MutationOutcome>>,
}

impl PendingEntry {
    pub(crate) fn new(
        token: CorrelationToken,
        caller: UserId,
        intent: Intent,
        mutation: Mutation,
        outcome: oneshot::Sender<MutationOutcome>,
    ) -> Self {
        Self {
            token,
            caller,
            intent,
            mutation,
            enqueued_at: Instant::now(),
            activation: None,
            in_flight: false,
            outcome: Some(outcome),
        }
    }

    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub fn caller(&self) -> UserId {
        self.caller
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn key(&self) -> EntityKey {
        self.mutation.key()
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Whether the entry heads its lane and has been projected.
    pub fn is_active(&self) -> bool {
        self.activation.is_some()
    }

    /// Whether its remote call has been issued.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// What the projection wrote into the store.
    pub fn projection(&self) -> Option<&Entity> {
        self.activation.as_ref()?.projection.as_ref()
    }

    pub(crate) fn activation(&self) -> Option<&Activation> {
        self.activation.as_ref()
    }

    /// Resolves whoever is waiting on this mutation.
    pub(crate) fn finish(mut self, outcome: MutationOutcome) {
        if let Some(tx) = self.outcome.take() {
            // The waiter may have gone away; the outcome is also published
            // as a notice.
            let _ = tx.send(outcome);
        }
    }
}

/// Entries removed from the queue by a settlement.
#[derive(Debug)]
pub(crate) struct Settled {
    pub entry: PendingEntry,
    /// The record's identity after settlement.
    pub key: EntityKey,
    /// Store keys whose visible record changed.
    pub changed: Vec<EntityKey>,
    /// Followers dropped because their target can never exist.
    pub cancelled: Vec<PendingEntry>,
}

/// In-flight local mutations, one FIFO lane per identity.
#[derive(Debug, Default)]
pub struct MutationQueue {
    entries: HashMap<CorrelationToken, PendingEntry>,
    lanes: HashMap<EntityKey, VecDeque<CorrelationToken>>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, token: &CorrelationToken) -> bool {
        self.entries.contains_key(token)
    }

    pub fn get(&self, token: &CorrelationToken) -> Option<&PendingEntry> {
        self.entries.get(token)
    }

    /// The entry at the head of a key's lane.
    pub fn head(&self, key: &EntityKey) -> Option<&PendingEntry> {
        let token = self.lanes.get(key)?.front()?;
        self.entries.get(token)
    }

    /// The most recently queued entry for a key.
    pub fn last_for(&self, key: &EntityKey) -> Option<&PendingEntry> {
        let token = self.lanes.get(key)?.back()?;
        self.entries.get(token)
    }

    /// Whether anything is pending for a key.
    pub fn has_pending(&self, key: &EntityKey) -> bool {
        self.lanes.contains_key(key)
    }

    /// Whether the token heads its lane.
    pub fn is_head(&self, token: &CorrelationToken) -> bool {
        self.entries
            .get(token)
            .and_then(|entry| self.lanes.get(&entry.key()))
            .and_then(VecDeque::front)
            == Some(token)
    }

    /// Whether `key` is a provisional record still awaiting its server id.
    pub fn is_unconfirmed_creation(&self, key: &EntityKey) -> bool {
        self.head(key)
            .is_some_and(|entry| entry.mutation.is_creation() && entry.key() == *key)
    }

    /// Tokens in lane order for one key.
    pub fn lane(&self, key: &EntityKey) -> Vec<CorrelationToken> {
        self.lanes
            .get(key)
            .map(|lane| lane.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Adds an entry to the back of its lane, projecting it immediately if
    /// the lane was empty. Returns the key whose visible record changed.
    pub fn enqueue(&mut self, store: &mut EntityStore, entry: PendingEntry) -> Option<EntityKey> {
        let key = entry.key();
        let token = entry.token;
        self.entries.insert(token, entry);
        let lane = self.lanes.entry(key).or_default();
        lane.push_back(token);
        if lane.len() == 1 {
            self.activate(store, token)
        } else {
            debug!(%token, %key, depth = lane.len(), "queued behind pending mutation");
            None
        }
    }

    /// Marks the head entry's remote call as issued.
    pub(crate) fn mark_in_flight(&mut self, token: &CorrelationToken) {
        if let Some(entry) = self.entries.get_mut(token) {
            entry.in_flight = true;
        }
    }

    /// Replaces the optimistic projection with the authoritative record and
    /// removes the entry.
    ///
    /// A creation's provisional record is erased, and the entries queued
    /// behind it move to the server-assigned identity. The next entry in the
    /// lane is then activated.
    pub(crate) fn confirm(
        &mut self,
        store: &mut EntityStore,
        token: &CorrelationToken,
        server: Entity,
    ) -> Option<Settled> {
        let entry = self.take(token)?;
        let key = entry.key();
        let final_key = server.key();
        let mut changed = Vec::new();

        if final_key != key {
            store.erase(&key);
            changed.push(key);
            self.rebind(&key, final_key);
        }
        if store.replace(server) || final_key != key {
            changed.push(final_key);
        }
        changed.extend(self.activate_head(store, &final_key));

        Some(Settled {
            entry,
            key: final_key,
            changed,
            cancelled: Vec::new(),
        })
    }

    /// Reverts the entry's projection and removes it.
    ///
    /// The snapshot is restored only while the store still shows the
    /// projection; a newer authoritative record that landed meanwhile is
    /// kept. A failed creation takes its queued followers with it.
    pub(crate) fn rollback(
        &mut self,
        store: &mut EntityStore,
        token: &CorrelationToken,
    ) -> Option<Settled> {
        let entry = self.take(token)?;
        let key = entry.key();
        let mut changed = Vec::new();

        if let Some(activation) = &entry.activation {
            let visible = store.get(&key);
            if activation.projection.is_some() && visible == activation.projection {
                store.restore(&key, activation.snapshot.clone());
                changed.push(key);
            }
        }

        let cancelled = if entry.mutation.is_creation() {
            self.drain(&key)
        } else {
            changed.extend(self.activate_head(store, &key));
            Vec::new()
        };

        Some(Settled {
            entry,
            key,
            changed,
            cancelled,
        })
    }

    /// Removes an entry from its lane without touching the store.
    fn take(&mut self, token: &CorrelationToken) -> Option<PendingEntry> {
        let entry = self.entries.remove(token)?;
        let key = entry.key();
        if let Some(lane) = self.lanes.get_mut(&key) {
            lane.retain(|t| t != token);
            if lane.is_empty() {
                self.lanes.remove(&key);
            }
        }
        Some(entry)
    }

    /// Removes every entry queued on a key.
    fn drain(&mut self, key: &EntityKey) -> Vec<PendingEntry> {
        self.lanes
            .remove(key)
            .into_iter()
            .flatten()
            .filter_map(|token| self.entries.remove(&token))
            .collect()
    }

    /// Moves a lane to a new identity.
    fn rebind(&mut self, from: &EntityKey, to: EntityKey) {
        let Some(lane) = self.lanes.remove(from) else {
            return;
        };
        for token in &lane {
            if let Some(entry) = self.entries.get_mut(token) {
                entry.mutation.rebind(to);
            }
        }
        debug!(%from, %to, moved = lane.len(), "rebound queued mutations");
        self.lanes.entry(to).or_default().extend(lane);
    }

    fn activate_head(&mut self, store: &mut EntityStore, key: &EntityKey) -> Option<EntityKey> {
        let token = *self.lanes.get(key)?.front()?;
        if self.entries.get(&token)?.activation.is_some() {
            return None;
        }
        self.activate(store, token)
    }

    /// Captures the snapshot and writes the optimistic projection.
    fn activate(&mut self, store: &mut EntityStore, token: CorrelationToken) -> Option<EntityKey> {
        let entry = self.entries.get_mut(&token)?;
        let key = entry.key();
        let snapshot = store.stored(&key).cloned();
        let base_version = store.version(&key).unwrap_or(Timestamp::ZERO);

        let projection = match &entry.mutation {
            Mutation::Insert(record) if entry.mutation.is_creation() => Some(record.clone()),
            Mutation::Insert(record) => Some(record.with_version(base_version)),
            Mutation::Update { patch, .. } => match store.stored(&key) {
                Some(StoredValue::Live(current)) => patch.apply(current).ok(),
                _ => None,
            },
            Mutation::Delete { .. } => store
                .get(&key)
                .and_then(|current| current.tombstoned(base_version))
                .or_else(|| Entity::tombstone_for_key(&key, base_version)),
        };

        debug!(%token, %key, %base_version, projected = projection.is_some(), "activated mutation");
        let changed = projection
            .clone()
            .is_some_and(|record| store.replace(record));
        entry.activation = Some(Activation {
            snapshot,
            projection,
            base_version,
        });
        changed.then_some(key)
    }
}
