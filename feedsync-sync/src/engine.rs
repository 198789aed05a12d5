//! Reconciliation engine: the single writer of the entity store.
//!
//! Every change to the store funnels through here: optimistic projections
//! from the mutation queue, server confirmations, rollbacks, pushed change
//! events and resync snapshots. All of them run under one lock, so events
//! for the same identity are applied strictly one after another.

use crate::bridge::Snapshot;
use crate::conflict::{ConflictResolver, Resolution};
use crate::intent::{Intent, Mutation};
use crate::queue::{MutationOutcome, MutationQueue, PendingEntry, Settled};
use crate::{RollbackReason, SyncConfig, SyncError, SyncResult};
use feedsync_model::{ChangeEvent, ChangeKind, Collection, Entity, EntityKey, EntityPatch};
use feedsync_storage::EntityStore;
use feedsync_types::{CorrelationToken, Timestamp, UserId};
use std::collections::HashSet;
use tokio::sync::{Notify, RwLock, broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Something observers of the store may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// The visible records of these keys changed.
    Changed { keys: Vec<EntityKey> },
    MutationConfirmed {
        token: CorrelationToken,
        key: EntityKey,
    },
    MutationFailed {
        token: CorrelationToken,
        key: EntityKey,
        reason: RollbackReason,
    },
    ResyncCompleted {
        collection: Collection,
        report: ResyncReport,
    },
}

/// What happened to a single incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The event won and was written to the store.
    Accepted,
    /// The event lost the conflict check and was dropped.
    Ignored,
    /// The event was the echo of a pending local mutation, which it settled.
    Settled(CorrelationToken),
}

/// Summary of a snapshot merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResyncReport {
    /// Snapshot records written to the store (echo settlements included).
    pub applied: usize,
    /// Snapshot records older than or equal to local state.
    pub ignored: usize,
    /// Local records absent from the snapshot that were tombstoned.
    pub tombstoned: usize,
}

/// A queued mutation whose projection is visible in the store.
#[derive(Debug)]
pub struct PendingMutation {
    pub token: CorrelationToken,
    /// The identity the mutation targets, provisional for creations.
    pub key: EntityKey,
    outcome: oneshot::Receiver<MutationOutcome>,
}

impl PendingMutation {
    /// Waits until the mutation is confirmed or rolled back.
    pub async fn outcome(self) -> SyncResult<MutationOutcome> {
        self.outcome.await.map_err(|_| SyncError::ChannelClosed)
    }
}

/// The remote call a queued mutation turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RemoteRequest {
    Insert(Entity),
    Update { key: EntityKey, patch: EntityPatch },
    Delete { key: EntityKey },
}

/// Where a mutation stands when its dispatcher asks.
#[derive(Debug)]
pub(crate) enum Turn {
    /// Still queued behind another mutation on the same identity.
    Wait,
    /// At the head of its lane; send this.
    Ready {
        caller: UserId,
        request: RemoteRequest,
    },
    /// Already settled (rolled back as stale, cancelled, or confirmed by
    /// an echo).
    Done,
}

struct EngineState {
    store: EntityStore,
    queue: MutationQueue,
}

/// Merges local intents, confirmations and remote changes into the store.
pub struct ReconciliationEngine {
    config: SyncConfig,
    resolver: ConflictResolver,
    state: RwLock<EngineState>,
    /// Woken whenever an entry leaves the queue, so queued dispatchers can
    /// check whether they now head their lane.
    settled: Notify,
    notices: broadcast::Sender<SyncNotice>,
}

impl ReconciliationEngine {
    /// Creates an engine over an empty store.
    pub fn new(config: SyncConfig) -> Self {
        Self::with_store(config, EntityStore::new())
    }

    /// Creates an engine over an existing store.
    pub fn with_store(config: SyncConfig, store: EntityStore) -> Self {
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        Self {
            config,
            resolver: ConflictResolver,
            state: RwLock::new(EngineState {
                store,
                queue: MutationQueue::new(),
            }),
            settled: Notify::new(),
            notices,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribes to change and mutation notices.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// A point-in-time snapshot of the store.
    pub async fn store(&self) -> EntityStore {
        self.state.read().await.store.clone()
    }

    /// Number of mutations not yet confirmed or rolled back.
    pub async fn pending_count(&self) -> usize {
        self.state.read().await.queue.len()
    }

    pub async fn is_pending(&self, token: &CorrelationToken) -> bool {
        self.state.read().await.queue.contains(token)
    }

    /// Tokens queued on a key, head first.
    pub async fn pending_for(&self, key: &EntityKey) -> Vec<CorrelationToken> {
        self.state.read().await.queue.lane(key)
    }

    // ── Local mutations ──────────────────────────────────────────

    /// Validates an intent, queues the resulting mutation and applies its
    /// optimistic projection.
    ///
    /// When this returns, the projection is visible in the store unless the
    /// mutation is queued behind another one on the same identity.
    pub async fn enqueue(&self, caller: UserId, intent: Intent) -> SyncResult<PendingMutation> {
        let token = CorrelationToken::new();
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.write().await;
        let EngineState { store, queue } = &mut *state;
        let mutation = intent.resolve(caller, token, store, queue)?;
        let key = mutation.key();
        info!(%token, %key, %caller, intent = intent.name(), "enqueued mutation");

        let changed = queue.enqueue(store, PendingEntry::new(token, caller, intent, mutation, tx));
        drop(state);

        self.publish_changed(changed.into_iter().collect());
        Ok(PendingMutation {
            token,
            key,
            outcome: rx,
        })
    }

    /// Replaces a pending mutation's projection with the server's record.
    ///
    /// Returns `false` when the token is no longer pending (an echo already
    /// settled it); the record then goes through the ordinary conflict
    /// check instead.
    pub async fn confirm(&self, token: CorrelationToken, server: Entity) -> SyncResult<bool> {
        let mut state = self.state.write().await;
        if !state.queue.contains(&token) {
            debug!(%token, "confirmation for settled mutation, merging as an event");
            let applied = Self::merge(&self.resolver, &mut state, ChangeEvent::update(server));
            drop(state);
            if let Some(key) = applied {
                self.publish_changed(vec![key]);
            }
            return Ok(false);
        }

        let settled = self.settle(&mut state, &token, server);
        drop(state);
        Ok(settled.map(|settled| self.finish_confirmed(settled)).is_some())
    }

    /// Settles a pending delete (or a write whose target vanished) by
    /// applying the optimistic tombstone as the authoritative state.
    ///
    /// `at` is the server's delete timestamp when known.
    pub async fn confirm_deleted(
        &self,
        token: CorrelationToken,
        at: Option<Timestamp>,
    ) -> SyncResult<bool> {
        let mut state = self.state.write().await;
        let Some(entry) = state.queue.get(&token) else {
            return Ok(false);
        };
        let key = entry.key();
        let Some(tombstone) = Self::tombstone_settlement(&state.store, entry, at) else {
            // Nothing to tombstone (profiles): treat as a missing target.
            drop(state);
            self.rollback(token, RollbackReason::TargetMissing).await?;
            return Ok(false);
        };
        let was_write = entry.mutation().is_write();

        let Some(settled) = self.settle(&mut state, &token, tombstone) else {
            return Ok(false);
        };
        drop(state);
        if was_write {
            info!(%token, %key, "target vanished remotely, tombstoned");
            self.finish(settled, MutationOutcome::Tombstoned { key });
        } else {
            self.finish_confirmed(settled);
        }
        Ok(true)
    }

    /// Reverts a pending mutation to its pre-optimistic snapshot and
    /// signals the failure.
    pub async fn rollback(
        &self,
        token: CorrelationToken,
        reason: RollbackReason,
    ) -> SyncResult<()> {
        let mut state = self.state.write().await;
        let EngineState { store, queue } = &mut *state;
        let settled = queue
            .rollback(store, &token)
            .ok_or(SyncError::UnknownToken(token))?;
        drop(state);

        warn!(%token, key = %settled.entry.key(), %reason, "rolled back mutation");
        let outcome = MutationOutcome::RolledBack { reason };
        self.finish(settled, outcome);
        Ok(())
    }

    /// Called by a dispatcher to learn whether its mutation may be sent.
    ///
    /// Once the entry heads its lane, edits whose target advanced remotely
    /// since activation are rolled back as stale; anything else is marked in
    /// flight and its request returned.
    pub(crate) async fn take_turn(&self, token: CorrelationToken) -> SyncResult<Turn> {
        let mut state = self.state.write().await;
        let Some(entry) = state.queue.get(&token) else {
            return Ok(Turn::Done);
        };
        if !state.queue.is_head(&token) {
            return Ok(Turn::Wait);
        }

        let caller = entry.caller();
        let request = match entry.mutation() {
            Mutation::Insert(record) => {
                RemoteRequest::Insert(entry.projection().unwrap_or(record).clone())
            }
            Mutation::Update { key, patch } => {
                if Self::is_stale(&state.store, entry) {
                    drop(state);
                    self.rollback(token, RollbackReason::StaleWrite).await?;
                    return Ok(Turn::Done);
                }
                RemoteRequest::Update {
                    key: *key,
                    patch: patch.clone(),
                }
            }
            Mutation::Delete { key } => RemoteRequest::Delete { key: *key },
        };
        state.queue.mark_in_flight(&token);
        Ok(Turn::Ready { caller, request })
    }

    /// Resolves once any pending mutation has settled.
    pub(crate) fn settled(&self) -> tokio::sync::futures::Notified<'_> {
        self.settled.notified()
    }

    // ── Remote changes ───────────────────────────────────────────

    /// Reconciles one change event against the queue and the store.
    pub async fn apply_event(&self, event: ChangeEvent) -> Applied {
        let mut state = self.state.write().await;
        self.apply_locked(&mut state, event)
    }

    /// Merges a full authoritative snapshot of one collection.
    ///
    /// Every record runs through the same path as an individual event.
    /// Local records the snapshot no longer contains are tombstoned at the
    /// snapshot's timestamp, unless they are pending or newer than it.
    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> ResyncReport {
        let Snapshot {
            collection,
            records,
            as_of,
        } = snapshot;
        let mut report = ResyncReport::default();
        let mut state = self.state.write().await;

        let mut present = HashSet::with_capacity(records.len());
        for record in records {
            present.insert(record.key());
            match self.apply_locked(&mut state, ChangeEvent::update(record)) {
                Applied::Accepted | Applied::Settled(_) => report.applied += 1,
                Applied::Ignored => report.ignored += 1,
            }
        }

        if collection.is_tombstonable() {
            let EngineState { store, queue } = &mut *state;
            let missing: Vec<EntityKey> = store
                .all(collection)
                .iter()
                .map(Entity::key)
                .filter(|key| !present.contains(key) && !queue.has_pending(key))
                .collect();
            let mut removed = Vec::new();
            for key in missing {
                if store.remove(&key, as_of, None) {
                    removed.push(key);
                }
            }
            report.tombstoned = removed.len();
            drop(state);
            self.publish_changed(removed);
        } else {
            drop(state);
        }

        info!(
            %collection,
            %as_of,
            applied = report.applied,
            ignored = report.ignored,
            tombstoned = report.tombstoned,
            "resync merged"
        );
        let _ = self
            .notices
            .send(SyncNotice::ResyncCompleted { collection, report });
        report
    }

    /// Erases tombstones older than the configured grace period.
    pub async fn purge_tombstones(&self) -> usize {
        let purged = self
            .state
            .write()
            .await
            .store
            .purge_expired(Instant::now(), self.config.tombstone_grace);
        if purged > 0 {
            debug!(purged, "purged expired tombstones");
        }
        purged
    }

    // ── Internals ────────────────────────────────────────────────

    fn apply_locked(&self, state: &mut EngineState, event: ChangeEvent) -> Applied {
        if let Some(token) = Self::match_echo(&state.queue, &state.store, &event) {
            let record = event.resulting_record().or_else(|| {
                let entry = state.queue.get(&token)?;
                Self::tombstone_settlement(&state.store, entry, Some(event.server_timestamp))
            });
            if let Some(settled) = record.and_then(|record| self.settle(state, &token, record)) {
                info!(
                    %token,
                    key = %event.key,
                    kind = ?event.kind,
                    "echo settled pending mutation"
                );
                self.finish_confirmed(settled);
                return Applied::Settled(token);
            }
        }

        match Self::merge(&self.resolver, state, event) {
            Some(key) => {
                self.publish_changed(vec![key]);
                Applied::Accepted
            }
            None => Applied::Ignored,
        }
    }

    /// Applies an event under last-write-wins. Returns the changed key.
    fn merge(
        resolver: &ConflictResolver,
        state: &mut EngineState,
        event: ChangeEvent,
    ) -> Option<EntityKey> {
        let key = event.key;
        let current = state.store.version(&key);
        if resolver.resolve(current, event.server_timestamp, false) == Resolution::KeepCurrent {
            debug!(%key, incoming = %event.server_timestamp, ?current, "ignored stale event");
            return None;
        }

        let changed = match event.kind {
            ChangeKind::Delete => {
                state
                    .store
                    .remove(&key, event.server_timestamp, event.record.clone())
            }
            ChangeKind::Insert | ChangeKind::Update => match event.resulting_record() {
                Some(record) => state.store.upsert(record),
                None => false,
            },
        };
        if changed {
            debug!(%key, kind = ?event.kind, at = %event.server_timestamp, "applied event");
        }
        changed.then_some(key)
    }

    /// Finds the in-flight mutation an incoming event confirms, if any.
    ///
    /// Creations are bound by the correlation token the server echoes back.
    /// Natural-key inserts and deletes are bound by identity and kind, and
    /// only when the event is newer than both the version the mutation was
    /// based on and the stored version; older deliveries are leftovers of
    /// earlier writes. Updates cannot be told apart from concurrent edits
    /// and are settled by their direct confirmation only.
    fn match_echo(
        queue: &MutationQueue,
        store: &EntityStore,
        event: &ChangeEvent,
    ) -> Option<CorrelationToken> {
        if let Some(token) = event.record.as_ref().and_then(Entity::client_token) {
            if event.kind != ChangeKind::Delete
                && queue
                    .get(&token)
                    .is_some_and(|entry| entry.is_in_flight() && entry.mutation().is_creation())
            {
                return Some(token);
            }
        }

        let head = queue.head(&event.key).filter(|entry| entry.is_in_flight())?;
        let matches = match head.mutation() {
            Mutation::Insert(_) if head.mutation().is_creation() => false,
            Mutation::Insert(_) => event.kind != ChangeKind::Delete,
            Mutation::Delete { .. } => event.kind == ChangeKind::Delete,
            Mutation::Update { .. } => false,
        };
        let base = head
            .activation()
            .map_or(Timestamp::ZERO, |activation| activation.base_version);
        let stored = store.version(&event.key).unwrap_or(Timestamp::ZERO);
        let fresh = event.server_timestamp > base && event.server_timestamp > stored;
        if matches && !fresh {
            debug!(
                token = %head.token(),
                key = %event.key,
                at = %event.server_timestamp,
                %base,
                "not an echo of the pending write"
            );
        }
        (matches && fresh).then(|| head.token())
    }

    /// The tombstone that settles a delete, versioned at the server's delete
    /// timestamp when known and never below the stored version.
    fn tombstone_settlement(
        store: &EntityStore,
        entry: &PendingEntry,
        at: Option<Timestamp>,
    ) -> Option<Entity> {
        let key = entry.key();
        let base = entry
            .activation()
            .map(|a| a.base_version)
            .unwrap_or(Timestamp::ZERO);
        let at = at
            .unwrap_or(base)
            .max(store.version(&key).unwrap_or(Timestamp::ZERO));
        entry
            .projection()
            .or(store.get(&key).as_ref())
            .and_then(|record| record.tombstoned(at))
            .or_else(|| Entity::tombstone_for_key(&key, at))
    }

    fn is_stale(store: &EntityStore, entry: &PendingEntry) -> bool {
        let Some(activation) = entry.activation() else {
            return false;
        };
        let key = entry.key();
        let advanced = store
            .version(&key)
            .is_some_and(|current| current > activation.base_version);
        advanced && store.get(&key).as_ref() != activation.projection.as_ref()
    }

    /// Removes a pending entry, writing the authoritative record in place of
    /// its projection.
    fn settle(
        &self,
        state: &mut EngineState,
        token: &CorrelationToken,
        record: Entity,
    ) -> Option<Settled> {
        let EngineState { store, queue } = state;
        let current = store.version(&record.key());
        match self.resolver.resolve(current, record.updated_at(), true) {
            Resolution::AcceptIncoming => queue.confirm(store, token, record),
            Resolution::KeepCurrent => None,
        }
    }

    fn finish_confirmed(&self, settled: Settled) {
        let key = settled.key;
        info!(token = %settled.entry.token(), %key, "mutation confirmed");
        self.finish(settled, MutationOutcome::Confirmed { key });
    }

    /// Publishes the notices for a settlement and wakes queued dispatchers.
    fn finish(&self, settled: Settled, outcome: MutationOutcome) {
        let Settled {
            entry,
            changed,
            cancelled,
            ..
        } = settled;
        let token = entry.token();
        let key = entry.key();

        self.publish_changed(changed);
        let notice = match &outcome {
            MutationOutcome::Confirmed { key } | MutationOutcome::Tombstoned { key } => {
                SyncNotice::MutationConfirmed { token, key: *key }
            }
            MutationOutcome::RolledBack { reason } => SyncNotice::MutationFailed {
                token,
                key,
                reason: reason.clone(),
            },
        };
        let _ = self.notices.send(notice);
        entry.finish(outcome);

        for follower in cancelled {
            let reason = RollbackReason::TargetMissing;
            warn!(
                token = %follower.token(),
                key = %follower.key(),
                %reason,
                "cancelled queued mutation"
            );
            let _ = self.notices.send(SyncNotice::MutationFailed {
                token: follower.token(),
                key: follower.key(),
                reason: reason.clone(),
            });
            follower.finish(MutationOutcome::RolledBack { reason });
        }

        self.settled.notify_waiters();
    }

    fn publish_changed(&self, keys: Vec<EntityKey>) {
        if keys.is_empty() {
            return;
        }
        // No receivers is fine.
        let _ = self.notices.send(SyncNotice::Changed { keys });
    }
}
