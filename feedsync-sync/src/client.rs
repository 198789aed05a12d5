//! The feed client: wires the engine to a remote store.
//!
//! The client owns the dispatch side of every mutation. A mutation is
//! queued (its projection visible at once), then a task waits until the
//! mutation heads its identity's lane, performs exactly one remote call,
//! and reports the result to the engine. The task runs to confirmation or
//! rollback whether or not anyone awaits it.

use crate::bridge::{BridgeEvent, FeedSubscription, SubscriptionBridge};
use crate::engine::{
    PendingMutation, ReconciliationEngine, RemoteRequest, ResyncReport, SyncNotice, Turn,
};
use crate::intent::Intent;
use crate::queue::MutationOutcome;
use crate::remote::{RemoteStore, SubscriptionFilter};
use crate::{RemoteError, RollbackReason, SyncConfig, SyncResult};
use feedsync_model::{Collection, Entity};
use feedsync_storage::EntityStore;
use feedsync_types::{CorrelationToken, EntityId, UserId};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Entry point for a feed UI.
pub struct FeedClient {
    engine: Arc<ReconciliationEngine>,
    remote: Arc<dyn RemoteStore>,
    bridge: SubscriptionBridge,
}

impl FeedClient {
    /// Creates a client over an empty store.
    pub fn new(remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let bridge = SubscriptionBridge::new(remote.clone(), config.resync_retry.clone());
        Self {
            engine: Arc::new(ReconciliationEngine::new(config)),
            remote,
            bridge,
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn bridge(&self) -> &SubscriptionBridge {
        &self.bridge
    }

    /// A point-in-time snapshot of the store.
    pub async fn store(&self) -> EntityStore {
        self.engine.store().await
    }

    /// Subscribes to change and mutation notices.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.engine.notices()
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Queues an intent and starts dispatching it.
    ///
    /// The optimistic projection is visible when this returns. Must be
    /// called within a Tokio runtime.
    pub async fn submit(&self, caller: UserId, intent: Intent) -> SyncResult<PendingMutation> {
        let pending = self.engine.enqueue(caller, intent).await?;
        tokio::spawn(dispatch(
            self.engine.clone(),
            self.remote.clone(),
            pending.token,
        ));
        Ok(pending)
    }

    /// Queues an intent and waits for it to settle.
    pub async fn execute(&self, caller: UserId, intent: Intent) -> SyncResult<MutationOutcome> {
        self.submit(caller, intent).await?.outcome().await
    }

    pub async fn create_post(
        &self,
        caller: UserId,
        body: impl Into<String>,
    ) -> SyncResult<PendingMutation> {
        self.submit(caller, Intent::CreatePost { body: body.into() })
            .await
    }

    pub async fn edit_post(
        &self,
        caller: UserId,
        post_id: EntityId,
        body: impl Into<String>,
    ) -> SyncResult<PendingMutation> {
        self.submit(
            caller,
            Intent::EditPost {
                post_id,
                body: body.into(),
            },
        )
        .await
    }

    pub async fn delete_post(
        &self,
        caller: UserId,
        post_id: EntityId,
    ) -> SyncResult<PendingMutation> {
        self.submit(caller, Intent::DeletePost { post_id }).await
    }

    pub async fn add_comment(
        &self,
        caller: UserId,
        post_id: EntityId,
        body: impl Into<String>,
    ) -> SyncResult<PendingMutation> {
        self.submit(
            caller,
            Intent::AddComment {
                post_id,
                body: body.into(),
            },
        )
        .await
    }

    pub async fn toggle_like(
        &self,
        caller: UserId,
        post_id: EntityId,
    ) -> SyncResult<PendingMutation> {
        self.submit(caller, Intent::ToggleLike { post_id }).await
    }

    pub async fn toggle_follow(
        &self,
        caller: UserId,
        followee_id: UserId,
    ) -> SyncResult<PendingMutation> {
        self.submit(caller, Intent::ToggleFollow { followee_id })
            .await
    }

    pub async fn update_profile(
        &self,
        caller: UserId,
        display_name: impl Into<String>,
        bio: impl Into<String>,
    ) -> SyncResult<PendingMutation> {
        self.submit(
            caller,
            Intent::UpdateProfile {
                display_name: display_name.into(),
                bio: bio.into(),
            },
        )
        .await
    }

    // ── Feeds ────────────────────────────────────────────────────

    /// Loads a collection from the remote and merges it.
    pub async fn load(&self, collection: Collection) -> SyncResult<ResyncReport> {
        let snapshot = self.bridge.resync(collection).await?;
        Ok(self.engine.apply_snapshot(snapshot).await)
    }

    /// Starts applying a collection's push feed to the store.
    ///
    /// Delivery stops when the returned handle is dropped or unsubscribed;
    /// state already applied stays.
    pub async fn follow_collection(
        &self,
        collection: Collection,
        filter: SubscriptionFilter,
    ) -> SyncResult<SubscriptionHandle> {
        let subscription = self.bridge.subscribe(collection, filter).await?;
        let (shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(pump(self.engine.clone(), subscription, stop));
        Ok(SubscriptionHandle {
            collection,
            shutdown,
            task,
        })
    }

    /// Spawns the periodic tombstone purge.
    ///
    /// The task exits once the engine is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let engine = Arc::downgrade(&self.engine);
        let period = self.engine.config().purge_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.purge_tombstones().await;
            }
        })
    }
}

/// A running feed subscription.
pub struct SubscriptionHandle {
    collection: Collection,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Stops delivery and waits for the pump to exit.
    pub async fn unsubscribe(self) {
        let SubscriptionHandle {
            collection,
            shutdown,
            task,
        } = self;
        let _ = shutdown.send(());
        if let Err(e) = task.await {
            warn!(%collection, error = %e, "feed pump failed");
        }
    }
}

async fn pump(
    engine: Arc<ReconciliationEngine>,
    mut subscription: FeedSubscription,
    mut stop: oneshot::Receiver<()>,
) {
    let collection = subscription.collection();
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                debug!(%collection, "unsubscribed");
                break;
            }
            next = subscription.next() => match next {
                Some(Ok(BridgeEvent::Change(event))) => {
                    engine.apply_event(event).await;
                }
                Some(Ok(BridgeEvent::Resynced(snapshot))) => {
                    engine.apply_snapshot(snapshot).await;
                }
                Some(Err(e)) => {
                    warn!(%collection, error = %e, "resync failed, feed may be incomplete");
                }
                None => {
                    info!(%collection, "feed closed by remote");
                    break;
                }
            },
        }
    }
}

/// Drives one mutation from its turn to its settlement.
async fn dispatch(
    engine: Arc<ReconciliationEngine>,
    remote: Arc<dyn RemoteStore>,
    token: CorrelationToken,
) {
    if let Err(e) = run_dispatch(&engine, remote.as_ref(), token).await {
        warn!(%token, error = %e, "dispatch failed");
    }
}

async fn run_dispatch(
    engine: &ReconciliationEngine,
    remote: &dyn RemoteStore,
    token: CorrelationToken,
) -> SyncResult<()> {
    let (caller, request) = loop {
        let settled = engine.settled();
        match engine.take_turn(token).await? {
            Turn::Ready { caller, request } => break (caller, request),
            Turn::Wait => settled.await,
            Turn::Done => return Ok(()),
        }
    };

    debug!(%token, ?request, "sending mutation");
    let timeout = engine.config().mutation_timeout;
    let is_insert = matches!(request, RemoteRequest::Insert(_));
    let result = tokio::time::timeout(timeout, send(remote, caller, request)).await;

    match result {
        Ok(Ok(Sent::Record(record))) => {
            engine.confirm(token, record).await?;
        }
        Ok(Ok(Sent::Deleted)) => {
            engine.confirm_deleted(token, None).await?;
        }
        Ok(Err(RemoteError::NotFound)) if !is_insert => {
            engine.confirm_deleted(token, None).await?;
        }
        Ok(Err(e)) => settle_failure(engine, token, RollbackReason::from(e)).await?,
        Err(_) => settle_failure(engine, token, RollbackReason::TimedOut).await?,
    }
    Ok(())
}

/// Rolls back unless an echo already confirmed the mutation.
async fn settle_failure(
    engine: &ReconciliationEngine,
    token: CorrelationToken,
    reason: RollbackReason,
) -> SyncResult<()> {
    if !engine.is_pending(&token).await {
        debug!(%token, %reason, "mutation already settled, ignoring failure");
        return Ok(());
    }
    engine.rollback(token, reason).await
}

enum Sent {
    Record(Entity),
    Deleted,
}

async fn send(
    remote: &dyn RemoteStore,
    caller: UserId,
    request: RemoteRequest,
) -> Result<Sent, RemoteError> {
    match request {
        RemoteRequest::Insert(record) => remote.insert(caller, record).await.map(Sent::Record),
        RemoteRequest::Update { key, patch } => {
            remote.update(caller, key, patch).await.map(Sent::Record)
        }
        RemoteRequest::Delete { key } => remote.delete(caller, key).await.map(|()| Sent::Deleted),
    }
}
