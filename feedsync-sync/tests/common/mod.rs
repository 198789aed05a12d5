//! Shared helpers for sync tests.

#![allow(dead_code)]

use feedsync_model::{Entity, EntityKey, Post};
use feedsync_storage::EntityStore;
use feedsync_sync::remote::memory::{MemoryRemote, RemoteCall};
use feedsync_sync::{FeedClient, ReconciliationEngine, SyncConfig, SyncNotice};
use feedsync_types::{CorrelationToken, EntityId, Timestamp, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Routes engine logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ts(ms: u64) -> Timestamp {
    Timestamp::from_millis(ms)
}

pub fn post(id: EntityId, author: UserId, body: &str, at: u64) -> Post {
    Post::new(id, author, body, ts(at))
}

/// The record a server would return for an optimistic post creation.
pub fn server_post(token: CorrelationToken, author: UserId, body: &str, at: u64) -> Entity {
    let mut post = post(EntityId::new(), author, body, at);
    post.client_token = Some(token);
    post.into()
}

pub fn engine_with(records: impl IntoIterator<Item = Entity>) -> ReconciliationEngine {
    init_tracing();
    let mut store = EntityStore::new();
    for record in records {
        store.upsert(record);
    }
    ReconciliationEngine::with_store(SyncConfig::default(), store)
}

pub fn client() -> (FeedClient, Arc<MemoryRemote>) {
    client_with(SyncConfig::default())
}

pub fn client_with(config: SyncConfig) -> (FeedClient, Arc<MemoryRemote>) {
    init_tracing();
    let remote = Arc::new(MemoryRemote::new());
    (FeedClient::new(remote.clone(), config), remote)
}

/// Writes the remote received, in order.
pub fn writes(remote: &MemoryRemote) -> Vec<RemoteCall> {
    remote
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(
                call,
                RemoteCall::Insert(_) | RemoteCall::Update(_) | RemoteCall::Delete(_)
            )
        })
        .collect()
}

const PATIENCE: Duration = Duration::from_secs(5);

/// Yields until the remote has received `count` writes.
pub async fn wait_for_writes(remote: &MemoryRemote, count: usize) {
    tokio::time::timeout(PATIENCE, async {
        while writes(remote).len() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("remote never received the expected writes");
}

/// Yields until nothing is pending.
pub async fn wait_until_settled(engine: &ReconciliationEngine) {
    tokio::time::timeout(PATIENCE, async {
        while engine.pending_count().await > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("mutations never settled");
}

/// Lets spawned tasks run for a while.
pub async fn drain_tasks() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Waits for the first notice matching `pred`.
pub async fn wait_for_notice(
    notices: &mut broadcast::Receiver<SyncNotice>,
    mut pred: impl FnMut(&SyncNotice) -> bool,
) -> SyncNotice {
    tokio::time::timeout(PATIENCE, async {
        loop {
            match notices.recv().await {
                Ok(notice) if pred(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notice channel closed"),
            }
        }
    })
    .await
    .expect("notice never arrived")
}

/// Waits until `key` is reported as changed.
pub async fn wait_for_change(notices: &mut broadcast::Receiver<SyncNotice>, key: EntityKey) {
    wait_for_notice(notices, |notice| {
        matches!(notice, SyncNotice::Changed { keys } if keys.contains(&key))
    })
    .await;
}

pub fn empty_engine() -> ReconciliationEngine {
    engine_with(Vec::new())
}
