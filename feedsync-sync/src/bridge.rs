//! Subscription bridge: turns the remote's push feed into change events.
//!
//! The bridge normalizes row payloads into [`ChangeEvent`]s and repairs feed
//! gaps by fetching a full snapshot when the remote signals one. It does not
//! interpret events; ordering and conflicts are the engine's business.

use crate::remote::{RawChange, RawOp, RemoteChange, RemoteStore, SubscriptionFilter};
use crate::{RetryConfig, SyncError, SyncResult};
use feedsync_model::{ChangeEvent, ChangeKind, Collection, Entity, EntityKey};
use feedsync_types::Timestamp;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An authoritative copy of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub collection: Collection,
    pub records: Vec<Entity>,
    /// Server time the snapshot reflects.
    pub as_of: Timestamp,
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Change(ChangeEvent),
    /// The feed had a gap; this snapshot replaces what was missed.
    Resynced(Snapshot),
}

/// Normalizes one pushed row change.
pub fn normalize(raw: RawChange) -> SyncResult<ChangeEvent> {
    let collection: Collection = raw.table.parse()?;
    match raw.op {
        RawOp::Insert | RawOp::Update => {
            let row = raw.new.ok_or_else(|| {
                SyncError::MalformedChange(format!("{collection} write without a row"))
            })?;
            let record = Entity::from_row(collection, row)?;
            Ok(match raw.op {
                RawOp::Insert => ChangeEvent::insert(record),
                _ => ChangeEvent::update(record),
            })
        }
        RawOp::Delete => {
            let old = raw.old.ok_or_else(|| {
                SyncError::MalformedChange(format!("{collection} delete without a key"))
            })?;
            let key = EntityKey::from_row(collection, &old)?;
            // Full rows are only present when the table replicates them.
            Ok(match Entity::from_row(collection, old) {
                Ok(record) if record.key() == key => {
                    ChangeEvent::delete_record(record, raw.commit_timestamp)
                }
                _ => ChangeEvent {
                    collection,
                    key,
                    kind: ChangeKind::Delete,
                    record: None,
                    server_timestamp: raw.commit_timestamp,
                },
            })
        }
    }
}

/// Decodes snapshot rows, skipping malformed ones.
fn decode_rows(collection: Collection, rows: Vec<serde_json::Value>) -> Vec<Entity> {
    rows.into_iter()
        .filter_map(|row| match Entity::from_row(collection, row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(%collection, error = %e, "skipping malformed snapshot row");
                None
            }
        })
        .collect()
}

/// Adapts a [`RemoteStore`]'s push feed.
#[derive(Clone)]
pub struct SubscriptionBridge {
    remote: Arc<dyn RemoteStore>,
    retry: RetryConfig,
}

impl SubscriptionBridge {
    pub fn new(remote: Arc<dyn RemoteStore>, retry: RetryConfig) -> Self {
        Self { remote, retry }
    }

    /// Opens a change feed for one collection.
    pub async fn subscribe(
        &self,
        collection: Collection,
        filter: SubscriptionFilter,
    ) -> SyncResult<FeedSubscription> {
        let stream = self.remote.subscribe(collection, filter).await?;
        info!(%collection, "subscribed");
        Ok(FeedSubscription {
            collection,
            stream,
            bridge: self.clone(),
        })
    }

    /// Fetches a full snapshot of a collection, retrying transient failures
    /// with exponential backoff.
    pub async fn resync(&self, collection: Collection) -> SyncResult<Snapshot> {
        let mut attempt = 0;
        loop {
            match self.remote.snapshot(collection).await {
                Ok(raw) => {
                    let records = decode_rows(collection, raw.rows);
                    debug!(
                        %collection,
                        records = records.len(),
                        as_of = %raw.as_of,
                        "fetched snapshot"
                    );
                    return Ok(Snapshot {
                        collection,
                        records,
                        as_of: raw.as_of,
                    });
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(%collection, attempt, ?delay, error = %e, "snapshot failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// A live change feed for one collection.
pub struct FeedSubscription {
    collection: Collection,
    stream: BoxStream<'static, RemoteChange>,
    bridge: SubscriptionBridge,
}

impl FeedSubscription {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Waits for the next change.
    ///
    /// Malformed rows and rows of other tables are skipped. A resync marker
    /// pauses intake until a snapshot has been fetched; if the snapshot
    /// cannot be fetched the error is returned and intake resumes on the
    /// next call. Returns `None` once the remote closes the feed.
    pub async fn next(&mut self) -> Option<SyncResult<BridgeEvent>> {
        loop {
            match self.stream.next().await? {
                RemoteChange::Row(raw) => {
                    if raw.table != self.collection.table_name() {
                        debug!(
                            collection = %self.collection,
                            table = %raw.table,
                            "skipping row of another table"
                        );
                        continue;
                    }
                    match normalize(raw) {
                        Ok(event) => return Some(Ok(BridgeEvent::Change(event))),
                        Err(e) => {
                            warn!(
                                collection = %self.collection,
                                error = %e,
                                "skipping malformed change"
                            );
                        }
                    }
                }
                RemoteChange::ResyncRequired => {
                    info!(collection = %self.collection, "feed gap, resyncing");
                    return Some(
                        self.bridge
                            .resync(self.collection)
                            .await
                            .map(BridgeEvent::Resynced),
                    );
                }
            }
        }
    }
}
