//! Optimistic mutation and reconciliation core for feedsync.
//!
//! Keeps the entity store consistent while the local user issues
//! optimistic mutations and the remote store pushes changes that may
//! arrive late, out of order, or twice.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **MutationQueue**: in-flight local writes, one FIFO lane per identity
//! - **SubscriptionBridge**: normalizes the remote push feed and repairs
//!   gaps with snapshots
//! - **ReconciliationEngine**: the only writer of the store; merges
//!   confirmations, events, rollbacks and snapshots
//! - **ConflictResolver**: last-write-wins by server timestamp, own
//!   confirmations first
//! - **FeedClient**: dispatches queued mutations to a [`RemoteStore`] and
//!   pumps subscriptions into the engine
//!
//! ## Mutation lifecycle
//!
//! 1. **Enqueue**: the intent is validated and resolved; if nothing else is
//!    pending on the identity, its projection is written at once
//! 2. **Dispatch**: at the head of its lane, exactly one remote call is made
//! 3. **Settle**: the server record (or its echo on the feed) replaces the
//!    projection, or the pre-mutation snapshot is restored on failure
//! 4. **Advance**: the next mutation on the identity is projected and sent
//!
//! # Example
//!
//! ```
//! use feedsync_sync::remote::memory::MemoryRemote;
//! use feedsync_sync::{FeedClient, MutationOutcome, SyncConfig};
//! use feedsync_types::UserId;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> feedsync_sync::SyncResult<()> {
//! let client = FeedClient::new(Arc::new(MemoryRemote::new()), SyncConfig::default());
//! let me = UserId::new();
//!
//! let pending = client.create_post(me, "hello").await?;
//! assert_eq!(client.store().await.feed().len(), 1);
//! assert!(matches!(pending.outcome().await?, MutationOutcome::Confirmed { .. }));
//! # Ok(())
//! # }
//! ```

mod bridge;
mod client;
mod config;
mod conflict;
mod engine;
mod error;
mod intent;
mod queue;
pub mod remote;

pub use bridge::{BridgeEvent, FeedSubscription, Snapshot, SubscriptionBridge, normalize};
pub use client::{FeedClient, SubscriptionHandle};
pub use config::{RetryConfig, SyncConfig};
pub use conflict::{ConflictResolver, Resolution};
pub use engine::{Applied, PendingMutation, ReconciliationEngine, ResyncReport, SyncNotice};
pub use error::{RemoteError, RemoteResult, RollbackReason, SyncError, SyncResult};
pub use intent::{Intent, Mutation};
pub use queue::{MutationOutcome, MutationQueue, PendingEntry};
pub use remote::{RawChange, RawOp, RawSnapshot, RemoteChange, RemoteStore, SubscriptionFilter};
