//! Property-based tests for reconciliation.
//!
//! - Convergence: any delivery order of the same events, duplicates
//!   included, leaves the store in the same state
//! - Toggle parity: a burst of toggles settles on the parity of its length,
//!   locally and remotely

mod common;

use common::*;
use feedsync_model::{ChangeEvent, Entity, EntityKey, Post};
use feedsync_sync::{MutationOutcome, ReconciliationEngine, SyncConfig};
use feedsync_types::{EntityId, Timestamp, UserId};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// Writes and deletes of one post at distinct versions.
fn history_strategy() -> impl Strategy<Value = Vec<(u64, bool)>> {
    prop::collection::btree_set(1u64..10_000, 1..12).prop_flat_map(|versions| {
        let len = versions.len();
        (
            Just(versions.into_iter().collect::<Vec<_>>()),
            prop::collection::vec(any::<bool>(), len),
        )
            .prop_map(|(versions, deletes)| versions.into_iter().zip(deletes).collect())
    })
}

fn events(id: EntityId, author: UserId, history: &[(u64, bool)]) -> Vec<ChangeEvent> {
    history
        .iter()
        .map(|&(version, delete)| {
            let mut post = Post::new(id, author, format!("v{version}"), ts(1));
            post.updated_at = ts(version);
            let record = Entity::from(post);
            if delete {
                ChangeEvent::delete_record(record, ts(version))
            } else {
                ChangeEvent::update(record)
            }
        })
        .collect()
}

async fn replay(events: &[ChangeEvent]) -> ReconciliationEngine {
    let engine = ReconciliationEngine::new(SyncConfig::default());
    for event in events {
        engine.apply_event(event.clone()).await;
    }
    engine
}

mod convergence {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Delivery order and duplication do not change the outcome.
        #[test]
        fn any_delivery_order_converges(
            (history, order) in history_strategy().prop_flat_map(|history| {
                let indices: Vec<usize> = (0..history.len()).chain(0..history.len()).collect();
                (Just(history), Just(indices).prop_shuffle())
            })
        ) {
            let (id, author) = (EntityId::new(), UserId::new());
            let events = events(id, author, &history);
            let shuffled: Vec<ChangeEvent> = order.iter().map(|&i| events[i].clone()).collect();
            let key = EntityKey::post(id);

            let rt = runtime();
            let (expected, actual) = rt.block_on(async {
                let expected = replay(&events).await.store().await;
                let actual = replay(&shuffled).await.store().await;
                (expected, actual)
            });

            prop_assert_eq!(actual.get(&key), expected.get(&key));
            prop_assert_eq!(actual.version(&key), expected.version(&key));
            prop_assert_eq!(actual.is_live(&key), expected.is_live(&key));

            let (&(newest, deleted), _) = history.split_last().unwrap();
            prop_assert_eq!(actual.version(&key), Some(ts(newest)));
            prop_assert_eq!(actual.is_live(&key), !deleted);
        }
    }
}

mod toggles {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// However many toggles are queued, the final state is their parity.
        #[test]
        fn toggle_burst_settles_on_parity(count in 1usize..7) {
            let rt = runtime();
            rt.block_on(async {
                let (client, remote) = client();
                let (alice, bob) = (UserId::new(), UserId::new());
                let seeded = remote.seed(Post::new(EntityId::new(), bob, "p", Timestamp::ZERO));
                client.load(feedsync_model::Collection::Posts).await.unwrap();
                let post_id = seeded.as_post().unwrap().id;

                let mut pending = Vec::new();
                for _ in 0..count {
                    pending.push(client.toggle_like(alice, post_id).await.unwrap());
                }
                for pending in pending {
                    let outcome = pending.outcome().await.unwrap();
                    assert!(matches!(outcome, MutationOutcome::Confirmed { .. }));
                }

                let liked = count % 2 == 1;
                assert_eq!(client.store().await.is_liked(post_id, alice), liked);
                assert_eq!(remote.get(&EntityKey::like(post_id, alice)).is_some(), liked);
            });
        }
    }
}
