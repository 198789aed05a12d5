mod common;

use common::*;
use feedsync_model::{ChangeEvent, Collection, Comment, Entity, EntityKey, Follow, Post};
use feedsync_sync::remote::memory::RemoteCall;
use feedsync_sync::{
    Applied, FeedClient, Intent, MutationOutcome, RemoteError, RemoteStore, RollbackReason,
    SubscriptionFilter, SyncConfig, SyncNotice,
};
use feedsync_types::{EntityId, Timestamp, UserId};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn draft(author: UserId, body: &str) -> Entity {
    Post::new(EntityId::new(), author, body, Timestamp::ZERO).into()
}

async fn update_profile(
    client: &FeedClient,
    user: UserId,
    name: &str,
    bio: &str,
) -> MutationOutcome {
    let intent = Intent::UpdateProfile {
        display_name: name.into(),
        bio: bio.into(),
    };
    client.execute(user, intent).await.unwrap()
}

// ── Mutations ────────────────────────────────────────────────────

#[tokio::test]
async fn created_post_is_confirmed_under_its_server_id() {
    let (client, remote) = client();
    let alice = UserId::new();

    let pending = client.create_post(alice, "hello").await.unwrap();
    let provisional = pending.key;
    let feed = client.store().await.feed();
    assert_eq!(feed.len(), 1);
    assert_eq!(EntityKey::post(feed[0].id), provisional);

    let MutationOutcome::Confirmed { key } = pending.outcome().await.unwrap() else {
        panic!("creation was not confirmed");
    };
    assert_ne!(key, provisional);
    let feed = client.store().await.feed();
    assert_eq!(feed.len(), 1);
    assert_eq!(EntityKey::post(feed[0].id), key);
    assert_eq!(Some(Entity::Post(feed[0].clone())), remote.get(&key));
    assert_eq!(remote.row_count(Collection::Posts), 1);
}

#[tokio::test]
async fn edit_queued_behind_a_creation_targets_the_server_id() {
    let (client, remote) = client();
    let alice = UserId::new();
    remote.hold();

    let created = client.create_post(alice, "draft").await.unwrap();
    let edit = client
        .edit_post(alice, created.token.provisional_id(), "final")
        .await
        .unwrap();
    wait_for_writes(&remote, 1).await;
    remote.release();

    let created_key = created.key;
    let MutationOutcome::Confirmed { key } = created.outcome().await.unwrap() else {
        panic!("creation was not confirmed");
    };
    assert_eq!(
        edit.outcome().await.unwrap(),
        MutationOutcome::Confirmed { key }
    );
    assert_eq!(
        writes(&remote),
        vec![RemoteCall::Insert(created_key), RemoteCall::Update(key)]
    );
    let EntityKey::Post { id } = key else {
        panic!("not a post key");
    };
    assert_eq!(client.store().await.post(id).unwrap().body, "final");
}

#[tokio::test]
async fn failed_delete_restores_the_post() {
    let (client, remote) = client();
    let alice = UserId::new();
    let seeded = remote.seed(draft(alice, "keep me"));
    client.load(Collection::Posts).await.unwrap();
    let id = seeded.as_post().unwrap().id;
    remote.fail_next(RemoteError::Network("offline".into()));

    let pending = client.delete_post(alice, id).await.unwrap();
    assert!(client.store().await.feed().is_empty());

    assert_eq!(
        pending.outcome().await.unwrap(),
        MutationOutcome::RolledBack {
            reason: RollbackReason::Network("offline".into())
        }
    );
    assert_eq!(client.store().await.post(id).map(Entity::from), Some(seeded));
}

#[tokio::test]
async fn rapid_toggles_send_one_write_at_a_time() {
    let (client, remote) = client();
    let (alice, bob) = (UserId::new(), UserId::new());
    let seeded = remote.seed(draft(bob, "like me"));
    client.load(Collection::Posts).await.unwrap();
    let post_id = seeded.as_post().unwrap().id;
    let key = EntityKey::like(post_id, alice);
    remote.hold();

    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(client.toggle_like(alice, post_id).await.unwrap());
    }
    wait_for_writes(&remote, 1).await;
    drain_tasks().await;

    assert_eq!(writes(&remote), vec![RemoteCall::Insert(key)]);
    assert_eq!(client.engine().pending_for(&key).await.len(), 3);
    assert!(client.store().await.is_liked(post_id, alice));

    remote.release();
    for pending in pending {
        assert!(matches!(
            pending.outcome().await.unwrap(),
            MutationOutcome::Confirmed { .. }
        ));
    }

    assert_eq!(
        writes(&remote),
        vec![
            RemoteCall::Insert(key),
            RemoteCall::Delete(key),
            RemoteCall::Insert(key)
        ]
    );
    assert!(client.store().await.is_liked(post_id, alice));
    assert!(remote.get(&key).is_some());
}

#[tokio::test]
async fn stale_like_delivery_does_not_settle_a_newer_toggle() {
    let (client, remote) = client();
    let (alice, bob) = (UserId::new(), UserId::new());
    let seeded = remote.seed(draft(bob, "like me"));
    client.load(Collection::Posts).await.unwrap();
    let post_id = seeded.as_post().unwrap().id;
    let key = EntityKey::like(post_id, alice);

    client.execute(alice, Intent::ToggleLike { post_id }).await.unwrap();
    let first_like = remote.get(&key).unwrap();
    client.execute(alice, Intent::ToggleLike { post_id }).await.unwrap();
    let unliked_at = client.store().await.version(&key).unwrap();

    remote.hold();
    let relike = client.toggle_like(alice, post_id).await.unwrap();
    wait_for_writes(&remote, 3).await;

    // A late duplicate of the first like arrives while the re-like is in flight.
    let applied = client
        .engine()
        .apply_event(ChangeEvent::insert(first_like))
        .await;
    assert_eq!(applied, Applied::Ignored);
    assert_eq!(client.engine().pending_for(&key).await, vec![relike.token]);
    assert_eq!(client.store().await.version(&key), Some(unliked_at));

    remote.fail_next(RemoteError::Network("offline".into()));
    remote.release();

    assert_eq!(
        relike.outcome().await.unwrap(),
        MutationOutcome::RolledBack {
            reason: RollbackReason::Network("offline".into())
        }
    );
    assert!(!client.store().await.is_liked(post_id, alice));
    assert_eq!(remote.get(&key), None);
}

#[tokio::test]
async fn edit_overtaken_by_a_remote_update_rolls_back_as_stale() {
    let (client, remote) = client();
    let alice = UserId::new();
    let seeded = remote.seed(draft(alice, "v1"));
    client.load(Collection::Posts).await.unwrap();
    let mut newer = seeded.as_post().unwrap().clone();
    let post_id = newer.id;

    // The dispatch task has not run yet when the remote edit lands.
    let pending = client.edit_post(alice, post_id, "v2").await.unwrap();
    assert_eq!(client.store().await.post(post_id).unwrap().body, "v2");
    newer.body = "edited elsewhere".into();
    newer.updated_at = remote.now().tick();
    client
        .engine()
        .apply_event(ChangeEvent::update(newer.clone().into()))
        .await;

    assert_eq!(
        pending.outcome().await.unwrap(),
        MutationOutcome::RolledBack {
            reason: RollbackReason::StaleWrite
        }
    );
    assert!(writes(&remote).is_empty());
    assert_eq!(client.store().await.post(post_id), Some(newer));
    assert_eq!(client.engine().pending_count().await, 0);
}

#[tokio::test]
async fn failed_edit_restores_the_previous_body() {
    let (client, remote) = client();
    let alice = UserId::new();
    let seeded = remote.seed(draft(alice, "v1"));
    client.load(Collection::Posts).await.unwrap();
    let post_id = seeded.as_post().unwrap().id;
    remote.fail_next(RemoteError::Network("offline".into()));

    let outcome = client
        .edit_post(alice, post_id, "v2")
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        MutationOutcome::RolledBack {
            reason: RollbackReason::Network("offline".into())
        }
    );
    assert_eq!(client.store().await.post(post_id).map(Entity::from), Some(seeded));
}

#[tokio::test]
async fn following_an_already_followed_user_rolls_back() {
    let (client, remote) = client();
    let (alice, bob) = (UserId::new(), UserId::new());
    remote.seed(Follow::new(alice, bob, Timestamp::ZERO));

    let outcome = client
        .toggle_follow(alice, bob)
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        MutationOutcome::RolledBack {
            reason: RollbackReason::AlreadyExists
        }
    );
    assert!(!client.store().await.is_following(alice, bob));
}

#[tokio::test]
async fn comment_on_a_remotely_deleted_post_rolls_back() {
    let (client, remote) = client();
    let (alice, bob) = (UserId::new(), UserId::new());
    let seeded = remote.seed(draft(bob, "soon gone"));
    client.load(Collection::Posts).await.unwrap();
    let post_id = seeded.as_post().unwrap().id;
    remote.delete(bob, seeded.key()).await.unwrap();

    let outcome = client
        .add_comment(alice, post_id, "too late")
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        MutationOutcome::RolledBack {
            reason: RollbackReason::TargetMissing
        }
    );
    assert_eq!(client.store().await.comment_count(post_id), 0);
}

#[tokio::test]
async fn edit_of_a_remotely_deleted_post_tombstones_it() {
    let (client, remote) = client();
    let alice = UserId::new();
    let seeded = remote.seed(draft(alice, "v1"));
    client.load(Collection::Posts).await.unwrap();
    let post_id = seeded.as_post().unwrap().id;
    remote.delete(alice, seeded.key()).await.unwrap();

    let outcome = client
        .edit_post(alice, post_id, "v2")
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(outcome, MutationOutcome::Tombstoned { key: seeded.key() });
    assert_eq!(client.store().await.post(post_id), None);
}

#[tokio::test]
async fn profile_is_created_then_updated() {
    let (client, remote) = client();
    let alice = UserId::new();
    let key = EntityKey::profile(alice);

    let first = update_profile(&client, alice, "Alice", "").await;
    assert_eq!(first, MutationOutcome::Confirmed { key });
    let second = update_profile(&client, alice, "Alice B.", "hello").await;
    assert_eq!(second, MutationOutcome::Confirmed { key });

    assert_eq!(writes(&remote), vec![RemoteCall::Insert(key), RemoteCall::Update(key)]);
    let profile = client.store().await.profile(alice).unwrap();
    assert_eq!(profile.display_name, "Alice B.");
    assert_eq!(profile.bio, "hello");
    assert_eq!(remote.get(&key), Some(profile.into()));
}

#[tokio::test(start_paused = true)]
async fn unanswered_write_times_out() {
    let config = SyncConfig::default().with_mutation_timeout(Duration::from_secs(1));
    let (client, remote) = client_with(config);
    remote.hold();

    let pending = client.create_post(UserId::new(), "into the void").await.unwrap();

    assert_eq!(
        pending.outcome().await.unwrap(),
        MutationOutcome::RolledBack {
            reason: RollbackReason::TimedOut
        }
    );
    assert!(client.store().await.feed().is_empty());
}

#[tokio::test]
async fn echo_can_settle_a_creation_before_the_response() {
    let (client, remote) = client();
    let alice = UserId::new();
    remote.hold();

    let pending = client.create_post(alice, "hello").await.unwrap();
    let token = pending.token;
    wait_for_writes(&remote, 1).await;

    let echo = server_post(token, alice, "hello", 10);
    let applied = client
        .engine()
        .apply_event(ChangeEvent::insert(echo.clone()))
        .await;

    assert_eq!(applied, Applied::Settled(token));
    assert_eq!(
        pending.outcome().await.unwrap(),
        MutationOutcome::Confirmed { key: echo.key() }
    );
    let feed = client.store().await.feed();
    assert_eq!(feed.len(), 1);
    assert_eq!(Entity::Post(feed[0].clone()), echo);
}

// ── Subscriptions ────────────────────────────────────────────────

#[tokio::test]
async fn remote_writes_by_others_appear() {
    let (client, remote) = client();
    let mut notices = client.notices();
    let _handle = client
        .follow_collection(Collection::Posts, SubscriptionFilter::All)
        .await
        .unwrap();
    let bob = UserId::new();

    let inserted = remote.insert(bob, draft(bob, "from bob")).await.unwrap();
    wait_for_change(&mut notices, inserted.key()).await;

    let feed = client.store().await.feed();
    assert_eq!(feed.len(), 1);
    assert_eq!(Entity::Post(feed[0].clone()), inserted);
}

#[tokio::test]
async fn own_creation_is_not_duplicated_by_its_echo() {
    let (client, remote) = client();
    let mut notices = client.notices();
    let _handle = client
        .follow_collection(Collection::Posts, SubscriptionFilter::All)
        .await
        .unwrap();
    let alice = UserId::new();

    let pending = client.create_post(alice, "once").await.unwrap();
    let token = pending.token;
    wait_for_notice(&mut notices, |n| {
        matches!(n, SyncNotice::MutationConfirmed { token: t, .. } if *t == token)
    })
    .await;
    let MutationOutcome::Confirmed { key } = pending.outcome().await.unwrap() else {
        panic!("creation was not confirmed");
    };
    remote.redeliver(&key);
    drain_tasks().await;

    let store = client.store().await;
    assert_eq!(store.feed().len(), 1);
    assert_eq!(store.get(&key), remote.get(&key));
    assert_eq!(client.engine().pending_count().await, 0);
}

#[tokio::test]
async fn filtered_subscription_only_delivers_matching_rows() {
    let (client, remote) = client();
    let mut notices = client.notices();
    let bob = UserId::new();
    let watched = remote.seed(draft(bob, "watched"));
    let other = remote.seed(draft(bob, "other"));
    let watched_id = watched.as_post().unwrap().id;
    let other_id = other.as_post().unwrap().id;
    let _handle = client
        .follow_collection(
            Collection::Comments,
            SubscriptionFilter::eq("post_id", watched_id),
        )
        .await
        .unwrap();

    let comment = |post_id| -> Entity {
        Comment::new(EntityId::new(), post_id, bob, "hi", Timestamp::ZERO).into()
    };
    remote.insert(bob, comment(other_id)).await.unwrap();
    let seen = remote.insert(bob, comment(watched_id)).await.unwrap();
    wait_for_change(&mut notices, seen.key()).await;

    let store = client.store().await;
    assert_eq!(store.comment_count(watched_id), 1);
    assert_eq!(store.comment_count(other_id), 0);
}

#[tokio::test]
async fn feed_gap_is_repaired_by_a_resync() {
    let (client, remote) = client();
    let (alice, bob) = (UserId::new(), UserId::new());
    let doomed = remote.seed(draft(alice, "doomed"));
    client.load(Collection::Posts).await.unwrap();
    let mut notices = client.notices();
    let handle = client
        .follow_collection(Collection::Posts, SubscriptionFilter::All)
        .await
        .unwrap();
    assert_eq!(handle.collection(), Collection::Posts);

    remote.interrupt_feed();
    let missed = remote.insert(bob, draft(bob, "missed")).await.unwrap();
    remote.delete(alice, doomed.key()).await.unwrap();
    drain_tasks().await;
    assert_eq!(client.store().await.feed().len(), 1);

    remote.restore_feed();
    let notice = wait_for_notice(&mut notices, |n| {
        matches!(n, SyncNotice::ResyncCompleted { .. })
    })
    .await;

    let SyncNotice::ResyncCompleted { collection, report } = notice else {
        unreachable!();
    };
    assert_eq!(collection, Collection::Posts);
    assert_eq!(report.applied, 1);
    assert_eq!(report.tombstoned, 1);
    let feed = client.store().await.feed();
    assert_eq!(feed.len(), 1);
    assert_eq!(Entity::Post(feed[0].clone()), missed);
}

#[tokio::test]
async fn unsubscribed_feed_stops_delivering() {
    let (client, remote) = client();
    let handle = client
        .follow_collection(Collection::Posts, SubscriptionFilter::All)
        .await
        .unwrap();

    handle.unsubscribe().await;
    let bob = UserId::new();
    remote.insert(bob, draft(bob, "unseen")).await.unwrap();
    drain_tasks().await;

    assert!(client.store().await.feed().is_empty());
}

// ── Maintenance ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn maintenance_purges_expired_tombstones() {
    let config = SyncConfig::default()
        .with_purge_interval(Duration::from_secs(1))
        .with_tombstone_grace(Duration::from_secs(2));
    let (client, _remote) = client_with(config);
    let record = draft(UserId::new(), "bye").with_version(ts(5));
    client
        .engine()
        .apply_event(ChangeEvent::insert(record.clone()))
        .await;
    client
        .engine()
        .apply_event(ChangeEvent::delete(record.key(), ts(6)))
        .await;
    assert_eq!(client.store().await.tombstone_count(Collection::Posts), 1);

    let maintenance = client.spawn_maintenance();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(client.store().await.tombstone_count(Collection::Posts), 0);
    maintenance.abort();
}
