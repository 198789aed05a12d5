mod common;

use common::*;
use feedsync_model::{Entity, EntityKey, Profile};
use feedsync_sync::{Intent, MutationOutcome, SyncError};
use feedsync_types::{EntityId, UserId};
use pretty_assertions::assert_eq;
use serde_json::json;

fn assert_invalid<T: std::fmt::Debug>(result: Result<T, SyncError>) {
    assert!(
        matches!(result, Err(SyncError::InvalidIntent(_))),
        "expected InvalidIntent, got {result:?}"
    );
}

// ── Validation ───────────────────────────────────────────────────

#[tokio::test]
async fn blank_bodies_are_rejected() {
    let engine = empty_engine();
    let alice = UserId::new();

    assert_invalid(
        engine
            .enqueue(alice, Intent::CreatePost { body: "   ".into() })
            .await,
    );
    assert_eq!(engine.pending_count().await, 0);
    assert!(engine.store().await.is_empty());
}

#[tokio::test]
async fn only_the_author_may_edit_or_delete() {
    let (alice, bob) = (UserId::new(), UserId::new());
    let theirs = post(EntityId::new(), bob, "bob's", 5);
    let engine = engine_with([Entity::from(theirs.clone())]);

    assert_invalid(
        engine
            .enqueue(
                alice,
                Intent::EditPost {
                    post_id: theirs.id,
                    body: "hijack".into(),
                },
            )
            .await,
    );
    assert_invalid(
        engine
            .enqueue(alice, Intent::DeletePost { post_id: theirs.id })
            .await,
    );
    assert_eq!(engine.store().await.post(theirs.id), Some(theirs));
}

#[tokio::test]
async fn unknown_posts_are_rejected() {
    let engine = empty_engine();
    let alice = UserId::new();
    let missing = EntityId::new();

    assert_invalid(
        engine
            .enqueue(
                alice,
                Intent::EditPost {
                    post_id: missing,
                    body: "x".into(),
                },
            )
            .await,
    );
    assert_invalid(
        engine
            .enqueue(
                alice,
                Intent::AddComment {
                    post_id: missing,
                    body: "x".into(),
                },
            )
            .await,
    );
    assert_invalid(
        engine
            .enqueue(alice, Intent::ToggleLike { post_id: missing })
            .await,
    );
}

#[tokio::test]
async fn posts_still_being_created_cannot_be_liked_or_commented() {
    let engine = empty_engine();
    let alice = UserId::new();
    let created = engine
        .enqueue(alice, Intent::CreatePost { body: "new".into() })
        .await
        .unwrap();
    let post_id = created.token.provisional_id();

    assert_invalid(engine.enqueue(alice, Intent::ToggleLike { post_id }).await);
    assert_invalid(
        engine
            .enqueue(
                alice,
                Intent::AddComment {
                    post_id,
                    body: "first".into(),
                },
            )
            .await,
    );
    assert_eq!(engine.pending_count().await, 1);
}

#[tokio::test]
async fn following_yourself_is_rejected() {
    let engine = empty_engine();
    let alice = UserId::new();
    assert_invalid(
        engine
            .enqueue(alice, Intent::ToggleFollow { followee_id: alice })
            .await,
    );
}

#[tokio::test]
async fn blank_display_name_is_rejected() {
    let engine = empty_engine();
    assert_invalid(
        engine
            .enqueue(
                UserId::new(),
                Intent::UpdateProfile {
                    display_name: " ".into(),
                    bio: "bio".into(),
                },
            )
            .await,
    );
}

// ── Resolution ───────────────────────────────────────────────────

#[tokio::test]
async fn comment_is_created_under_a_provisional_id() {
    let (alice, bob) = (UserId::new(), UserId::new());
    let target = post(EntityId::new(), bob, "post", 5);
    let engine = engine_with([Entity::from(target.clone())]);

    let pending = engine
        .enqueue(
            alice,
            Intent::AddComment {
                post_id: target.id,
                body: "nice".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(pending.key, EntityKey::comment(pending.token.provisional_id()));
    let comments = engine.store().await.comments_on(target.id);
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author_id, alice);
    assert_eq!(comments[0].body, "nice");
}

#[tokio::test]
async fn follow_toggles_against_the_projected_state() {
    let (alice, bob) = (UserId::new(), UserId::new());
    let engine = empty_engine();

    let follow = engine
        .enqueue(alice, Intent::ToggleFollow { followee_id: bob })
        .await
        .unwrap();
    let unfollow = engine
        .enqueue(alice, Intent::ToggleFollow { followee_id: bob })
        .await
        .unwrap();

    assert_eq!(follow.key, EntityKey::follow(alice, bob));
    assert_eq!(unfollow.key, follow.key);
    assert!(engine.store().await.is_following(alice, bob));
    assert_eq!(engine.store().await.profile_stats(bob).followers, 1);
}

#[tokio::test]
async fn profile_update_inserts_then_patches() {
    let engine = empty_engine();
    let alice = UserId::new();

    let first = engine
        .enqueue(
            alice,
            Intent::UpdateProfile {
                display_name: "Alice".into(),
                bio: String::new(),
            },
        )
        .await
        .unwrap();
    let second = engine
        .enqueue(
            alice,
            Intent::UpdateProfile {
                display_name: "Alice B.".into(),
                bio: "hi".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(engine.store().await.profile(alice).unwrap().display_name, "Alice");

    let confirmed: Entity = Profile::new(alice, "Alice", ts(10)).into();
    engine.confirm(first.token, confirmed).await.unwrap();
    assert_eq!(
        first.outcome().await.unwrap(),
        MutationOutcome::Confirmed {
            key: EntityKey::profile(alice)
        }
    );

    let projected = engine.store().await.profile(alice).unwrap();
    assert_eq!(projected.display_name, "Alice B.");
    assert_eq!(projected.bio, "hi");
    assert_eq!(engine.pending_for(&second.key).await, vec![second.token]);
}

// ── Wire format ──────────────────────────────────────────────────

#[test]
fn intents_serialize_with_an_op_tag() {
    let post_id = EntityId::new();
    let value = serde_json::to_value(Intent::ToggleLike { post_id }).unwrap();
    assert_eq!(value, json!({ "op": "toggle_like", "post_id": post_id }));

    let back: Intent = serde_json::from_value(json!({
        "op": "create_post",
        "body": "hello",
    }))
    .unwrap();
    assert_eq!(back, Intent::CreatePost { body: "hello".into() });
    assert_eq!(back.name(), "create_post");
}
