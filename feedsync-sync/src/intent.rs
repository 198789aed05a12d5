//! User intents and their resolution into concrete mutations.
//!
//! An intent is what the user asked for ("like this post"); a mutation is
//! the write that realizes it given the state the user was looking at
//! ("insert the like (P, U)"). Resolution happens once, at enqueue time,
//! against the projected state: the last pending mutation on the same
//! identity if there is one, otherwise the store.

use crate::queue::MutationQueue;
use crate::{SyncError, SyncResult};
use feedsync_model::{Comment, Entity, EntityKey, EntityPatch, Follow, Like, Post, Profile};
use feedsync_storage::EntityStore;
use feedsync_types::{CorrelationToken, EntityId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// A local user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Intent {
    CreatePost { body: String },
    EditPost { post_id: EntityId, body: String },
    DeletePost { post_id: EntityId },
    AddComment { post_id: EntityId, body: String },
    ToggleLike { post_id: EntityId },
    ToggleFollow { followee_id: UserId },
    UpdateProfile { display_name: String, bio: String },
}

impl Intent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Intent::CreatePost { .. } => "create_post",
            Intent::EditPost { .. } => "edit_post",
            Intent::DeletePost { .. } => "delete_post",
            Intent::AddComment { .. } => "add_comment",
            Intent::ToggleLike { .. } => "toggle_like",
            Intent::ToggleFollow { .. } => "toggle_follow",
            Intent::UpdateProfile { .. } => "update_profile",
        }
    }

    /// Validates the intent and resolves it into a mutation.
    ///
    /// Rejections leave both the store and the queue untouched.
    pub fn resolve(
        &self,
        caller: UserId,
        token: CorrelationToken,
        store: &EntityStore,
        queue: &MutationQueue,
    ) -> SyncResult<Mutation> {
        match self {
            Intent::CreatePost { body } => {
                let body = non_empty(body, "post")?;
                let mut post = Post::new(token.provisional_id(), caller, body, Timestamp::now());
                post.client_token = Some(token);
                Ok(Mutation::Insert(post.into()))
            }
            Intent::EditPost { post_id, body } => {
                let body = non_empty(body, "post")?;
                let key = owned_live_post(caller, *post_id, store, "edit")?;
                Ok(Mutation::Update {
                    key,
                    patch: EntityPatch::Post { body },
                })
            }
            Intent::DeletePost { post_id } => {
                let key = owned_live_post(caller, *post_id, store, "delete")?;
                Ok(Mutation::Delete { key })
            }
            Intent::AddComment { post_id, body } => {
                let body = non_empty(body, "comment")?;
                confirmed_live_post(*post_id, store, queue)?;
                let mut comment = Comment::new(
                    token.provisional_id(),
                    *post_id,
                    caller,
                    body,
                    Timestamp::now(),
                );
                comment.client_token = Some(token);
                Ok(Mutation::Insert(comment.into()))
            }
            Intent::ToggleLike { post_id } => {
                confirmed_live_post(*post_id, store, queue)?;
                let key = EntityKey::like(*post_id, caller);
                Ok(toggle(key, store, queue, || {
                    Like::new(*post_id, caller, Timestamp::ZERO).into()
                }))
            }
            Intent::ToggleFollow { followee_id } => {
                if *followee_id == caller {
                    return Err(SyncError::InvalidIntent("cannot follow yourself".into()));
                }
                let key = EntityKey::follow(caller, *followee_id);
                Ok(toggle(key, store, queue, || {
                    Follow::new(caller, *followee_id, Timestamp::ZERO).into()
                }))
            }
            Intent::UpdateProfile { display_name, bio } => {
                let display_name = non_empty(display_name, "display name")?;
                let key = EntityKey::profile(caller);
                let exists = match queue.last_for(&key) {
                    Some(pending) => pending.mutation().is_write(),
                    None => store.is_live(&key),
                };
                if exists {
                    Ok(Mutation::Update {
                        key,
                        patch: EntityPatch::Profile {
                            display_name,
                            bio: bio.clone(),
                        },
                    })
                } else {
                    let profile = Profile::new(caller, display_name, Timestamp::ZERO).with_bio(bio);
                    Ok(Mutation::Insert(profile.into()))
                }
            }
        }
    }
}

/// A concrete write against one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Create a record. Posts and comments carry a provisional id and their
    /// correlation token; likes, follows and profiles use their natural key.
    Insert(Entity),
    /// Patch an existing record.
    Update { key: EntityKey, patch: EntityPatch },
    /// Delete a record.
    Delete { key: EntityKey },
}

impl Mutation {
    /// The identity this mutation targets.
    pub fn key(&self) -> EntityKey {
        match self {
            Mutation::Insert(entity) => entity.key(),
            Mutation::Update { key, .. } | Mutation::Delete { key } => *key,
        }
    }

    /// Whether this creates a record under a provisional id.
    pub fn is_creation(&self) -> bool {
        matches!(self, Mutation::Insert(entity) if entity.client_token().is_some())
    }

    /// Whether the record exists once this mutation is applied.
    pub fn is_write(&self) -> bool {
        !matches!(self, Mutation::Delete { .. })
    }

    /// Re-targets the mutation at a server-assigned identity.
    pub(crate) fn rebind(&mut self, to: EntityKey) {
        match self {
            Mutation::Update { key, .. } | Mutation::Delete { key } => *key = to,
            Mutation::Insert(_) => {}
        }
    }
}

fn non_empty(text: &str, what: &str) -> SyncResult<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidIntent(format!("{what} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

fn owned_live_post(
    caller: UserId,
    post_id: EntityId,
    store: &EntityStore,
    action: &str,
) -> SyncResult<EntityKey> {
    let post = store
        .post(post_id)
        .ok_or_else(|| {
            SyncError::InvalidIntent(format!("cannot {action} unknown post {post_id}"))
        })?;
    if post.author_id != caller {
        return Err(SyncError::InvalidIntent(format!(
            "only the author may {action} post {post_id}"
        )));
    }
    Ok(EntityKey::post(post_id))
}

/// Comments and likes need a post the server already knows.
fn confirmed_live_post(
    post_id: EntityId,
    store: &EntityStore,
    queue: &MutationQueue,
) -> SyncResult<()> {
    let key = EntityKey::post(post_id);
    if !store.is_live(&key) {
        return Err(SyncError::InvalidIntent(format!("post {post_id} does not exist")));
    }
    if queue.is_unconfirmed_creation(&key) {
        return Err(SyncError::InvalidIntent(format!("post {post_id} is still being created")));
    }
    Ok(())
}

fn toggle(
    key: EntityKey,
    store: &EntityStore,
    queue: &MutationQueue,
    record: impl FnOnce() -> Entity,
) -> Mutation {
    let present = match queue.last_for(&key) {
        Some(pending) => pending.mutation().is_write(),
        None => store.is_live(&key),
    };
    if present {
        Mutation::Delete { key }
    } else {
        Mutation::Insert(record())
    }
}
