use crate::{ModelError, ModelResult};
use feedsync_types::{CorrelationToken, EntityId, Timestamp, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named collection in the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Profiles,
    Posts,
    Comments,
    Likes,
    Follows,
}

impl Collection {
    /// Every collection, in dependency order.
    pub const ALL: [Collection; 5] = [
        Collection::Profiles,
        Collection::Posts,
        Collection::Comments,
        Collection::Likes,
        Collection::Follows,
    ];

    /// The remote table backing this collection.
    pub const fn table_name(&self) -> &'static str {
        match self {
            Collection::Profiles => "profiles",
            Collection::Posts => "posts",
            Collection::Comments => "comments",
            Collection::Likes => "likes",
            Collection::Follows => "follows",
        }
    }

    /// Resolves a remote table name.
    pub fn from_table(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.table_name() == name)
    }

    /// Whether records of this collection carry a tombstone flag.
    pub const fn is_tombstonable(&self) -> bool {
        !matches!(self, Collection::Profiles)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for Collection {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_table(s).ok_or_else(|| ModelError::UnknownCollection(s.to_string()))
    }
}

/// A user's public profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(alias = "full_name", default)]
    pub display_name: String,
    #[serde(default)]
    pub bio: String,
    pub updated_at: Timestamp,
}

impl Profile {
    pub fn new(id: UserId, display_name: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            bio: String::new(),
            updated_at,
        }
    }

    pub fn with_bio(mut self, bio: impl Into<String>) -> Self {
        self.bio = bio.into();
        self
    }
}

/// A post in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: EntityId,
    #[serde(alias = "user_id")]
    pub author_id: UserId,
    #[serde(alias = "content")]
    pub body: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    /// Correlation token of the optimistic creation that produced this post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<CorrelationToken>,
}

impl Post {
    pub fn new(id: EntityId, author_id: UserId, body: impl Into<String>, at: Timestamp) -> Self {
        Self {
            id,
            author_id,
            body: body.into(),
            created_at: at,
            updated_at: at,
            deleted: false,
            client_token: None,
        }
    }
}

/// A comment on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: EntityId,
    pub post_id: EntityId,
    #[serde(alias = "user_id")]
    pub author_id: UserId,
    #[serde(alias = "content")]
    pub body: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<CorrelationToken>,
}

impl Comment {
    pub fn new(
        id: EntityId,
        post_id: EntityId,
        author_id: UserId,
        body: impl Into<String>,
        at: Timestamp,
    ) -> Self {
        Self {
            id,
            post_id,
            author_id,
            body: body.into(),
            created_at: at,
            updated_at: at,
            deleted: false,
            client_token: None,
        }
    }
}

/// A like. Presence of a live record means the user likes the post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Like {
    pub post_id: EntityId,
    pub user_id: UserId,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

impl Like {
    pub fn new(post_id: EntityId, user_id: UserId, updated_at: Timestamp) -> Self {
        Self {
            post_id,
            user_id,
            updated_at,
            deleted: false,
        }
    }
}

/// A follow edge. Presence of a live record means `follower_id` follows
/// `followee_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    pub follower_id: UserId,
    pub followee_id: UserId,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

impl Follow {
    pub fn new(follower_id: UserId, followee_id: UserId, updated_at: Timestamp) -> Self {
        Self {
            follower_id,
            followee_id,
            updated_at,
            deleted: false,
        }
    }
}

/// Identity of an entity within its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum EntityKey {
    Profile { id: UserId },
    Post { id: EntityId },
    Comment { id: EntityId },
    Like { post_id: EntityId, user_id: UserId },
    Follow { follower_id: UserId, followee_id: UserId },
}

impl EntityKey {
    pub const fn profile(id: UserId) -> Self {
        Self::Profile { id }
    }

    pub const fn post(id: EntityId) -> Self {
        Self::Post { id }
    }

    pub const fn comment(id: EntityId) -> Self {
        Self::Comment { id }
    }

    pub const fn like(post_id: EntityId, user_id: UserId) -> Self {
        Self::Like { post_id, user_id }
    }

    pub const fn follow(follower_id: UserId, followee_id: UserId) -> Self {
        Self::Follow {
            follower_id,
            followee_id,
        }
    }

    /// The collection this key lives in.
    pub const fn collection(&self) -> Collection {
        match self {
            EntityKey::Profile { .. } => Collection::Profiles,
            EntityKey::Post { .. } => Collection::Posts,
            EntityKey::Comment { .. } => Collection::Comments,
            EntityKey::Like { .. } => Collection::Likes,
            EntityKey::Follow { .. } => Collection::Follows,
        }
    }

    /// The same key with its entity id swapped, for rebinding a provisional
    /// identity to the server-assigned one. Composite keys are unchanged.
    pub fn with_id(&self, id: EntityId) -> Self {
        match self {
            EntityKey::Post { .. } => EntityKey::Post { id },
            EntityKey::Comment { .. } => EntityKey::Comment { id },
            other => *other,
        }
    }

    /// Extracts the key columns of a remote row.
    ///
    /// Works on both full rows and the key-only payload of a delete.
    pub fn from_row(collection: Collection, row: &serde_json::Value) -> ModelResult<Self> {
        Ok(match collection {
            Collection::Profiles => EntityKey::Profile {
                id: column(collection, row, "id")?,
            },
            Collection::Posts => EntityKey::Post {
                id: column(collection, row, "id")?,
            },
            Collection::Comments => EntityKey::Comment {
                id: column(collection, row, "id")?,
            },
            Collection::Likes => EntityKey::Like {
                post_id: column(collection, row, "post_id")?,
                user_id: column(collection, row, "user_id")?,
            },
            Collection::Follows => EntityKey::Follow {
                follower_id: column(collection, row, "follower_id")?,
                followee_id: column(collection, row, "followee_id")?,
            },
        })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Profile { id } => write!(f, "profiles/{id}"),
            EntityKey::Post { id } => write!(f, "posts/{id}"),
            EntityKey::Comment { id } => write!(f, "comments/{id}"),
            EntityKey::Like { post_id, user_id } => write!(f, "likes/{post_id}:{user_id}"),
            EntityKey::Follow {
                follower_id,
                followee_id,
            } => write!(f, "follows/{follower_id}:{followee_id}"),
        }
    }
}

fn column<T: DeserializeOwned>(
    collection: Collection,
    row: &serde_json::Value,
    name: &'static str,
) -> ModelResult<T> {
    let value = row.get(name).ok_or(ModelError::MissingColumn {
        collection,
        column: name,
    })?;
    Ok(T::deserialize(value)?)
}

/// Any record the store can hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "record", rename_all = "snake_case")]
pub enum Entity {
    Profile(Profile),
    Post(Post),
    Comment(Comment),
    Like(Like),
    Follow(Follow),
}

impl Entity {
    /// The record's identity.
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Profile(p) => EntityKey::profile(p.id),
            Entity::Post(p) => EntityKey::post(p.id),
            Entity::Comment(c) => EntityKey::comment(c.id),
            Entity::Like(l) => EntityKey::like(l.post_id, l.user_id),
            Entity::Follow(f) => EntityKey::follow(f.follower_id, f.followee_id),
        }
    }

    pub fn collection(&self) -> Collection {
        self.key().collection()
    }

    /// The server timestamp of the last write to this record.
    pub fn updated_at(&self) -> Timestamp {
        match self {
            Entity::Profile(p) => p.updated_at,
            Entity::Post(p) => p.updated_at,
            Entity::Comment(c) => c.updated_at,
            Entity::Like(l) => l.updated_at,
            Entity::Follow(f) => f.updated_at,
        }
    }

    /// Whether the record carries the tombstone flag.
    pub fn is_deleted(&self) -> bool {
        match self {
            Entity::Profile(_) => false,
            Entity::Post(p) => p.deleted,
            Entity::Comment(c) => c.deleted,
            Entity::Like(l) => l.deleted,
            Entity::Follow(f) => f.deleted,
        }
    }

    /// Token of the optimistic creation this record confirms, if any.
    pub fn client_token(&self) -> Option<CorrelationToken> {
        match self {
            Entity::Post(p) => p.client_token,
            Entity::Comment(c) => c.client_token,
            _ => None,
        }
    }

    /// A copy stamped with a different version.
    #[must_use]
    pub fn with_version(&self, at: Timestamp) -> Entity {
        let mut entity = self.clone();
        match &mut entity {
            Entity::Profile(p) => p.updated_at = at,
            Entity::Post(p) => p.updated_at = at,
            Entity::Comment(c) => c.updated_at = at,
            Entity::Like(l) => l.updated_at = at,
            Entity::Follow(f) => f.updated_at = at,
        }
        entity
    }

    /// A tombstoned copy deleted at `at`. Profiles cannot be tombstoned.
    #[must_use]
    pub fn tombstoned(&self, at: Timestamp) -> Option<Entity> {
        let mut entity = self.with_version(at);
        match &mut entity {
            Entity::Profile(_) => return None,
            Entity::Post(p) => p.deleted = true,
            Entity::Comment(c) => c.deleted = true,
            Entity::Like(l) => l.deleted = true,
            Entity::Follow(f) => f.deleted = true,
        }
        Some(entity)
    }

    /// Builds the tombstone for a key alone, when the key carries every
    /// field of the record (likes and follows).
    pub fn tombstone_for_key(key: &EntityKey, at: Timestamp) -> Option<Entity> {
        match *key {
            EntityKey::Like { post_id, user_id } => Some(Entity::Like(Like {
                post_id,
                user_id,
                updated_at: at,
                deleted: true,
            })),
            EntityKey::Follow {
                follower_id,
                followee_id,
            } => Some(Entity::Follow(Follow {
                follower_id,
                followee_id,
                updated_at: at,
                deleted: true,
            })),
            _ => None,
        }
    }

    /// Decodes a remote row of the given collection.
    pub fn from_row(collection: Collection, row: serde_json::Value) -> ModelResult<Entity> {
        Ok(match collection {
            Collection::Profiles => Entity::Profile(serde_json::from_value(row)?),
            Collection::Posts => Entity::Post(serde_json::from_value(row)?),
            Collection::Comments => Entity::Comment(serde_json::from_value(row)?),
            Collection::Likes => Entity::Like(serde_json::from_value(row)?),
            Collection::Follows => Entity::Follow(serde_json::from_value(row)?),
        })
    }

    /// Encodes the record as a remote row.
    pub fn to_row(&self) -> ModelResult<serde_json::Value> {
        Ok(match self {
            Entity::Profile(p) => serde_json::to_value(p)?,
            Entity::Post(p) => serde_json::to_value(p)?,
            Entity::Comment(c) => serde_json::to_value(c)?,
            Entity::Like(l) => serde_json::to_value(l)?,
            Entity::Follow(f) => serde_json::to_value(f)?,
        })
    }

    pub fn as_profile(&self) -> Option<&Profile> {
        match self {
            Entity::Profile(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            Entity::Post(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_comment(&self) -> Option<&Comment> {
        match self {
            Entity::Comment(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_like(&self) -> Option<&Like> {
        match self {
            Entity::Like(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_follow(&self) -> Option<&Follow> {
        match self {
            Entity::Follow(f) => Some(f),
            _ => None,
        }
    }
}

impl From<Profile> for Entity {
    fn from(p: Profile) -> Self {
        Entity::Profile(p)
    }
}

impl From<Post> for Entity {
    fn from(p: Post) -> Self {
        Entity::Post(p)
    }
}

impl From<Comment> for Entity {
    fn from(c: Comment) -> Self {
        Entity::Comment(c)
    }
}

impl From<Like> for Entity {
    fn from(l: Like) -> Self {
        Entity::Like(l)
    }
}

impl From<Follow> for Entity {
    fn from(f: Follow) -> Self {
        Entity::Follow(f)
    }
}
