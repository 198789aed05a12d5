//! Partial updates.

use crate::{Collection, Entity, ModelError, ModelResult};
use serde::{Deserialize, Serialize};

/// A partial update sent to the remote store's `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPatch {
    /// Replace a post's body.
    Post { body: String },
    /// Replace a profile's display name and bio.
    Profile { display_name: String, bio: String },
}

impl EntityPatch {
    /// The collection this patch targets.
    pub fn collection(&self) -> Collection {
        match self {
            EntityPatch::Post { .. } => Collection::Posts,
            EntityPatch::Profile { .. } => Collection::Profiles,
        }
    }

    /// Applies the patch to a record, leaving its version untouched.
    ///
    /// The remote stamps the new version; locally the patched record is an
    /// optimistic projection of the base it was computed from.
    pub fn apply(&self, entity: &Entity) -> ModelResult<Entity> {
        match (self, entity) {
            (EntityPatch::Post { body }, Entity::Post(post)) => {
                let mut post = post.clone();
                post.body = body.clone();
                Ok(Entity::Post(post))
            }
            (EntityPatch::Profile { display_name, bio }, Entity::Profile(profile)) => {
                let mut profile = profile.clone();
                profile.display_name = display_name.clone();
                profile.bio = bio.clone();
                Ok(Entity::Profile(profile))
            }
            _ => Err(ModelError::CollectionMismatch {
                expected: self.collection(),
                found: entity.collection(),
            }),
        }
    }
}
