//! Change events.
//!
//! A change event is the uniform shape of every change notification the
//! reconciliation engine consumes, whatever quirks the remote's push feed
//! has. Events are immutable and carry the server timestamp of the write
//! they describe.

use crate::{Collection, Entity, EntityKey};
use feedsync_types::Timestamp;
use serde::{Deserialize, Serialize};

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single normalized change to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub key: EntityKey,
    pub kind: ChangeKind,
    /// The new record for inserts and updates. For deletes, the last known
    /// record when the remote supplied one, otherwise `None`.
    pub record: Option<Entity>,
    pub server_timestamp: Timestamp,
}

impl ChangeEvent {
    /// An insert of `entity`, versioned by the record's own timestamp.
    pub fn insert(entity: Entity) -> Self {
        Self::write(ChangeKind::Insert, entity)
    }

    /// An update to `entity`, versioned by the record's own timestamp.
    pub fn update(entity: Entity) -> Self {
        Self::write(ChangeKind::Update, entity)
    }

    /// A delete that only names the key.
    pub fn delete(key: EntityKey, server_timestamp: Timestamp) -> Self {
        Self {
            collection: key.collection(),
            key,
            kind: ChangeKind::Delete,
            record: None,
            server_timestamp,
        }
    }

    /// A delete that carries the record as it was before deletion.
    pub fn delete_record(entity: Entity, server_timestamp: Timestamp) -> Self {
        Self {
            collection: entity.collection(),
            key: entity.key(),
            kind: ChangeKind::Delete,
            record: Some(entity),
            server_timestamp,
        }
    }

    fn write(kind: ChangeKind, entity: Entity) -> Self {
        Self {
            collection: entity.collection(),
            key: entity.key(),
            kind,
            server_timestamp: entity.updated_at(),
            record: Some(entity),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }

    /// The record as it should be stored if this event is accepted: stamped
    /// with the event's server timestamp, and tombstoned for deletes.
    pub fn resulting_record(&self) -> Option<Entity> {
        match self.kind {
            ChangeKind::Delete => self
                .record
                .as_ref()
                .and_then(|r| r.tombstoned(self.server_timestamp))
                .or_else(|| Entity::tombstone_for_key(&self.key, self.server_timestamp)),
            ChangeKind::Insert | ChangeKind::Update => self
                .record
                .as_ref()
                .map(|r| r.with_version(self.server_timestamp)),
        }
    }
}
