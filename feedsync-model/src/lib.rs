//! Feed entity model for feedsync.
//!
//! Defines the value records every other layer passes around:
//! - Immutable records ([`Profile`], [`Post`], [`Comment`], [`Like`],
//!   [`Follow`]), replaced wholesale on update
//! - [`Entity`], the sum of all records, with its [`EntityKey`] identity
//!   inside a [`Collection`]
//! - [`EntityPatch`] for partial updates sent to the remote store
//! - [`ChangeEvent`], the uniform change notification consumed by
//!   reconciliation
//!
//! Records serialize to the remote store's row format (snake_case columns),
//! so the same types decode push payloads and snapshot rows.

mod entity;
mod error;
mod event;
mod patch;

pub use entity::{Collection, Comment, Entity, EntityKey, Follow, Like, Post, Profile};
pub use error::{ModelError, ModelResult};
pub use event::{ChangeEvent, ChangeKind};
pub use patch::EntityPatch;
