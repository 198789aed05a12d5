//! Core type definitions for feedsync.
//!
//! This crate defines the small, domain-agnostic types the rest of the
//! workspace is built on:
//! - Entity, user and correlation identifiers (UUID v7)
//! - Server-assigned version timestamps
//!
//! Entity records, keys and change events live in `feedsync-model`.

mod ids;
mod timestamp;

pub use ids::{CorrelationToken, EntityId, UserId};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
