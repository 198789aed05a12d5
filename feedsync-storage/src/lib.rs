//! In-memory storage layer for feedsync.
//!
//! Holds the normalized cache of every known entity: the single source of
//! truth for rendering.
//!
//! # Architecture
//!
//! - One ordered map per collection, shared behind an `Arc` and copied on
//!   write, so cloning the store yields a cheap immutable snapshot
//! - Last-write-wins by server timestamp on every conditional write
//! - Deletes leave tombstones that keep their timestamp until a grace
//!   period has elapsed
//! - Aggregates (like counts, follower counts, ...) are derived from
//!   queries, never stored
//!
//! The store performs no I/O and knows nothing about pending optimism; the
//! reconciliation engine is its only writer.

mod store;
mod views;

pub use store::{EntityStore, Query, StoredValue, Tombstone};
pub use views::ProfileStats;
