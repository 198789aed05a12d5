//! Error types for the model layer.

use crate::Collection;
use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while decoding or transforming records.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A row could not be decoded into a record.
    #[error("malformed row: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote named a table this model does not know.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// A key column was absent from a row.
    #[error("{collection} row is missing key column `{column}`")]
    MissingColumn {
        collection: Collection,
        column: &'static str,
    },

    /// A patch or record was applied to the wrong collection.
    #[error("expected a {expected} record, found {found}")]
    CollectionMismatch {
        expected: Collection,
        found: Collection,
    },
}
