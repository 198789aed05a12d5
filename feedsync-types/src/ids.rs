//! Identifier types used throughout the feedsync core.
//!
//! Uses UUID v7 for time-ordered, globally unique identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new identifier with the current timestamp.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Parses an identifier from a string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_id!(
    /// Identity of a post or comment.
    ///
    /// Server-assigned for confirmed records. Optimistic creations use a
    /// provisional id derived from their [`CorrelationToken`].
    EntityId
);

uuid_id!(
    /// Identity of a user. Doubles as the identity of that user's profile.
    UserId
);

uuid_id!(
    /// Locally generated token linking an optimistic mutation to its
    /// eventual server-confirmed counterpart.
    CorrelationToken
);

impl CorrelationToken {
    /// The provisional entity id under which an optimistic creation is
    /// stored until the server assigns the real one.
    #[must_use]
    pub const fn provisional_id(&self) -> EntityId {
        EntityId::from_uuid(self.0)
    }
}
