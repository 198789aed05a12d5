//! Conflict resolution between a stored version and an incoming one.

use feedsync_types::Timestamp;

/// Which side of a conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepCurrent,
    AcceptIncoming,
}

/// Last-write-wins by server timestamp, with the engine's own
/// confirmations taking precedence.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Decides between the stored version (`None` when nothing is stored)
    /// and an incoming one.
    ///
    /// Own pending confirmations always win. Otherwise the incoming record
    /// must be strictly newer; ties keep the current record.
    pub fn resolve(
        &self,
        current: Option<Timestamp>,
        incoming: Timestamp,
        own_confirmation: bool,
    ) -> Resolution {
        if own_confirmation {
            return Resolution::AcceptIncoming;
        }
        match current {
            Some(current) if !incoming.is_newer_than(&current) => Resolution::KeepCurrent,
            _ => Resolution::AcceptIncoming,
        }
    }
}
