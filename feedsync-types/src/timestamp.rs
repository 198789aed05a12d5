//! Server-assigned version timestamps.
//!
//! Every stored record carries the timestamp at which the remote store last
//! wrote it. Timestamps are totally ordered: wall time first, then a logical
//! counter that disambiguates writes within the same millisecond.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// A version timestamp.
///
/// Consists of:
/// - `wall_time`: milliseconds since Unix epoch
/// - `logical`: counter for writes at the same wall time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    wall_time: u64,
    #[serde(default)]
    logical: u32,
}

impl Timestamp {
    /// The version of a record that has never been written.
    pub const ZERO: Self = Self::new(0, 0);

    /// Creates a timestamp at the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self {
            wall_time: wall_clock_millis(),
            logical: 0,
        }
    }

    /// Creates a timestamp from components.
    #[must_use]
    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    /// Creates a timestamp with a zero logical counter.
    #[must_use]
    pub const fn from_millis(wall_time: u64) -> Self {
        Self::new(wall_time, 0)
    }

    /// Returns the wall time component.
    #[must_use]
    pub const fn wall_time(&self) -> u64 {
        self.wall_time
    }

    /// Returns the logical counter.
    #[must_use]
    pub const fn logical(&self) -> u32 {
        self.logical
    }

    /// Generates a timestamp strictly greater than this one.
    ///
    /// Follows the wall clock when it has advanced, otherwise bumps the
    /// logical counter.
    #[must_use]
    pub fn tick(&self) -> Self {
        let now = wall_clock_millis();
        if now > self.wall_time {
            Self {
                wall_time: now,
                logical: 0,
            }
        } else if self.logical == u32::MAX {
            Self {
                wall_time: self.wall_time + 1,
                logical: 0,
            }
        } else {
            Self {
                wall_time: self.wall_time,
                logical: self.logical + 1,
            }
        }
    }

    /// Returns true if this timestamp is strictly newer than the other.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self > other
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.wall_time.cmp(&other.wall_time) {
            Ordering::Equal => self.logical.cmp(&other.logical),
            other => other,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_time, self.logical)
    }
}

impl FromStr for Timestamp {
    type Err = crate::Error;

    /// Parses `"<wall>"` or `"<wall>.<logical>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::InvalidTimestamp(s.to_string());
        let (wall, logical) = match s.split_once('.') {
            Some((wall, logical)) => (wall, logical.parse().map_err(|_| invalid())?),
            None => (s, 0),
        };
        let wall = wall.parse().map_err(|_| invalid())?;
        Ok(Self::new(wall, logical))
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
