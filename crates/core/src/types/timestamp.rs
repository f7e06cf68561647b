//! Nanosecond-precision wall-clock timestamps.
//!
//! [`Timestamp`] wraps a `u64` of nanoseconds since the Unix epoch. The
//! exchange stamps its messages in epoch milliseconds, so receipt times are
//! taken from the same wall clock to make the two directly comparable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanosecond-precision timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Capture the current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        Self(nanos.max(0) as u64)
    }

    /// Create a timestamp from milliseconds since the epoch.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * 1_000_000)
    }

    /// Convert to milliseconds since the epoch.
    #[inline]
    pub const fn to_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns the raw nanosecond value.
    #[inline]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Nanoseconds from `earlier` to `self`, saturating at zero.
    #[inline]
    pub const fn elapsed_since(&self, earlier: &Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Microseconds from `earlier` to `self`, saturating at zero.
    #[inline]
    pub const fn micros_since(&self, earlier: &Timestamp) -> u64 {
        self.elapsed_since(earlier) / 1_000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{}.{:09}", secs, nanos)
    }
}
