//! Wall-clock stamps for read batches.

use chrono::Utc;

/// Nanoseconds since the POSIX epoch. Clocks set before 1970 read as 0.
pub fn posix_now_ns() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .unwrap_or(0)
}
