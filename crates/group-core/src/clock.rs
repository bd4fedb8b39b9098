//! Wall-clock helper.
//!
//! Stages keep timestamps as milliseconds since the Unix epoch so that the
//! time-dependent paths can be driven with explicit values in tests.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
