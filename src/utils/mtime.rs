//! Mtime helpers in epoch milliseconds.
//!
//! Timestamps flow through cache keys and artifact headers as integers, so
//! they are read once here and carried as `u64` millis everywhere else.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Modification time of a file as epoch milliseconds.
///
/// Returns `None` if the file doesn't exist or mtime cannot be read.
pub fn mtime_ms(path: &Path) -> Option<u64> {
    let modified = path.metadata().and_then(|m| m.modified()).ok()?;
    Some(to_ms(modified))
}

/// Convert a `SystemTime` to epoch milliseconds (pre-epoch clamps to 0).
#[inline]
pub fn to_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current time as epoch milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    to_ms(SystemTime::now())
}
