//! Request identifiers for cross-component log correlation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique request ID.
///
/// Format: `timestamp_nanos-counter-random8hex`. Unique across restarts and
/// under high concurrency.
pub fn generate() -> String {
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    format!("{}-{}-{:08x}", timestamp, counter, rand::random::<u32>())
}
