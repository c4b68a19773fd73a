//! Process-wide identifier generation for messages and transfers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: OnceLock<AtomicU64> = OnceLock::new();

/// Monotonically increasing identifier, seeded from the wall clock so ids
/// stay distinct across restarts.
#[must_use]
pub fn next_id() -> u64 {
    let counter = COUNTER.get_or_init(|| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        AtomicU64::new(now)
    });
    counter.fetch_add(1, Ordering::Relaxed)
}
