/*!
Download session identifiers.
*/

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new, never reused session ID.
///
/// Format: `YYYYMMDDHHMMSS_<counter><random>` with a UTC timestamp, a
/// zero-padded ten digit process-wide counter and eight hex digits of
/// randomness. IDs sort lexicographically in creation order.
pub fn new_id() -> String {
    let ts = Utc::now().format("%Y%m%d%H%M%S");
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let suffix: u32 = rand::random();

    format!("{ts}_{counter:010}{suffix:08x}")
}
