//! Monotonic millisecond clock

use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the first call in this process.
///
/// Monotonic and cheap enough to stamp on every I/O event; the value fits in
/// an `AtomicU64` so connection records can carry timestamps without locks.
pub(crate) fn now_millis() -> u64 {
    ANCHOR
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis() as u64
}

/// Milliseconds elapsed since `earlier`, saturating at zero.
pub(crate) fn millis_since(earlier: u64) -> u64 {
    now_millis().saturating_sub(earlier)
}
