//! Monotonic time for the whole process.
//!
//! All deadlines and wire timestamps derive from a single `Instant` captured
//! on first use. The epoch is the one process-wide lazily-initialized value
//! in the engine; everything else is threaded through [`crate::context::Context`].

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Tick rate of [`now_ticks`], carried on the wire next to each timestamp so
/// the two sides can normalize each other's clocks.
pub const TICKS_PER_SECOND: i64 = 1_000_000_000;

#[inline]
fn epoch() -> Instant {
    *PROCESS_EPOCH.get_or_init(Instant::now)
}

/// Capture the epoch now rather than at first use. Call early in `main`.
pub fn init() {
    let _ = epoch();
}

/// Monotonic milliseconds since the process epoch.
#[inline]
pub fn now_ms() -> i64 {
    epoch().elapsed().as_millis() as i64
}

/// Monotonic ticks ([`TICKS_PER_SECOND`] per second) since the process epoch.
#[inline]
pub fn now_ticks() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

/// Convert a millisecond delay into the timer service's native relative form.
/// Deadlines already in the past become an immediate zero-length wait.
#[inline]
pub fn relative_deadline(milliseconds: i64) -> Duration {
    if milliseconds <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(milliseconds as u64)
    }
}
