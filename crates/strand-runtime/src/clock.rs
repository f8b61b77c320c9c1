//! Steady-clock time points
//!
//! Deadlines are absolute monotonic nanoseconds measured from a
//! process-wide epoch. Wake-ups may be late but never early.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// "Not sleeping" sentinel (the +infinity time point)
pub const TP_NONE: u64 = u64::MAX;

static EPOCH: OnceLock<Instant> = OnceLock::new();

#[inline]
fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic nanoseconds since the process epoch
#[inline]
pub fn now_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Convert an absolute `Instant` into a deadline
///
/// Instants at or before the epoch map to 0 (already expired).
#[inline]
pub fn instant_to_ns(at: Instant) -> u64 {
    at.saturating_duration_since(epoch()).as_nanos() as u64
}

/// Deadline reached by adding `d` to the current time
#[inline]
pub fn deadline_after(d: Duration) -> u64 {
    now_ns().saturating_add(d.as_nanos() as u64)
}

/// Time remaining until `tp`, `None` once it has passed
#[inline]
pub fn until(tp: u64) -> Option<Duration> {
    let now = now_ns();
    if tp <= now {
        None
    } else {
        Some(Duration::from_nanos(tp - now))
    }
}
