//! The one process-wide monotonic epoch every `elapsed_ns` timestamp in this
//! crate is measured against — the socket reader, the alarm scheduler, and
//! every puller family all compare deadlines on this same clock, so a
//! deadline computed in one thread is meaningful when read in another.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static START: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since this process's first call into the clock module.
pub fn elapsed_ns() -> i64 {
    START.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

/// Current wall-clock time, nanoseconds since the Unix epoch.
pub fn wall_ns() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as i64).unwrap_or(0)
}

/// Current wall-clock time, seconds since the Unix epoch (§4.6's loss-report
/// timestamp granularity).
pub fn wall_sec() -> i64 {
    wall_ns() / 1_000_000_000
}
