//! Built-in puller families recognised by the registry (§4.3).

pub mod callback;
pub mod proc_file;
pub mod rpc;
pub mod subprocess;

/// Converts an absolute `deadline_ns` (elapsed-clock) into a
/// [`std::time::Duration`] remaining from now, clamped to zero rather than
/// going negative. Shared by every puller family that needs to bound a
/// blocking call (RPC, callback, subprocess).
pub(crate) fn remaining(deadline_ns: i64, now_ns: i64) -> std::time::Duration {
    let remaining_ns = (deadline_ns - now_ns).max(0);
    std::time::Duration::from_nanos(remaining_ns as u64)
}
