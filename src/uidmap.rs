//! External collaborator contract for the isolated-uid merge policy (§4.3).
//! The uid-to-package map itself is out of scope for the core (§1); this is
//! only the seam the registry reads through.

/// Resolves whether a producer uid is an isolated uid and, if so, which host
/// uid it should be merged into for accounting purposes.
pub trait IsolatedUidProvider: Send + Sync {
    /// Returns the host uid to merge `uid` into, or `None` if `uid` is not an
    /// isolated uid (in which case it passes through unchanged).
    fn resolve_host_uid(&self, uid: u32) -> Option<u32>;
}

/// A provider that never reports an isolated uid — the default when no
/// collaborator is wired in, leaving every record's uid untouched.
pub struct NoIsolatedUids;

impl IsolatedUidProvider for NoIsolatedUids {
    fn resolve_host_uid(&self, _uid: u32) -> Option<u32> {
        None
    }
}
