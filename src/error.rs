//! Shared error types at the collaborator seams (§7, §11).

use thiserror::Error;

/// Failure modes of a [`crate::puller::Puller`] invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PullError {
    #[error("no puller registered for this tag")]
    Unavailable,
    #[error("pull_internal exceeded its deadline")]
    Timeout,
    #[error("remote puller error: {0}")]
    RemoteError(String),
    #[error("malformed puller output: {0}")]
    Malformed(String),
}

/// Failures owned by the socket listener (C3). Framing-level problems are
/// intentionally absent here: they are non-fatal and observable only through
/// [`crate::diagnostics::Diagnostics`] counters, never as a returned error.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to bind datagram socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("fatal recv error: {0}")]
    Recv(#[source] std::io::Error),
}

/// Top-level error surfaced to the supervisor when a core thread cannot continue.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("core invariant violated: {0}")]
    InvariantViolation(String),
}
