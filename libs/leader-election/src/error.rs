//! Error types for leader election.
//!
//! Only initialization failures are ever returned from
//! [`LeaderElector::run`](crate::LeaderElector::run). Everything the lease
//! runner hits while acquiring or renewing is logged and retried, but the
//! variants are still typed so backends and tests can tell a revision conflict
//! from a transport failure.

use thiserror::Error;

/// Top-level error type for the leader-election crate.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// Lock backend connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for the lock backend.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Compare-and-set on the lease record lost against another writer.
    #[error("revision conflict: expected revision {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// The lease record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration (timings, identity, credentials).
    #[error("configuration error: {0}")]
    Config(String),

    /// The lock backend is not reachable right now.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// `run` was called while another `run` on the same elector is active.
    #[error("leader elector for role {0} is already running")]
    AlreadyRunning(String),
}

impl ElectionError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport, timeout, revision conflict, or a dropped
    /// connection).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ElectionError::Transport(_)
                | ElectionError::Timeout(_)
                | ElectionError::Conflict { .. }
                | ElectionError::NotConnected(_)
        )
    }

    /// Returns true if this error is a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ElectionError::Conflict { .. })
    }
}

/// Shorthand result alias for election operations.
pub type ElectionResult<T> = Result<T, ElectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport = ElectionError::Transport("conn reset".into());
        assert!(transport.is_retryable());
        assert!(!transport.is_conflict());

        let timeout = ElectionError::Timeout("deadline exceeded".into());
        assert!(timeout.is_retryable());

        let conflict = ElectionError::Conflict {
            expected: 3,
            actual: 5,
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());

        let not_conn = ElectionError::NotConnected("no conn".into());
        assert!(not_conn.is_retryable());

        assert!(!ElectionError::Codec("bad json".into()).is_retryable());
        assert!(!ElectionError::Config("missing server".into()).is_retryable());
        assert!(!ElectionError::AlreadyRunning("default/x".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ElectionError::Conflict {
            expected: 1,
            actual: 2,
        };
        let msg = format!("{err}");
        assert!(msg.contains("expected revision 1"));
        assert!(msg.contains("found 2"));

        let err = ElectionError::AlreadyRunning("kube-system/scheduler".into());
        assert_eq!(
            err.to_string(),
            "leader elector for role kube-system/scheduler is already running"
        );
    }
}
