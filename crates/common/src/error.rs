//! The request-level error taxonomy.
//!
//! These are kinds, not layers: every component surfaces its failures as
//! one of these so the handler boundary and the RPC boundary share one
//! shape. Peer-side causes are carried as strings for attribution.

/// Errors surfaced by the request-handling core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// Object or metadata absent.
    #[error("not found")]
    NotFound,

    /// Local store locked or watchdog unsafe; the client may retry.
    #[error("unavailable")]
    Unavailable,

    /// Peer RPC deadline exceeded.
    #[error("timeout")]
    Timeout,

    /// The ring service returned no redundancy set. Fatal for the request.
    #[error("no redundancy set")]
    NoRedundancy,

    /// Too few available replicas to satisfy the quorum. Fatal for the request.
    #[error("quorum not satisfiable: need {needed}, available {available}")]
    NotSatisfyQuorum { needed: usize, available: usize },

    /// Read repair could not converge. Logged only; never surfaced to clients.
    #[error("recover failure: {0}")]
    RecoverFailure(String),

    /// Replication fell under quorum with no replica reporting NotFound.
    #[error("replicate failure: {0}")]
    ReplicateFailure(String),

    /// Metadata decode failure; the object is treated as corrupt.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl ObjectError {
    /// Whether a retry by the client could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ObjectError::Unavailable.is_retryable());
        assert!(ObjectError::Timeout.is_retryable());
        assert!(!ObjectError::NotFound.is_retryable());
        assert!(!ObjectError::NoRedundancy.is_retryable());
    }

    #[test]
    fn test_display_carries_quorum_counts() {
        let e = ObjectError::NotSatisfyQuorum {
            needed: 2,
            available: 1,
        };
        let s = e.to_string();
        assert!(s.contains('2') && s.contains('1'), "got: {}", s);
    }
}
