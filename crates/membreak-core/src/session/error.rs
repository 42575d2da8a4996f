//! Error types for agent sessions.

use std::time::Duration;

use membreak_state::{AgentKind, FailureKind, StoreError};

/// Errors produced while running one agent session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("agent kind not registered: {0}")]
    NotFound(AgentKind),

    /// Provider refused a turn because its context is full.
    #[error("agent context exhausted: {0}")]
    ContextExhausted(String),

    #[error("agent session failed: {0}")]
    Execution(String),

    #[error("agent session timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("state store rejected session update: {0}")]
    Storage(#[from] StoreError),
}

impl SessionError {
    /// Failure classification recorded on the agent run.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SessionError::NotFound(_) => FailureKind::NotFound,
            SessionError::ContextExhausted(_) | SessionError::Execution(_) => {
                FailureKind::Execution
            }
            SessionError::Timeout(_) => FailureKind::Timeout,
            SessionError::Cancelled => FailureKind::Cancelled,
            SessionError::Storage(_) => FailureKind::Storage,
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinct_from_execution() {
        assert_eq!(
            SessionError::Timeout(Duration::from_secs(1)).failure_kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            SessionError::Execution("boom".into()).failure_kind(),
            FailureKind::Execution
        );
        assert_eq!(SessionError::Cancelled.to_string(), "cancelled");
    }
}
