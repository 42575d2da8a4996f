//! Error types for the run coordinator.

use std::time::Duration;

use membreak_state::StoreError;

/// Errors surfaced to callers of the coordinator and `EvalService`.
///
/// Failures below the agent-run boundary never appear here; they are
/// recorded on the agent run instead.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request; nothing was created or started.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Operation not allowed in the entity's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("run orchestration failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("state store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotFound(id) => CoordinatorError::NotFound(format!("run {id}")),
            StoreError::AgentRunNotFound(id) => {
                CoordinatorError::NotFound(format!("agent run {id}"))
            }
            other => CoordinatorError::Store(other),
        }
    }
}

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;
