//! Error types for membreak-state

use thiserror::Error;

use crate::schema::{AgentKind, AgentRunId, RunId};

/// Errors raised by run state stores
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Run does not exist
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Agent run does not exist
    #[error("agent run not found: {0}")]
    AgentRunNotFound(AgentRunId),

    /// Run id already taken
    #[error("run already exists: {0}")]
    DuplicateRun(RunId),

    /// An active agent run already exists for this (run, kind) pair
    #[error("active agent run already exists for run {run_id} kind {agent_kind}")]
    DuplicateAgentRun { run_id: RunId, agent_kind: AgentKind },

    /// Status change not permitted by the lifecycle
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Scores are immutable once written
    #[error("score already recorded for agent run {0}")]
    ScoreExists(AgentRunId),

    /// Agent run was replaced by a retry and no longer accepts writes
    #[error("agent run {0} has been superseded")]
    Superseded(AgentRunId),

    /// Backend failure (lock poisoning, I/O, ...)
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Unrecognised rubric dimension code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown rubric dimension: {0}")]
pub struct UnknownDimension(pub String);
