//! Storage trait definitions for evaluation runs
//!
//! `RunStateStore` is the single persistence seam for runs, agent runs and
//! scores. Implementations must enforce:
//! - forward-only status transitions (see `RunStatus::can_transition_to` and
//!   `AgentRunStatus::can_transition_to`)
//! - at most one active agent run per `(RunId, AgentKind)`
//! - immutable scores
//! - no writes to superseded agent runs
//!
//! An in-memory implementation lives in the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::schema::{
    AgentFailure, AgentRunId, AgentRunRecord, AgentRunStatus, AgentKind, Milestone, RunId,
    RunRecord, RunStatus, ScoreRecord,
};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Prompt preparation metadata captured when a run starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPreparation {
    pub changed_files: Vec<String>,
    pub prompt_hash: String,
}

/// Durable store for run, agent-run and score state.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    // -- runs ---------------------------------------------------------------

    /// Insert a new run. Fails with `DuplicateRun` if the id is taken.
    async fn create_run(&self, run: RunRecord) -> StoreResult<()>;

    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord>;

    /// Move a run forward. Sets `started_at` on `Running` and
    /// `completed_at` on terminal states.
    async fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error_message: Option<String>,
    ) -> StoreResult<RunRecord>;

    async fn record_run_preparation(
        &self,
        run_id: &RunId,
        preparation: RunPreparation,
    ) -> StoreResult<()>;

    /// Put a terminal run back to `Queued` so one agent can be re-executed.
    async fn reset_run_for_retry(&self, run_id: &RunId) -> StoreResult<RunRecord>;

    // -- agent runs ---------------------------------------------------------

    /// Insert a new agent run. Fails with `DuplicateAgentRun` when an active
    /// record for the same kind already exists.
    async fn create_agent_run(&self, agent_run: AgentRunRecord) -> StoreResult<()>;

    /// Mark `previous` as superseded and insert `replacement` atomically.
    async fn supersede_agent_run(
        &self,
        previous: &AgentRunId,
        replacement: AgentRunRecord,
    ) -> StoreResult<()>;

    async fn get_agent_run(&self, agent_run_id: &AgentRunId) -> StoreResult<AgentRunRecord>;

    /// Active (non-superseded) agent runs, in the run's agent-kind order.
    async fn list_agent_runs(&self, run_id: &RunId) -> StoreResult<Vec<AgentRunRecord>>;

    /// Every agent run ever created for a kind, oldest first.
    async fn agent_run_history(
        &self,
        run_id: &RunId,
        agent_kind: &AgentKind,
    ) -> StoreResult<Vec<AgentRunRecord>>;

    /// Move an agent run forward; `failure` is recorded on `Error`.
    async fn update_agent_status(
        &self,
        agent_run_id: &AgentRunId,
        status: AgentRunStatus,
        failure: Option<AgentFailure>,
    ) -> StoreResult<AgentRunRecord>;

    async fn append_milestone(
        &self,
        agent_run_id: &AgentRunId,
        milestone: Milestone,
    ) -> StoreResult<()>;

    async fn append_artifact(
        &self,
        agent_run_id: &AgentRunId,
        name: &str,
        location: &str,
    ) -> StoreResult<()>;

    async fn merge_stats(
        &self,
        agent_run_id: &AgentRunId,
        stats: BTreeMap<String, serde_json::Value>,
    ) -> StoreResult<()>;

    // -- scores -------------------------------------------------------------

    /// Persist a score. Fails with `ScoreExists` on a second write.
    async fn put_score(&self, score: ScoreRecord) -> StoreResult<()>;

    async fn get_score(&self, agent_run_id: &AgentRunId) -> StoreResult<Option<ScoreRecord>>;
}
