//! In-memory `RunStateStore` for tests and single-process use.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StoreError;
use crate::schema::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<RunId, RunRecord>,
    agent_runs: HashMap<AgentRunId, AgentRunRecord>,
    /// Creation order per run, including superseded records.
    order: HashMap<RunId, Vec<AgentRunId>>,
    scores: HashMap<AgentRunId, ScoreRecord>,
}

impl Inner {
    fn run_mut(&mut self, run_id: &RunId) -> StoreResult<&mut RunRecord> {
        self.runs
            .get_mut(run_id)
            .ok_or(StoreError::RunNotFound(*run_id))
    }

    fn agent_run_mut(&mut self, id: &AgentRunId) -> StoreResult<&mut AgentRunRecord> {
        let record = self
            .agent_runs
            .get_mut(id)
            .ok_or(StoreError::AgentRunNotFound(*id))?;
        if record.superseded {
            return Err(StoreError::Superseded(*id));
        }
        Ok(record)
    }

    fn active_for_kind(&self, run_id: &RunId, kind: &AgentKind) -> Option<&AgentRunRecord> {
        self.order.get(run_id)?.iter().find_map(|id| {
            self.agent_runs
                .get(id)
                .filter(|r| !r.superseded && &r.agent_kind == kind)
        })
    }

    fn insert_agent_run(&mut self, agent_run: AgentRunRecord) -> StoreResult<()> {
        if !self.runs.contains_key(&agent_run.run_id) {
            return Err(StoreError::RunNotFound(agent_run.run_id));
        }
        if self
            .active_for_kind(&agent_run.run_id, &agent_run.agent_kind)
            .is_some()
        {
            return Err(StoreError::DuplicateAgentRun {
                run_id: agent_run.run_id,
                agent_kind: agent_run.agent_kind.clone(),
            });
        }
        self.order
            .entry(agent_run.run_id)
            .or_default()
            .push(agent_run.id);
        self.agent_runs.insert(agent_run.id, agent_run);
        Ok(())
    }
}

/// In-memory run state store backed by a single mutex-guarded table set.
#[derive(Debug, Default)]
pub struct MemoryRunStateStore {
    inner: Mutex<Inner>,
}

impl MemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("state lock poisoned: {e}")))
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn create_run(&self, run: RunRecord) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::DuplicateRun(run.id));
        }
        inner.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord> {
        let inner = self.lock()?;
        inner
            .runs
            .get(run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(*run_id))
    }

    async fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error_message: Option<String>,
    ) -> StoreResult<RunRecord> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        if !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "run",
                from: run.status.to_string(),
                to: status.to_string(),
            });
        }
        let now = Utc::now();
        run.status = status;
        run.updated_at = now;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.completed_at = Some(now);
        }
        if error_message.is_some() {
            run.error_message = error_message;
        }
        Ok(run.clone())
    }

    async fn record_run_preparation(
        &self,
        run_id: &RunId,
        preparation: RunPreparation,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        run.changed_files = preparation.changed_files;
        run.prompt_hash = Some(preparation.prompt_hash);
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_run_for_retry(&self, run_id: &RunId) -> StoreResult<RunRecord> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        if !run.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                entity: "run",
                from: run.status.to_string(),
                to: RunStatus::Queued.to_string(),
            });
        }
        run.status = RunStatus::Queued;
        run.completed_at = None;
        run.error_message = None;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn create_agent_run(&self, agent_run: AgentRunRecord) -> StoreResult<()> {
        self.lock()?.insert_agent_run(agent_run)
    }

    async fn supersede_agent_run(
        &self,
        previous: &AgentRunId,
        replacement: AgentRunRecord,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let old = inner.agent_run_mut(previous)?;
        if old.agent_kind != replacement.agent_kind || old.run_id != replacement.run_id {
            return Err(StoreError::Backend(format!(
                "replacement for {previous} targets a different run or kind"
            )));
        }
        old.superseded = true;
        old.updated_at = Utc::now();
        if let Err(e) = inner.insert_agent_run(replacement) {
            // Restore so a failed retry leaves the old record active.
            if let Some(old) = inner.agent_runs.get_mut(previous) {
                old.superseded = false;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn get_agent_run(&self, agent_run_id: &AgentRunId) -> StoreResult<AgentRunRecord> {
        let inner = self.lock()?;
        inner
            .agent_runs
            .get(agent_run_id)
            .cloned()
            .ok_or(StoreError::AgentRunNotFound(*agent_run_id))
    }

    async fn list_agent_runs(&self, run_id: &RunId) -> StoreResult<Vec<AgentRunRecord>> {
        let inner = self.lock()?;
        let run = inner
            .runs
            .get(run_id)
            .ok_or(StoreError::RunNotFound(*run_id))?;
        Ok(run
            .agent_kinds
            .iter()
            .filter_map(|kind| inner.active_for_kind(run_id, kind).cloned())
            .collect())
    }

    async fn agent_run_history(
        &self,
        run_id: &RunId,
        agent_kind: &AgentKind,
    ) -> StoreResult<Vec<AgentRunRecord>> {
        let inner = self.lock()?;
        if !inner.runs.contains_key(run_id) {
            return Err(StoreError::RunNotFound(*run_id));
        }
        Ok(inner
            .order
            .get(run_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agent_runs.get(id))
                    .filter(|r| &r.agent_kind == agent_kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_agent_status(
        &self,
        agent_run_id: &AgentRunId,
        status: AgentRunStatus,
        failure: Option<AgentFailure>,
    ) -> StoreResult<AgentRunRecord> {
        let mut inner = self.lock()?;
        let record = inner.agent_run_mut(agent_run_id)?;
        if !record.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "agent_run",
                from: record.status.to_string(),
                to: status.to_string(),
            });
        }
        let now = Utc::now();
        record.status = status;
        record.updated_at = now;
        if status == AgentRunStatus::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if status.is_terminal() {
            record.completed_at = Some(now);
        }
        if let Some(failure) = failure {
            record.failure = Some(failure.kind);
            record.error_message = Some(failure.message);
        }
        Ok(record.clone())
    }

    async fn append_milestone(
        &self,
        agent_run_id: &AgentRunId,
        milestone: Milestone,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let record = inner.agent_run_mut(agent_run_id)?;
        record.milestones.push(milestone);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn append_artifact(
        &self,
        agent_run_id: &AgentRunId,
        name: &str,
        location: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let record = inner.agent_run_mut(agent_run_id)?;
        record
            .artifacts
            .insert(name.to_string(), location.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn merge_stats(
        &self,
        agent_run_id: &AgentRunId,
        stats: BTreeMap<String, serde_json::Value>,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let record = inner.agent_run_mut(agent_run_id)?;
        record.stats.extend(stats);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn put_score(&self, score: ScoreRecord) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.agent_run_mut(&score.agent_run_id)?;
        if inner.scores.contains_key(&score.agent_run_id) {
            return Err(StoreError::ScoreExists(score.agent_run_id));
        }
        inner.scores.insert(score.agent_run_id, score);
        Ok(())
    }

    async fn get_score(&self, agent_run_id: &AgentRunId) -> StoreResult<Option<ScoreRecord>> {
        let inner = self.lock()?;
        Ok(inner.scores.get(agent_run_id).cloned())
    }
}
