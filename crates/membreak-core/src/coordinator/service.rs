//! Caller-facing surface: create, start, inspect, retry and cancel runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use membreak_state::{
    AgentFailure, AgentKind, AgentRunId, AgentRunRecord, AgentRunStatus, FailureKind,
    RubricDimension, RubricThresholds, RunId, RunRecord, RunStatus, ScoreRecord,
};

use super::{duplicate_kinds, CancelReason, CoordinatorError, CoordinatorResult, RunCoordinator};

/// Whether a start request took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Accepted,
    /// Another driver holds the run, or it is already past `Queued`.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub change_request: String,
    pub agent_kinds: Vec<AgentKind>,
    pub rubric: Vec<RubricDimension>,
    #[serde(default)]
    pub thresholds: RubricThresholds,
    #[serde(default)]
    pub max_files: Option<usize>,
}

impl CreateRunRequest {
    /// Request over every rubric dimension with default thresholds.
    pub fn new(change_request: impl Into<String>, agent_kinds: Vec<AgentKind>) -> Self {
        Self {
            change_request: change_request.into(),
            agent_kinds,
            rubric: RubricDimension::ALL.to_vec(),
            thresholds: RubricThresholds::default(),
            max_files: None,
        }
    }

    pub fn with_rubric(mut self, rubric: Vec<RubricDimension>) -> Self {
        self.rubric = rubric;
        self
    }

    pub fn with_thresholds(mut self, thresholds: RubricThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    fn validate(&self) -> CoordinatorResult<()> {
        if self.change_request.trim().is_empty() {
            return Err(CoordinatorError::Validation(
                "change_request must not be empty".into(),
            ));
        }
        if self.agent_kinds.is_empty() {
            return Err(CoordinatorError::Validation(
                "at least one agent kind is required".into(),
            ));
        }
        if let Some(kind) = self.agent_kinds.iter().find(|k| k.as_str().is_empty()) {
            return Err(CoordinatorError::Validation(format!(
                "agent kind {kind:?} is blank"
            )));
        }
        let dupes = duplicate_kinds(&self.agent_kinds);
        if !dupes.is_empty() {
            let names: Vec<&str> = dupes.iter().map(AgentKind::as_str).collect();
            return Err(CoordinatorError::Validation(format!(
                "duplicate agent kinds: {}",
                names.join(", ")
            )));
        }
        if self.rubric.is_empty() {
            return Err(CoordinatorError::Validation(
                "rubric must name at least one dimension".into(),
            ));
        }
        for (dim, value) in self.thresholds.explicit() {
            if !(0.0..=1.0).contains(value) {
                return Err(CoordinatorError::Validation(format!(
                    "threshold for {dim} must be within 0..=1, got {value}"
                )));
            }
        }
        if self.max_files == Some(0) {
            return Err(CoordinatorError::Validation(
                "max_files must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of a run, its active agent runs and their scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run: RunRecord,
    pub agent_runs: Vec<AgentRunRecord>,
    pub scores: BTreeMap<AgentRunId, ScoreRecord>,
}

impl RunStatusView {
    pub fn agent_run(&self, kind: &str) -> Option<&AgentRunRecord> {
        let kind = AgentKind::new(kind);
        self.agent_runs.iter().find(|a| a.agent_kind == kind)
    }

    pub fn score_for(&self, kind: &str) -> Option<&ScoreRecord> {
        self.agent_run(kind).and_then(|a| self.scores.get(&a.id))
    }
}

/// Run lifecycle operations over a shared [`RunCoordinator`].
#[derive(Clone)]
pub struct EvalService {
    coordinator: Arc<RunCoordinator>,
}

impl EvalService {
    pub fn new(coordinator: RunCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    /// Validate and persist a `Queued` run. Nothing is written on a
    /// validation failure.
    pub async fn create_run(&self, request: CreateRunRequest) -> CoordinatorResult<RunRecord> {
        request.validate()?;
        let config = self.coordinator.config();
        let run = RunRecord::new(request.change_request, request.agent_kinds, request.rubric)
            .with_thresholds(request.thresholds)
            .with_max_files(request.max_files.unwrap_or(config.max_files));
        self.coordinator.store().create_run(run.clone()).await?;
        info!(run_id = %run.id, agents = run.agent_kinds.len(), "run created");
        Ok(run)
    }

    /// Begin driving a run in the background.
    pub async fn start_run(&self, run_id: &RunId) -> CoordinatorResult<StartOutcome> {
        match self.coordinator.claim(run_id).await? {
            Some(claim) => {
                let coordinator = Arc::clone(&self.coordinator);
                tokio::spawn(async move {
                    let run_id = claim.run_id();
                    if let Err(e) = coordinator.drive(claim).await {
                        warn!(run_id = %run_id, error = %e, "run driver failed");
                    }
                });
                Ok(StartOutcome::Accepted)
            }
            None => Ok(StartOutcome::AlreadyRunning),
        }
    }

    /// Drive a run on a dedicated task and wait for it to settle.
    pub async fn run_to_completion(&self, run_id: &RunId) -> CoordinatorResult<RunRecord> {
        let Some(claim) = self.coordinator.claim(run_id).await? else {
            return Err(CoordinatorError::InvalidState(format!(
                "run {run_id} is already running or finished"
            )));
        };
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move { coordinator.drive(claim).await })
            .await
            .map_err(|e| CoordinatorError::Execution(format!("run driver aborted: {e}")))?
    }

    pub async fn get_run_status(&self, run_id: &RunId) -> CoordinatorResult<RunStatusView> {
        let store = self.coordinator.store();
        let mut run = store.get_run(run_id).await?;
        let agent_runs = store.list_agent_runs(run_id).await?;
        let mut scores = BTreeMap::new();
        for agent_run in &agent_runs {
            if let Some(score) = store.get_score(&agent_run.id).await? {
                scores.insert(agent_run.id, score);
            }
        }
        if is_judging(run.status, &agent_runs) {
            run.status = RunStatus::Judging;
        }
        Ok(RunStatusView {
            run,
            agent_runs,
            scores,
        })
    }

    /// Re-execute one agent of a finished run. The previous agent run is
    /// kept as superseded history.
    pub async fn retry_agent(
        &self,
        run_id: &RunId,
        agent_kind: &str,
    ) -> CoordinatorResult<AgentRunRecord> {
        let kind = AgentKind::new(agent_kind);
        let store = self.coordinator.store();
        let run = store.get_run(run_id).await?;
        if !run.agent_kinds.contains(&kind) {
            return Err(CoordinatorError::NotFound(format!(
                "agent kind {kind} in run {run_id}"
            )));
        }
        if !run.status.is_terminal() || self.coordinator.is_active(run_id) {
            return Err(CoordinatorError::InvalidState(format!(
                "run {run_id} is {}; only finished runs can be retried",
                run.status.as_str()
            )));
        }
        let previous = store
            .list_agent_runs(run_id)
            .await?
            .into_iter()
            .find(|a| a.agent_kind == kind)
            .ok_or_else(|| CoordinatorError::NotFound(format!("agent run for {kind}")))?;
        if !matches!(previous.status, AgentRunStatus::Done | AgentRunStatus::Error) {
            return Err(CoordinatorError::InvalidState(format!(
                "agent run for {kind} is {}",
                previous.status.as_str()
            )));
        }

        let replacement = AgentRunRecord::retry_of(&previous);
        store
            .supersede_agent_run(&previous.id, replacement.clone())
            .await?;
        store.reset_run_for_retry(run_id).await?;
        info!(
            run_id = %run_id,
            agent_kind = %kind,
            retry = replacement.retry_count,
            "retrying agent"
        );

        match self.start_run(run_id).await? {
            StartOutcome::Accepted => Ok(replacement),
            StartOutcome::AlreadyRunning => Err(CoordinatorError::InvalidState(format!(
                "run {run_id} was claimed by another driver"
            ))),
        }
    }

    /// Stop a run. In-flight agents end `Error` with "cancelled"; a queued
    /// run is errored directly; a finished run is left untouched.
    pub async fn cancel_run(&self, run_id: &RunId) -> CoordinatorResult<()> {
        if let Some(handle) = self.coordinator.active_handle(run_id) {
            if handle.cancel(CancelReason::Requested) {
                info!(run_id = %run_id, "cancellation requested");
            }
            return Ok(());
        }

        let store = self.coordinator.store();
        let run = store.get_run(run_id).await?;
        match run.status {
            RunStatus::Queued => {
                for agent_run in store.list_agent_runs(run_id).await? {
                    if agent_run.status.is_terminal() {
                        continue;
                    }
                    let failure = AgentFailure::new(
                        FailureKind::Cancelled,
                        CancelReason::Requested.message(),
                    );
                    store
                        .update_agent_status(&agent_run.id, AgentRunStatus::Error, Some(failure))
                        .await?;
                }
                store
                    .update_run_status(
                        run_id,
                        RunStatus::Error,
                        Some(CancelReason::Requested.message().to_string()),
                    )
                    .await?;
                info!(run_id = %run_id, "queued run cancelled");
            }
            status if status.is_terminal() => {
                info!(
                    run_id = %run_id,
                    status = status.as_str(),
                    "run already finished; cancel ignored"
                );
            }
            status => {
                // Non-terminal but no driver: nothing to signal.
                warn!(
                    run_id = %run_id,
                    status = status.as_str(),
                    "run has no active driver; cancel ignored"
                );
            }
        }
        Ok(())
    }

    /// Poll until the run is terminal.
    pub async fn wait_for_completion(
        &self,
        run_id: &RunId,
        poll: Duration,
        timeout: Duration,
    ) -> CoordinatorResult<RunStatusView> {
        let wait = async {
            loop {
                let view = self.get_run_status(run_id).await?;
                if view.run.status.is_terminal() && !self.coordinator.is_active(run_id) {
                    return Ok(view);
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CoordinatorError::Timeout(timeout))?
    }
}

/// Sessions are over and at least one agent is still being scored.
fn is_judging(status: RunStatus, agent_runs: &[AgentRunRecord]) -> bool {
    status == RunStatus::Running
        && agent_runs.iter().any(|a| a.status == AgentRunStatus::Evaluating)
        && agent_runs.iter().all(|a| {
            matches!(
                a.status,
                AgentRunStatus::Evaluating | AgentRunStatus::Done | AgentRunStatus::Error
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(status: AgentRunStatus) -> AgentRunRecord {
        let mut a = AgentRunRecord::new(RunId::new(), AgentKind::new("claude"));
        a.status = status;
        a
    }

    #[test]
    fn test_judging_requires_all_sessions_finished() {
        let runs = vec![agent(AgentRunStatus::Evaluating), agent(AgentRunStatus::Done)];
        assert!(is_judging(RunStatus::Running, &runs));

        let runs = vec![agent(AgentRunStatus::Evaluating), agent(AgentRunStatus::Running)];
        assert!(!is_judging(RunStatus::Running, &runs));

        let runs = vec![agent(AgentRunStatus::Done), agent(AgentRunStatus::Error)];
        assert!(!is_judging(RunStatus::Running, &runs));
    }

    #[test]
    fn test_validation_rejects_bad_requests() {
        let kinds = vec![AgentKind::new("claude")];
        assert!(CreateRunRequest::new("pr-1", kinds.clone()).validate().is_ok());
        assert!(CreateRunRequest::new("pr-1", vec![]).validate().is_err());
        assert!(CreateRunRequest::new("pr-1", kinds.clone())
            .with_rubric(vec![])
            .validate()
            .is_err());
        let bad = RubricThresholds::new().with(RubricDimension::AccurateRetrieval, 1.5);
        assert!(CreateRunRequest::new("pr-1", kinds).with_thresholds(bad).validate().is_err());
        let dupes = vec![AgentKind::new("gemini"), AgentKind::new("GEMINI")];
        assert!(matches!(
            CreateRunRequest::new("pr-1", dupes).validate(),
            Err(CoordinatorError::Validation(_))
        ));
    }
}
