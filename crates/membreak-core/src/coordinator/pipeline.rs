//! Per-agent work units: the agent-pool task that runs one session and the
//! judge-pool task that scores it.
//!
//! Every outcome is written to the agent run; nothing here returns an error
//! to the coordinator.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use membreak_state::{
    AgentFailure, AgentRunId, AgentRunRecord, AgentRunStatus, FailureKind, Milestone, RunRecord,
    RunStateStore,
};

use super::cancel::{CancelReason, CancelSignal};
use crate::config::OrchestratorConfig;
use crate::detector::{CompressionDetector, DetectionResult};
use crate::judge::{JudgeInput, JudgeService};
use crate::metrics::METRICS;
use crate::obs;
use crate::scoring::apply_thresholds;
use crate::session::{
    AgentAdapter, ProtocolObserver, ProtocolRunner, PromptSet, SessionError, SessionOutcome,
    SessionResult,
};

/// State shared by every task of one run.
pub(crate) struct PipelineContext {
    pub store: Arc<dyn RunStateStore>,
    pub judges: Arc<JudgeService>,
    pub config: Arc<OrchestratorConfig>,
    pub run: RunRecord,
    pub prompts: PromptSet,
}

/// One provisioned agent ready for the agent pool.
pub(crate) struct AgentJob {
    pub agent_run: AgentRunRecord,
    pub workspace: PathBuf,
    pub adapter: Arc<dyn AgentAdapter>,
    pub detector: Arc<dyn CompressionDetector>,
}

/// Completed session handed from the agent pool to the judge pool.
pub(crate) struct JudgeRequest {
    pub agent_run: AgentRunRecord,
    pub outcome: SessionOutcome,
}

/// How one pool task ended, for fan-in logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskEnd {
    /// Session finished and was queued for judging.
    Dispatched,
    Judged,
    Failed(FailureKind),
}

/// Record a terminal failure on an agent run, tolerating one that already
/// ended.
pub(crate) async fn fail_agent(
    store: &dyn RunStateStore,
    agent_run: &AgentRunRecord,
    kind: FailureKind,
    message: impl Into<String>,
) {
    let message = message.into();
    obs::emit_agent_failed(
        &agent_run.run_id.to_string(),
        agent_run.agent_kind.as_str(),
        kind.as_str(),
        &message,
    );
    let failure = AgentFailure::new(kind, message);
    if let Err(e) = store
        .update_agent_status(&agent_run.id, AgentRunStatus::Error, Some(failure))
        .await
    {
        warn!(agent_run_id = %agent_run.id, error = %e, "could not record agent failure");
    }
}

async fn transition(
    store: &dyn RunStateStore,
    agent_run: &AgentRunRecord,
    status: AgentRunStatus,
) -> SessionResult<()> {
    store.update_agent_status(&agent_run.id, status, None).await?;
    obs::emit_agent_transition(
        &agent_run.run_id.to_string(),
        agent_run.agent_kind.as_str(),
        status.as_str(),
    );
    Ok(())
}

/// Persists protocol progress onto the agent run.
struct StoreObserver<'a> {
    store: &'a dyn RunStateStore,
    agent_run: &'a AgentRunRecord,
}

#[async_trait]
impl ProtocolObserver for StoreObserver<'_> {
    async fn milestone(&self, name: &str) -> SessionResult<()> {
        self.store
            .append_milestone(&self.agent_run.id, Milestone::now(name))
            .await?;
        Ok(())
    }

    async fn memory_only(
        &self,
        detection: &DetectionResult,
        iteration: u32,
        forced: bool,
    ) -> SessionResult<()> {
        transition(self.store, self.agent_run, AgentRunStatus::MemoryOnly).await?;
        let name = if forced {
            "deep_dive_cap_reached"
        } else {
            "compression_detected"
        };
        self.milestone(name).await?;
        obs::emit_compression_detected(
            &self.agent_run.run_id.to_string(),
            self.agent_run.agent_kind.as_str(),
            detection.method.map(|m| m.as_str()).unwrap_or("unknown"),
            iteration,
            forced,
        );
        Ok(())
    }
}

/// Open the session and run the protocol under one session deadline,
/// racing run cancellation. An opened session always gets `cancel_grace`
/// to close.
async fn execute_session(
    ctx: &PipelineContext,
    job: &AgentJob,
    cancel: &mut CancelSignal,
) -> SessionResult<SessionOutcome> {
    let limit = ctx.config.session_timeout();
    let deadline = tokio::time::Instant::now() + limit;

    let mut session = tokio::select! {
        opened = tokio::time::timeout_at(deadline, job.adapter.open(&job.workspace)) => {
            opened.map_err(|_| SessionError::Timeout(limit))??
        }
        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
    };

    let runner = ProtocolRunner::new(
        Arc::clone(&job.detector),
        ctx.config.max_deep_dive_iterations,
        ctx.config.detection.chars_per_token,
    );
    let observer = StoreObserver {
        store: ctx.store.as_ref(),
        agent_run: &job.agent_run,
    };

    let result = {
        let protocol = runner.run(session.as_mut(), &ctx.prompts, &observer);
        tokio::pin!(protocol);
        tokio::select! {
            finished = tokio::time::timeout_at(deadline, &mut protocol) => {
                finished.unwrap_or(Err(SessionError::Timeout(limit)))
            }
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        }
    };

    if tokio::time::timeout(ctx.config.cancel_grace(), session.close())
        .await
        .is_err()
    {
        warn!(
            agent_kind = %job.agent_run.agent_kind,
            "session did not close within grace period; dropping it"
        );
    }
    result
}

/// Agent-pool task: run one session, record its results, hand it to judging.
pub(crate) async fn run_agent(
    ctx: Arc<PipelineContext>,
    job: AgentJob,
    mut cancel: CancelSignal,
    judge_tx: UnboundedSender<JudgeRequest>,
) -> TaskEnd {
    let store = ctx.store.as_ref();
    let agent_run = &job.agent_run;

    if let Some(reason) = cancel.reason() {
        fail_agent(store, agent_run, reason.failure_kind(), reason.message()).await;
        return TaskEnd::Failed(reason.failure_kind());
    }
    if let Err(e) = transition(store, agent_run, AgentRunStatus::Running).await {
        fail_agent(store, agent_run, e.failure_kind(), e.to_string()).await;
        return TaskEnd::Failed(e.failure_kind());
    }
    METRICS.inc_sessions_started();

    let outcome = match execute_session(&ctx, &job, &mut cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            METRICS.inc_sessions_failed();
            let (kind, message) = match e {
                SessionError::Cancelled => {
                    let reason = cancel.reason().unwrap_or(CancelReason::Requested);
                    (reason.failure_kind(), reason.message().to_string())
                }
                other => (other.failure_kind(), other.to_string()),
            };
            fail_agent(store, agent_run, kind, message).await;
            return TaskEnd::Failed(kind);
        }
    };

    if let Err(e) = record_session(store, &job.agent_run.id, &outcome).await {
        fail_agent(store, agent_run, e.failure_kind(), e.to_string()).await;
        return TaskEnd::Failed(e.failure_kind());
    }

    debug!(agent_kind = %agent_run.agent_kind, "session complete; dispatching to judge pool");
    let request = JudgeRequest {
        agent_run: job.agent_run.clone(),
        outcome,
    };
    if judge_tx.send(request).is_err() {
        fail_agent(
            store,
            agent_run,
            FailureKind::Execution,
            "judge pool closed before dispatch",
        )
        .await;
        return TaskEnd::Failed(FailureKind::Execution);
    }
    TaskEnd::Dispatched
}

async fn record_session(
    store: &dyn RunStateStore,
    id: &AgentRunId,
    outcome: &SessionOutcome,
) -> SessionResult<()> {
    for (name, location) in &outcome.artifacts {
        store.append_artifact(id, name, location).await?;
    }
    store.merge_stats(id, outcome.stats()).await?;
    store
        .append_milestone(id, Milestone::now("session_complete"))
        .await?;
    Ok(())
}

/// Judge-pool task: Evaluating, score, persist, Done.
pub(crate) async fn run_judge(ctx: Arc<PipelineContext>, request: JudgeRequest) -> TaskEnd {
    let store = ctx.store.as_ref();
    let agent_run = &request.agent_run;

    if let Err(e) = transition(store, agent_run, AgentRunStatus::Evaluating).await {
        fail_agent(store, agent_run, e.failure_kind(), e.to_string()).await;
        return TaskEnd::Failed(e.failure_kind());
    }

    let input = JudgeInput {
        questions: request.outcome.questions(),
        pre_answers: request.outcome.pre_answers(),
        post_answers: request.outcome.post_answers(),
        rubric: ctx.run.rubric.clone(),
    };
    let output = ctx.judges.evaluate(&input).await;
    let judge = output.judge_kind;
    let verdict = apply_thresholds(&output.scores, &ctx.run.thresholds);
    let score = verdict.into_score(
        agent_run,
        output.judge_kind,
        output.judge_model,
        output.rationale,
    );
    let (aggregate, passed) = (score.aggregate, score.passed);

    let persisted: SessionResult<()> = async {
        store.put_score(score).await?;
        store
            .append_milestone(&agent_run.id, Milestone::now("judged"))
            .await?;
        transition(store, agent_run, AgentRunStatus::Done).await
    }
    .await;

    if let Err(e) = persisted {
        fail_agent(store, agent_run, FailureKind::Storage, e.to_string()).await;
        return TaskEnd::Failed(FailureKind::Storage);
    }
    METRICS.inc_scores_recorded();
    obs::emit_agent_judged(
        &agent_run.run_id.to_string(),
        agent_run.agent_kind.as_str(),
        aggregate,
        passed,
        judge.as_str(),
    );
    TaskEnd::Judged
}
