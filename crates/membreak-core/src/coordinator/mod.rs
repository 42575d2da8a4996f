//! Dual-pool run coordinator.
//!
//! A run is driven in three stages:
//!
//! 1. **Prepare**: one agent run per kind, change checkout, prompt generation.
//! 2. **Provision**: adapter lookup, workspace isolation and detector choice
//!    per agent. Failures here error that agent only.
//! 3. **Fan out**: sessions run in the agent pool; each completed session is
//!    handed to the judge pool over an unbounded queue. The coordinator fans
//!    both pools back in, enforces the run timeout, then sweeps any agent run
//!    left non-terminal and settles the run status.
//!
//! Only one driver may hold a run at a time; see [`RunCoordinator::claim`].

mod cancel;
mod error;
mod pipeline;
mod service;

pub use cancel::{CancelHandle, CancelReason, CancelSignal};
pub use error::{CoordinatorError, CoordinatorResult};
pub use service::{CreateRunRequest, EvalService, RunStatusView, StartOutcome};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use membreak_state::{
    AgentFailure, AgentKind, AgentRunRecord, AgentRunStatus, FailureKind, RunId, RunPreparation,
    RunRecord, RunStateStore, RunStatus,
};

use crate::config::OrchestratorConfig;
use crate::judge::JudgeService;
use crate::metrics::METRICS;
use crate::obs;
use crate::pool::WorkerPool;
use crate::session::{AgentRegistry, PromptSet};
use crate::workspace::{
    fallback_prompts, prompt_hash, ChangeSource, DirectoryIsolator, LocalChangeSource,
    PromptSource, TemplatePromptSource, WorkspaceIsolator, FALLBACK_PROMPT_HASH,
};

use pipeline::{fail_agent, AgentJob, JudgeRequest, PipelineContext, TaskEnd};

type ActiveRuns = Arc<Mutex<HashMap<RunId, CancelHandle>>>;

/// Exclusive right to drive one run, released on drop.
pub struct RunClaim {
    run: RunRecord,
    cancel: CancelHandle,
    _guard: ActiveGuard,
}

impl RunClaim {
    pub fn run_id(&self) -> RunId {
        self.run.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

struct ActiveGuard {
    active: ActiveRuns,
    run_id: RunId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.active.lock() {
            map.remove(&self.run_id);
        }
    }
}

pub struct RunCoordinator {
    store: Arc<dyn RunStateStore>,
    registry: Arc<AgentRegistry>,
    changes: Arc<dyn ChangeSource>,
    isolator: Arc<dyn WorkspaceIsolator>,
    prompts: Arc<dyn PromptSource>,
    judges: Arc<JudgeService>,
    config: Arc<OrchestratorConfig>,
    active: ActiveRuns,
}

impl RunCoordinator {
    /// Coordinator over local collaborators: directory changes, copies under
    /// the system temp dir, templated prompts and the configured judge.
    pub fn new(
        store: Arc<dyn RunStateStore>,
        registry: AgentRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let judges = JudgeService::from_config(&config.judge);
        Self {
            store,
            registry: Arc::new(registry),
            changes: Arc::new(LocalChangeSource),
            isolator: Arc::new(DirectoryIsolator::new(default_workspace_root())),
            prompts: Arc::new(TemplatePromptSource),
            judges: Arc::new(judges),
            config: Arc::new(config),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_change_source(mut self, changes: Arc<dyn ChangeSource>) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_isolator(mut self, isolator: Arc<dyn WorkspaceIsolator>) -> Self {
        self.isolator = isolator;
        self
    }

    pub fn with_prompt_source(mut self, prompts: Arc<dyn PromptSource>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_judges(mut self, judges: JudgeService) -> Self {
        self.judges = Arc::new(judges);
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Cancel handle of a run currently being driven.
    pub fn active_handle(&self, run_id: &RunId) -> Option<CancelHandle> {
        self.active
            .lock()
            .ok()
            .and_then(|map| map.get(run_id).cloned())
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active_handle(run_id).is_some()
    }

    /// Take exclusive ownership of a `Queued` run. Returns `None` when the
    /// run is already being driven or is past `Queued`.
    pub async fn claim(&self, run_id: &RunId) -> CoordinatorResult<Option<RunClaim>> {
        let cancel = CancelHandle::new();
        {
            let mut map = self
                .active
                .lock()
                .map_err(|_| CoordinatorError::Execution("active-run registry poisoned".into()))?;
            if map.contains_key(run_id) {
                warn!(run_id = %run_id, "run already being driven; start ignored");
                return Ok(None);
            }
            map.insert(*run_id, cancel.clone());
        }
        // Registered before the status read so a concurrent claim cannot
        // observe the same `Queued` state.
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            run_id: *run_id,
        };

        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Queued {
            warn!(run_id = %run_id, status = run.status.as_str(), "run not queued; start ignored");
            return Ok(None);
        }
        Ok(Some(RunClaim {
            run,
            cancel,
            _guard: guard,
        }))
    }

    /// Claim and drive a run to a terminal status.
    pub async fn start(&self, run_id: &RunId) -> CoordinatorResult<StartOutcome> {
        match self.claim(run_id).await? {
            Some(claim) => {
                self.drive(claim).await?;
                Ok(StartOutcome::Accepted)
            }
            None => Ok(StartOutcome::AlreadyRunning),
        }
    }

    /// Drive a claimed run until every agent run is terminal.
    pub async fn drive(&self, claim: RunClaim) -> CoordinatorResult<RunRecord> {
        let span = obs::run_span(&claim.run.id.to_string());
        self.drive_inner(claim).instrument(span).await
    }

    async fn drive_inner(&self, claim: RunClaim) -> CoordinatorResult<RunRecord> {
        let started = Instant::now();
        let run_id = claim.run.id;
        let run = self
            .store
            .update_run_status(&run_id, RunStatus::Running, None)
            .await?;

        match self.drive_running(run, &claim.cancel, started).await {
            Ok(run) => Ok(run),
            Err(e) => {
                self.abort(&run_id, &e, started).await;
                Err(e)
            }
        }
    }

    async fn drive_running(
        &self,
        run: RunRecord,
        cancel: &CancelHandle,
        started: Instant,
    ) -> CoordinatorResult<RunRecord> {
        let run_id = run.id;
        let queued = self.ensure_agent_runs(&run).await?;
        obs::emit_run_started(&run_id.to_string(), queued.len());

        let (master, prompts) = match self.prepare(&run).await {
            Ok(prepared) => prepared,
            Err(message) => {
                for agent_run in &queued {
                    fail_agent(self.store.as_ref(), agent_run, FailureKind::Workspace, &message)
                        .await;
                }
                return self.finish(&run_id, Err(message), started).await;
            }
        };

        let mut jobs = Vec::with_capacity(queued.len());
        for agent_run in queued {
            if let Some(job) = self.provision(&master, agent_run).await {
                jobs.push(job);
            }
        }

        let ctx = Arc::new(PipelineContext {
            store: Arc::clone(&self.store),
            judges: Arc::clone(&self.judges),
            config: Arc::clone(&self.config),
            run: run.clone(),
            prompts,
        });
        self.fan_out(&ctx, jobs, cancel).await;

        let verdict = match cancel.reason() {
            Some(reason) => Err(reason.message().to_string()),
            None => Ok(()),
        };
        self.sweep(&run_id, cancel.reason()).await?;
        self.finish(&run_id, verdict, started).await
    }

    /// Best-effort settle after a store failure mid-drive, so the run never
    /// stays `Running` without a driver.
    async fn abort(&self, run_id: &RunId, error: &CoordinatorError, started: Instant) {
        let message = format!("run aborted: {error}");
        warn!(run_id = %run_id, error = %error, "run driver failed; settling run as error");

        let (mut done, mut total) = (0, 0);
        match self.store.list_agent_runs(run_id).await {
            Ok(agent_runs) => {
                total = agent_runs.len();
                done = agent_runs
                    .iter()
                    .filter(|a| a.status == AgentRunStatus::Done)
                    .count();
                for agent_run in agent_runs.iter().filter(|a| !a.status.is_terminal()) {
                    fail_agent(self.store.as_ref(), agent_run, FailureKind::Storage, &message)
                        .await;
                }
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "could not list agent runs to abort"),
        }

        if let Err(e) = self
            .store
            .update_run_status(run_id, RunStatus::Error, Some(message))
            .await
        {
            warn!(run_id = %run_id, error = %e, "could not record run failure");
        }
        obs::emit_run_finished(
            &run_id.to_string(),
            started.elapsed().as_millis() as u64,
            done,
            total,
            false,
        );
        METRICS.flush();
    }

    /// Active agent runs still `Queued`, creating any that are missing.
    /// Terminal agent runs are left alone; retries supersede them first.
    async fn ensure_agent_runs(&self, run: &RunRecord) -> CoordinatorResult<Vec<AgentRunRecord>> {
        let existing = self.store.list_agent_runs(&run.id).await?;
        let mut queued = Vec::new();
        for kind in &run.agent_kinds {
            match existing.iter().find(|a| &a.agent_kind == kind) {
                Some(agent_run) if agent_run.status == AgentRunStatus::Queued => {
                    queued.push(agent_run.clone());
                }
                Some(agent_run) => {
                    debug!(
                        agent_kind = %kind,
                        status = agent_run.status.as_str(),
                        "agent run already settled; skipping"
                    );
                }
                None => {
                    let agent_run = AgentRunRecord::new(run.id, kind.clone());
                    self.store.create_agent_run(agent_run.clone()).await?;
                    queued.push(agent_run);
                }
            }
        }
        Ok(queued)
    }

    /// Check out the change and build the shared prompt set. Prompt
    /// generation failures fall back to minimal prompts.
    async fn prepare(&self, run: &RunRecord) -> Result<(PathBuf, PromptSet), String> {
        let change = self
            .changes
            .clone_and_diff(&run.change_request)
            .await
            .map_err(|e| format!("failed to check out change: {e:#}"))?;

        let (prompts, hash) = match self.prompts.generate_prompts(&change, run.max_files).await {
            Ok(prompts) => {
                let hash = prompt_hash(&prompts);
                (prompts, hash)
            }
            Err(e) => {
                warn!(error = %e, "prompt generation failed; using fallback prompts");
                (
                    fallback_prompts(&run.change_request),
                    FALLBACK_PROMPT_HASH.to_string(),
                )
            }
        };

        let preparation = RunPreparation {
            changed_files: change.changed_files.clone(),
            prompt_hash: hash,
        };
        self.store
            .record_run_preparation(&run.id, preparation)
            .await
            .map_err(|e| format!("failed to record run preparation: {e}"))?;
        info!(files = change.changed_files.len(), "change prepared");
        Ok((change.workspace_path, prompts))
    }

    /// Resolve the adapter, isolate a workspace and pick the detector.
    /// Any failure errors this agent run only.
    async fn provision(
        &self,
        master: &std::path::Path,
        agent_run: AgentRunRecord,
    ) -> Option<AgentJob> {
        let store = self.store.as_ref();
        let registered = match self.registry.get(&agent_run.agent_kind) {
            Ok(registered) => registered.clone(),
            Err(e) => {
                fail_agent(store, &agent_run, FailureKind::NotFound, e.to_string()).await;
                return None;
            }
        };

        let workspace = match self
            .isolator
            .isolate(master, &agent_run.run_id, &agent_run.agent_kind)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                let message = format!("workspace isolation failed: {e:#}");
                fail_agent(store, &agent_run, FailureKind::Workspace, message).await;
                return None;
            }
        };
        if let Err(e) = store
            .append_artifact(&agent_run.id, "workspace", &workspace.to_string_lossy())
            .await
        {
            fail_agent(store, &agent_run, FailureKind::Storage, e.to_string()).await;
            return None;
        }

        Some(AgentJob {
            detector: registered.info.detector.build(&self.config.detection),
            adapter: registered.adapter,
            workspace,
            agent_run,
        })
    }

    async fn fan_out(
        &self,
        ctx: &Arc<PipelineContext>,
        jobs: Vec<AgentJob>,
        cancel: &CancelHandle,
    ) {
        if jobs.is_empty() {
            return;
        }
        let mut agents: WorkerPool<TaskEnd> = WorkerPool::new("agents", jobs.len());
        let mut judges: WorkerPool<TaskEnd> = WorkerPool::new("judges", jobs.len());
        debug!(
            agent_slots = agents.size(),
            judge_slots = judges.size(),
            "pools ready"
        );
        let (tx, mut rx) = mpsc::unbounded_channel::<JudgeRequest>();

        for job in jobs {
            agents.submit(pipeline::run_agent(
                Arc::clone(ctx),
                job,
                cancel.subscribe(),
                tx.clone(),
            ));
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.config.run_timeout());
        tokio::pin!(deadline);
        let mut rx_open = true;
        let mut timed_out = false;

        loop {
            if !rx_open && agents.is_empty() && judges.is_empty() {
                break;
            }
            tokio::select! {
                request = rx.recv(), if rx_open => match request {
                    Some(request) => {
                        if let Some(reason) = cancel.reason() {
                            fail_agent(
                                ctx.store.as_ref(),
                                &request.agent_run,
                                reason.failure_kind(),
                                reason.message(),
                            )
                            .await;
                        } else {
                            judges.submit(pipeline::run_judge(Arc::clone(ctx), request));
                        }
                    }
                    None => rx_open = false,
                },
                Some(joined) = agents.join_next(), if !agents.is_empty() => {
                    log_task_end(&agents, joined);
                }
                Some(joined) = judges.join_next(), if !judges.is_empty() => {
                    log_task_end(&judges, joined);
                }
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(
                        timeout = ?self.config.run_timeout(),
                        "run timeout exceeded; cancelling in-flight agents"
                    );
                    cancel.cancel(CancelReason::RunTimeout);
                }
            }
        }
    }

    /// Error every agent run the pipeline left non-terminal.
    async fn sweep(&self, run_id: &RunId, reason: Option<CancelReason>) -> CoordinatorResult<()> {
        let (kind, message) = match reason {
            Some(reason) => (reason.failure_kind(), reason.message().to_string()),
            None => (
                FailureKind::Execution,
                "pipeline ended without a verdict".to_string(),
            ),
        };
        for agent_run in self.store.list_agent_runs(run_id).await? {
            if agent_run.status.is_terminal() {
                continue;
            }
            let failure = AgentFailure::new(kind, message.clone());
            self.store
                .update_agent_status(&agent_run.id, AgentRunStatus::Error, Some(failure))
                .await?;
            obs::emit_agent_failed(
                &run_id.to_string(),
                agent_run.agent_kind.as_str(),
                kind.as_str(),
                &message,
            );
        }
        Ok(())
    }

    /// Settle the run: `Done` when at least one agent run finished,
    /// otherwise `Error`.
    async fn finish(
        &self,
        run_id: &RunId,
        verdict: Result<(), String>,
        started: Instant,
    ) -> CoordinatorResult<RunRecord> {
        let agent_runs = self.store.list_agent_runs(run_id).await?;
        let done = agent_runs
            .iter()
            .filter(|a| a.status == AgentRunStatus::Done)
            .count();

        let (status, message) = match verdict {
            Err(message) => (RunStatus::Error, Some(message)),
            Ok(()) if done > 0 => (RunStatus::Done, None),
            Ok(()) => (
                RunStatus::Error,
                Some("no agent run completed successfully".to_string()),
            ),
        };
        let run = self.store.update_run_status(run_id, status, message).await?;

        obs::emit_run_finished(
            &run_id.to_string(),
            started.elapsed().as_millis() as u64,
            done,
            agent_runs.len(),
            status == RunStatus::Done,
        );
        METRICS.flush();
        Ok(run)
    }
}

fn log_task_end(pool: &WorkerPool<TaskEnd>, joined: Result<TaskEnd, tokio::task::JoinError>) {
    let (name, busy, pending) = (pool.name(), pool.busy(), pool.len());
    match joined {
        Ok(end) => debug!(pool = name, busy, pending, outcome = ?end, "task finished"),
        Err(e) => warn!(pool = name, busy, pending, error = %e, "task did not complete"),
    }
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("membreak-workspaces")
}

/// Kinds in `kinds` that appear more than once.
pub(crate) fn duplicate_kinds(kinds: &[AgentKind]) -> Vec<AgentKind> {
    let mut seen = std::collections::BTreeSet::new();
    let mut dupes = Vec::new();
    for kind in kinds {
        if !seen.insert(kind) && !dupes.contains(kind) {
            dupes.push(kind.clone());
        }
    }
    dupes
}
