//! Contract tests for RunStateStore.
//!
//! Exercised against the in-memory store; any conforming backend must pass.

use std::collections::BTreeMap;

use chrono::Utc;
use membreak_state::fakes::MemoryRunStateStore;
use membreak_state::*;

fn sample_run(kinds: &[&str]) -> RunRecord {
    RunRecord::new(
        "https://example.com/acme/widgets/pull/7",
        kinds.iter().map(|k| AgentKind::new(k)).collect(),
        RubricDimension::ALL.to_vec(),
    )
}

fn sample_score(agent: &AgentRunRecord) -> ScoreRecord {
    ScoreRecord {
        agent_run_id: agent.id,
        run_id: agent.run_id,
        agent_kind: agent.agent_kind.clone(),
        scores: BTreeMap::from([(RubricDimension::AccurateRetrieval, 0.8)]),
        aggregate: 0.8,
        thresholds: RubricThresholds::default(),
        breaking_dimensions: vec![],
        breaking_details: BTreeMap::new(),
        passed: true,
        judge_kind: JudgeKind::Heuristic,
        judge_model: None,
        rationale: "ok".into(),
        created_at: Utc::now(),
    }
}

async fn seeded(kinds: &[&str]) -> (MemoryRunStateStore, RunRecord) {
    let store = MemoryRunStateStore::new();
    let run = sample_run(kinds);
    store.create_run(run.clone()).await.unwrap();
    (store, run)
}

// ===========================================================================
// Runs
// ===========================================================================

#[tokio::test]
async fn create_and_get_run() {
    let (store, run) = seeded(&["claude"]).await;
    let fetched = store.get_run(&run.id).await.unwrap();
    assert_eq!(fetched.status, RunStatus::Queued);
    assert_eq!(fetched.agent_kinds, vec![AgentKind::new("claude")]);
}

#[tokio::test]
async fn duplicate_run_rejected() {
    let (store, run) = seeded(&["claude"]).await;
    let err = store.create_run(run.clone()).await.unwrap_err();
    assert_eq!(err, StoreError::DuplicateRun(run.id));
}

#[tokio::test]
async fn unknown_run_not_found() {
    let store = MemoryRunStateStore::new();
    let id = RunId::new();
    assert_eq!(
        store.get_run(&id).await.unwrap_err(),
        StoreError::RunNotFound(id)
    );
}

#[tokio::test]
async fn run_status_sets_timestamps() {
    let (store, run) = seeded(&["claude"]).await;
    let running = store
        .update_run_status(&run.id, RunStatus::Running, None)
        .await
        .unwrap();
    assert!(running.started_at.is_some());
    assert!(running.completed_at.is_none());

    let done = store
        .update_run_status(&run.id, RunStatus::Done, None)
        .await
        .unwrap();
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn run_status_cannot_regress() {
    let (store, run) = seeded(&["claude"]).await;
    store
        .update_run_status(&run.id, RunStatus::Running, None)
        .await
        .unwrap();
    let err = store
        .update_run_status(&run.id, RunStatus::Queued, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { entity: "run", .. }));
}

#[tokio::test]
async fn reset_for_retry_requires_terminal_run() {
    let (store, run) = seeded(&["claude"]).await;
    assert!(store.reset_run_for_retry(&run.id).await.is_err());

    store
        .update_run_status(&run.id, RunStatus::Error, Some("boom".into()))
        .await
        .unwrap();
    let reset = store.reset_run_for_retry(&run.id).await.unwrap();
    assert_eq!(reset.status, RunStatus::Queued);
    assert!(reset.error_message.is_none());
}

#[tokio::test]
async fn preparation_is_recorded() {
    let (store, run) = seeded(&["claude"]).await;
    store
        .record_run_preparation(
            &run.id,
            RunPreparation {
                changed_files: vec!["src/lib.rs".into()],
                prompt_hash: "abc".into(),
            },
        )
        .await
        .unwrap();
    let run = store.get_run(&run.id).await.unwrap();
    assert_eq!(run.changed_files, vec!["src/lib.rs".to_string()]);
    assert_eq!(run.prompt_hash.as_deref(), Some("abc"));
}

// ===========================================================================
// Agent runs
// ===========================================================================

#[tokio::test]
async fn one_active_agent_run_per_kind() {
    let (store, run) = seeded(&["claude"]).await;
    let first = AgentRunRecord::new(run.id, AgentKind::new("claude"));
    store.create_agent_run(first).await.unwrap();

    let second = AgentRunRecord::new(run.id, AgentKind::new("claude"));
    let err = store.create_agent_run(second).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateAgentRun { .. }));
}

#[tokio::test]
async fn list_follows_run_kind_order() {
    let (store, run) = seeded(&["gemini", "claude"]).await;
    store
        .create_agent_run(AgentRunRecord::new(run.id, AgentKind::new("claude")))
        .await
        .unwrap();
    store
        .create_agent_run(AgentRunRecord::new(run.id, AgentKind::new("gemini")))
        .await
        .unwrap();

    let kinds: Vec<_> = store
        .list_agent_runs(&run.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.agent_kind.to_string())
        .collect();
    assert_eq!(kinds, vec!["gemini", "claude"]);
}

#[tokio::test]
async fn agent_status_walks_forward() {
    let (store, run) = seeded(&["claude"]).await;
    let agent = AgentRunRecord::new(run.id, AgentKind::new("claude"));
    store.create_agent_run(agent.clone()).await.unwrap();

    for status in [
        AgentRunStatus::Running,
        AgentRunStatus::MemoryOnly,
        AgentRunStatus::Evaluating,
        AgentRunStatus::Done,
    ] {
        store
            .update_agent_status(&agent.id, status, None)
            .await
            .unwrap();
    }

    let err = store
        .update_agent_status(&agent.id, AgentRunStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn error_records_failure_kind() {
    let (store, run) = seeded(&["claude"]).await;
    let agent = AgentRunRecord::new(run.id, AgentKind::new("claude"));
    store.create_agent_run(agent.clone()).await.unwrap();

    let updated = store
        .update_agent_status(
            &agent.id,
            AgentRunStatus::Error,
            Some(AgentFailure::new(FailureKind::Timeout, "session timed out")),
        )
        .await
        .unwrap();
    assert_eq!(updated.failure, Some(FailureKind::Timeout));
    assert_eq!(updated.error_message.as_deref(), Some("session timed out"));
    assert!(updated.completed_at.is_some());
}

#[tokio::test]
async fn supersede_keeps_history_and_blocks_writes() {
    let (store, run) = seeded(&["claude"]).await;
    let first = AgentRunRecord::new(run.id, AgentKind::new("claude"));
    store.create_agent_run(first.clone()).await.unwrap();
    store
        .update_agent_status(&first.id, AgentRunStatus::Error, None)
        .await
        .unwrap();

    let retry = AgentRunRecord::retry_of(&first);
    store
        .supersede_agent_run(&first.id, retry.clone())
        .await
        .unwrap();

    let active = store.list_agent_runs(&run.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, retry.id);
    assert_eq!(active[0].retry_count, 1);

    let history = store
        .agent_run_history(&run.id, &AgentKind::new("claude"))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].superseded);

    let err = store
        .append_milestone(&first.id, Milestone::now("late"))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Superseded(first.id));
}

#[tokio::test]
async fn artifacts_and_stats_accumulate() {
    let (store, run) = seeded(&["claude"]).await;
    let agent = AgentRunRecord::new(run.id, AgentKind::new("claude"));
    store.create_agent_run(agent.clone()).await.unwrap();

    store
        .append_artifact(&agent.id, "transcript", "/tmp/t.json")
        .await
        .unwrap();
    store
        .merge_stats(&agent.id, BTreeMap::from([("turns".into(), 3.into())]))
        .await
        .unwrap();
    store
        .merge_stats(&agent.id, BTreeMap::from([("tokens".into(), 120.into())]))
        .await
        .unwrap();

    let agent = store.get_agent_run(&agent.id).await.unwrap();
    assert_eq!(agent.artifacts["transcript"], "/tmp/t.json");
    assert_eq!(agent.stats.len(), 2);
}

// ===========================================================================
// Scores
// ===========================================================================

#[tokio::test]
async fn score_is_immutable() {
    let (store, run) = seeded(&["claude"]).await;
    let agent = AgentRunRecord::new(run.id, AgentKind::new("claude"));
    store.create_agent_run(agent.clone()).await.unwrap();

    assert!(store.get_score(&agent.id).await.unwrap().is_none());
    store.put_score(sample_score(&agent)).await.unwrap();
    let err = store.put_score(sample_score(&agent)).await.unwrap_err();
    assert_eq!(err, StoreError::ScoreExists(agent.id));

    let stored = store.get_score(&agent.id).await.unwrap().unwrap();
    assert_eq!(stored.aggregate, 0.8);
}

#[tokio::test]
async fn score_for_unknown_agent_rejected() {
    let store = MemoryRunStateStore::new();
    let orphan = AgentRunRecord::new(RunId::new(), AgentKind::new("claude"));
    let err = store.put_score(sample_score(&orphan)).await.unwrap_err();
    assert_eq!(err, StoreError::AgentRunNotFound(orphan.id));
}
