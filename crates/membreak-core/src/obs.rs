//! Structured lifecycle events for evaluation runs.
//!
//! - `run_span` builds the run-scoped span the coordinator instruments with
//! - `emit_*` functions log one named event each at `info!` (or `warn!`)

use tracing::{info, warn, Span};

/// Span tagging every event of one run with its `run_id`.
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("membreak.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, agent_count: usize) {
    info!(event = "run.started", run_id = %run_id, agent_count = agent_count);
}

/// Run reached a terminal status.
pub fn emit_run_finished(
    run_id: &str,
    duration_ms: u64,
    agents_done: usize,
    agents_total: usize,
    success: bool,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        agents_done = agents_done,
        agents_total = agents_total,
        success = success,
    );
}

pub fn emit_agent_transition(run_id: &str, agent_kind: &str, status: &str) {
    info!(event = "agent.transition", run_id = %run_id, agent_kind = %agent_kind, status = %status);
}

pub fn emit_agent_failed(
    run_id: &str,
    agent_kind: &str,
    failure: &str,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "agent.failed",
        run_id = %run_id,
        agent_kind = %agent_kind,
        failure = %failure,
        error = %error,
    );
}

/// Deep-dive loop exited; `forced` means the iteration cap was hit.
pub fn emit_compression_detected(
    run_id: &str,
    agent_kind: &str,
    method: &str,
    iteration: u32,
    forced: bool,
) {
    info!(
        event = "agent.compression_detected",
        run_id = %run_id,
        agent_kind = %agent_kind,
        method = %method,
        iteration = iteration,
        forced = forced,
    );
}

pub fn emit_agent_judged(
    run_id: &str,
    agent_kind: &str,
    aggregate: f64,
    passed: bool,
    judge: &str,
) {
    info!(
        event = "agent.judged",
        run_id = %run_id,
        agent_kind = %agent_kind,
        aggregate = aggregate,
        passed = passed,
        judge = %judge,
    );
}

pub fn emit_judge_fallback(error: &dyn std::fmt::Display) {
    warn!(event = "judge.fallback", error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_events_carry_run_id_inside_span() {
        let span = run_span("run-1");
        let _entered = span.enter();
        emit_run_started("run-1", 2);
        assert!(logs_contain("run.started"));
        assert!(logs_contain("run_id=run-1"));
    }

    #[traced_test]
    #[test]
    fn test_compression_event_records_method() {
        emit_compression_detected("run-2", "gemini", "token-jump", 4, false);
        assert!(logs_contain("agent.compression_detected"));
        assert!(logs_contain("method=token-jump"));
    }

    #[traced_test]
    #[test]
    fn test_failures_log_at_warn() {
        emit_agent_failed("run-3", "iflow", "workspace", &"disk full");
        assert!(logs_contain("WARN"));
        assert!(logs_contain("disk full"));
    }
}
