//! Process-wide atomic counters.
//!
//! Incremented silently at the call site; [`Metrics::flush`] emits every
//! value as one `tracing::info!` event at the end of each run.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    sessions_started: AtomicU64,
    sessions_failed: AtomicU64,
    compressions_detected: AtomicU64,
    forced_transitions: AtomicU64,
    judge_fallbacks: AtomicU64,
    scores_recorded: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub compressions_detected: u64,
    pub forced_transitions: u64,
    pub judge_fallbacks: u64,
    pub scores_recorded: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            compressions_detected: AtomicU64::new(0),
            forced_transitions: AtomicU64::new(0),
            judge_fallbacks: AtomicU64::new(0),
            scores_recorded: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_sessions_started(&self) {
        Self::bump(&self.sessions_started, "sessions_started");
    }

    pub fn inc_sessions_failed(&self) {
        Self::bump(&self.sessions_failed, "sessions_failed");
    }

    pub fn inc_compressions_detected(&self) {
        Self::bump(&self.compressions_detected, "compressions_detected");
    }

    /// Deep-dive loop hit its iteration cap without a detection.
    pub fn inc_forced_transitions(&self) {
        Self::bump(&self.forced_transitions, "forced_transitions");
    }

    pub fn inc_judge_fallbacks(&self) {
        Self::bump(&self.judge_fallbacks, "judge_fallbacks");
    }

    pub fn inc_scores_recorded(&self) {
        Self::bump(&self.scores_recorded, "scores_recorded");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            compressions_detected: self.compressions_detected.load(Ordering::Relaxed),
            forced_transitions: self.forced_transitions.load(Ordering::Relaxed),
            judge_fallbacks: self.judge_fallbacks.load(Ordering::Relaxed),
            scores_recorded: self.scores_recorded.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            sessions_started = s.sessions_started,
            sessions_failed = s.sessions_failed,
            compressions_detected = s.compressions_detected,
            forced_transitions = s.forced_transitions,
            judge_fallbacks = s.judge_fallbacks,
            scores_recorded = s.scores_recorded,
        );
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        for c in [
            &self.sessions_started,
            &self.sessions_failed,
            &self.compressions_detected,
            &self.forced_transitions,
            &self.judge_fallbacks,
            &self.scores_recorded,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_sessions_started();
        m.inc_sessions_started();
        m.inc_judge_fallbacks();
        let s = m.snapshot();
        assert_eq!(s.sessions_started, 2);
        assert_eq!(s.judge_fallbacks, 1);
        assert_eq!(s.scores_recorded, 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_compressions_detected();
        m.inc_forced_transitions();
        m.inc_scores_recorded();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
