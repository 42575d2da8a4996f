//! Compression detectors.
//!
//! A detector inspects the signal history of one running session and
//! decides whether the agent's context has been compressed. Detectors are
//! pure: the full history is passed in on every call (last element is the
//! current reading), so they hold no per-session state and can be shared
//! across concurrent workers.
//!
//! Scalar signals all converge on two tests:
//! - threshold: percent of context remaining at or below `threshold_low`
//! - jump: percent remaining rose by at least `jump_threshold` between
//!   consecutive readings (the agent silently compacted its history)
//!
//! The threshold test is evaluated first.

mod composite;
mod context;
mod heuristic;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use membreak_state::AgentKind;

use crate::config::DetectionConfig;

pub use composite::CompositeDetector;
pub use context::{parse_context_left, ContextLeftDetector, TokenCounterDetector};
pub use heuristic::{
    KeywordDetector, ProviderFlagDetector, StepCountDetector, TokenEstimateDetector,
};

/// One reading taken after a deep-dive turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSignal {
    /// 1-based deep-dive iteration that produced this reading.
    pub iteration: u32,
    /// Response text of the turn.
    pub text: String,
    /// Provider-reported percent of context remaining.
    pub context_left_percent: Option<f64>,
    /// Provider-reported tokens currently held in context.
    pub tokens_used: Option<u64>,
    /// Character-derived running token estimate for the whole session.
    pub estimated_tokens: u64,
    /// Provider reported it hit its token/response limit.
    pub limit_reached: bool,
}

/// Which test produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    ThresholdFooter,
    TokenJump,
    SdkFlag,
    KeywordHeuristic,
    StepCount,
    TokenEstimate,
    /// Deep-dive loop hit its iteration cap without any detection.
    MaxIterations,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::ThresholdFooter => "threshold-footer",
            DetectionMethod::TokenJump => "token-jump",
            DetectionMethod::SdkFlag => "sdk-flag",
            DetectionMethod::KeywordHeuristic => "keyword-heuristic",
            DetectionMethod::StepCount => "step-count",
            DetectionMethod::TokenEstimate => "token-estimate",
            DetectionMethod::MaxIterations => "max-iterations",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw signal that triggered a detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    Percentages { previous: Option<f64>, current: f64 },
    Tokens { previous: Option<u64>, current: u64 },
    Flag,
    Keyword { keyword: String },
    Iterations { count: u32, limit: u32 },
    Estimate { estimated: u64, budget: u64 },
}

/// Outcome of one `observe` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub fired: bool,
    pub method: Option<DetectionMethod>,
    pub evidence: Option<Evidence>,
    /// Close to the budget; informational only, never a firing condition.
    pub approaching_limit: bool,
}

impl DetectionResult {
    pub fn quiet() -> Self {
        Self::default()
    }

    pub fn fired(method: DetectionMethod, evidence: Evidence) -> Self {
        Self {
            fired: true,
            method: Some(method),
            evidence: Some(evidence),
            approaching_limit: false,
        }
    }

    pub fn approaching(mut self, approaching: bool) -> Self {
        self.approaching_limit = self.approaching_limit || approaching;
        self
    }
}

/// Side-effect-free compression policy for one agent kind.
pub trait CompressionDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Judge the latest reading in `history`. Empty history never fires.
    fn observe(&self, history: &[SessionSignal]) -> DetectionResult;
}

/// Detector strategy selected per agent kind at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Provider token counter converted to percent remaining.
    TokenCounter,
    /// `NN% context left` footer in the response text.
    ContextFooter,
    /// Provider flag, then compression keywords, then a token estimate.
    Composite,
    /// Fixed number of deep-dive iterations.
    StepCount,
}

impl DetectorKind {
    /// Strategy used when an adapter is registered without an explicit one.
    pub fn default_for(kind: &AgentKind) -> Self {
        match kind.as_str() {
            "claude" => DetectorKind::TokenCounter,
            "gemini" => DetectorKind::ContextFooter,
            "iflow" => DetectorKind::Composite,
            _ => DetectorKind::StepCount,
        }
    }

    pub fn build(&self, cfg: &DetectionConfig) -> Arc<dyn CompressionDetector> {
        match self {
            DetectorKind::TokenCounter => Arc::new(TokenCounterDetector::new(cfg)),
            DetectorKind::ContextFooter => Arc::new(ContextLeftDetector::new(cfg)),
            DetectorKind::Composite => Arc::new(CompositeDetector::new(vec![
                Box::new(ProviderFlagDetector),
                Box::new(KeywordDetector::new(cfg)),
                Box::new(TokenEstimateDetector::new(cfg)),
            ])),
            DetectorKind::StepCount => Arc::new(StepCountDetector::new(cfg.step_count_iterations)),
        }
    }
}

/// Threshold test then jump test over percent-remaining readings.
pub(crate) fn percent_tests(
    previous: Option<f64>,
    current: f64,
    threshold_low: f64,
    jump_threshold: f64,
) -> Option<DetectionMethod> {
    if current <= threshold_low {
        return Some(DetectionMethod::ThresholdFooter);
    }
    match previous {
        Some(prev) if current - prev >= jump_threshold => Some(DetectionMethod::TokenJump),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_checked_before_jump() {
        // 10 -> 25 is both a jump of 15 and below the mark of 30.
        assert_eq!(
            percent_tests(Some(10.0), 25.0, 30.0, 15.0),
            Some(DetectionMethod::ThresholdFooter)
        );
    }

    #[test]
    fn test_drop_is_not_a_jump() {
        assert_eq!(percent_tests(Some(90.0), 40.0, 30.0, 30.0), None);
    }

    #[test]
    fn test_method_tags() {
        assert_eq!(DetectionMethod::TokenJump.to_string(), "token-jump");
        assert_eq!(
            serde_json::to_string(&DetectionMethod::ThresholdFooter).unwrap(),
            r#""threshold-footer""#
        );
    }

    #[test]
    fn test_default_strategy_per_kind() {
        assert_eq!(
            DetectorKind::default_for(&AgentKind::new("Claude")),
            DetectorKind::TokenCounter
        );
        assert_eq!(
            DetectorKind::default_for(&AgentKind::new("gemini")),
            DetectorKind::ContextFooter
        );
        assert_eq!(
            DetectorKind::default_for(&AgentKind::new("iflow")),
            DetectorKind::Composite
        );
        assert_eq!(
            DetectorKind::default_for(&AgentKind::new("aider")),
            DetectorKind::StepCount
        );
    }
}
