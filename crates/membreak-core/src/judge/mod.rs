//! Judges: score one agent's recall answers against the rubric.
//!
//! Two interchangeable implementations:
//! - [`HeuristicJudge`]: deterministic keyword-density scoring, always available
//! - [`ModelJudge`]: delegates to an external reasoning service and falls
//!   back to the heuristic judge on any failure
//!
//! [`JudgeService`] picks the configured judge and guarantees a verdict.

mod heuristic;
mod model;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use membreak_state::{JudgeKind, RubricDimension};

use crate::config::JudgeConfig;
use crate::metrics::METRICS;
use crate::obs;

pub use heuristic::HeuristicJudge;
pub use model::{
    parse_model_output, render_prompt, HttpReasoningClient, ModelJudge, ReasoningClient,
};

/// Rationale prefix marking a heuristic fallback.
pub const FALLBACK_MARKER: &str = "LLM evaluation failed, used heuristic fallback";

/// Errors a judge may report. Always recovered by falling back.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("reasoning service transport failure: {0}")]
    Transport(String),

    #[error("malformed judge output: {0}")]
    Malformed(String),

    #[error("judge output is missing dimension {0}")]
    MissingDimension(RubricDimension),

    #[error("judge not configured: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for JudgeError {
    fn from(err: reqwest::Error) -> Self {
        JudgeError::Transport(err.to_string())
    }
}

/// Result type for judge operations.
pub type JudgeResult<T> = std::result::Result<T, JudgeError>;

/// Everything a judge sees about one agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeInput {
    pub questions: Vec<String>,
    /// Baseline answers captured before compression.
    pub pre_answers: Vec<String>,
    /// Answers given after compression.
    pub post_answers: Vec<String>,
    pub rubric: Vec<RubricDimension>,
}

/// Raw judge verdict before thresholds are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeOutput {
    pub scores: BTreeMap<RubricDimension, f64>,
    pub rationale: String,
    pub judge_kind: JudgeKind,
    pub judge_model: Option<String>,
}

#[async_trait]
pub trait Judge: Send + Sync {
    fn kind(&self) -> JudgeKind;

    async fn evaluate(&self, input: &JudgeInput) -> JudgeResult<JudgeOutput>;
}

/// Selects the configured judge and never fails.
pub struct JudgeService {
    primary: Option<Arc<dyn Judge>>,
    heuristic: HeuristicJudge,
}

impl JudgeService {
    /// Heuristic-only service.
    pub fn heuristic(cfg: &JudgeConfig) -> Self {
        Self {
            primary: None,
            heuristic: HeuristicJudge::new(cfg.heuristic.clone()),
        }
    }

    /// Service whose first choice is `primary`.
    pub fn with_primary(cfg: &JudgeConfig, primary: Arc<dyn Judge>) -> Self {
        Self {
            primary: Some(primary),
            heuristic: HeuristicJudge::new(cfg.heuristic.clone()),
        }
    }

    /// Build from configuration. A model judge without an API key degrades
    /// to heuristic-only with a warning.
    pub fn from_config(cfg: &JudgeConfig) -> Self {
        match cfg.default_judge {
            JudgeKind::Heuristic => Self::heuristic(cfg),
            JudgeKind::Model => match HttpReasoningClient::from_config(cfg) {
                Ok(client) => {
                    let judge = ModelJudge::new(client, cfg);
                    Self::with_primary(cfg, Arc::new(judge))
                }
                Err(e) => {
                    warn!(error = %e, "model judge unavailable, using heuristic judge");
                    Self::heuristic(cfg)
                }
            },
        }
    }

    pub fn primary_kind(&self) -> JudgeKind {
        self.primary
            .as_ref()
            .map(|j| j.kind())
            .unwrap_or(JudgeKind::Heuristic)
    }

    /// Score `input`. Any primary failure falls back to the heuristic judge.
    pub async fn evaluate(&self, input: &JudgeInput) -> JudgeOutput {
        if let Some(primary) = &self.primary {
            match primary.evaluate(input).await {
                Ok(output) => return output,
                Err(e) => {
                    obs::emit_judge_fallback(&e);
                    METRICS.inc_judge_fallbacks();
                    return self.heuristic.fallback_for(input, &e);
                }
            }
        }
        self.heuristic.score(input)
    }
}
