//! Fixed five-phase protocol driver.
//!
//! Phases run strictly in order: context load, pre-compression (baseline
//! answers to every recall question), the deep-dive loop, memory-only, then
//! recall. Only the deep-dive loop has variable length; it exits when the
//! detector fires or after `max_iterations`, and in both cases the observer
//! is told to move the agent run to `MemoryOnly` before the loop ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{AgentSession, Phase, PromptSet, SessionError, SessionResult, Turn};
use crate::detector::{
    CompressionDetector, DetectionMethod, DetectionResult, Evidence, SessionSignal,
};
use crate::metrics::METRICS;

/// Receives protocol progress for persistence.
#[async_trait]
pub trait ProtocolObserver: Send + Sync {
    async fn milestone(&self, name: &str) -> SessionResult<()>;

    /// Deep-dive loop is exiting; the agent run must enter `MemoryOnly`.
    /// `forced` is set when the iteration cap was hit without a detection.
    async fn memory_only(
        &self,
        detection: &DetectionResult,
        iteration: u32,
        forced: bool,
    ) -> SessionResult<()>;
}

/// One recall question with its baseline and post-compression answers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecallPair {
    pub question: String,
    pub pre_answer: String,
    pub post_answer: String,
}

/// Everything a completed protocol produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    /// A detector fired; false when the iteration cap forced the transition.
    pub compression_detected: bool,
    /// Authoritative detection that ended the deep-dive loop.
    pub detection: DetectionResult,
    pub deep_dive_iterations: u32,
    pub recall: Vec<RecallPair>,
    /// Character-derived token estimate per phase.
    pub phase_tokens: BTreeMap<Phase, u64>,
    pub estimated_tokens: u64,
    pub warnings: Vec<String>,
    pub artifacts: BTreeMap<String, String>,
}

impl SessionOutcome {
    pub fn questions(&self) -> Vec<String> {
        self.recall.iter().map(|p| p.question.clone()).collect()
    }

    pub fn pre_answers(&self) -> Vec<String> {
        self.recall.iter().map(|p| p.pre_answer.clone()).collect()
    }

    pub fn post_answers(&self) -> Vec<String> {
        self.recall.iter().map(|p| p.post_answer.clone()).collect()
    }

    /// Execution statistics recorded on the agent run.
    pub fn stats(&self) -> BTreeMap<String, serde_json::Value> {
        let phase_tokens: BTreeMap<&str, u64> = self
            .phase_tokens
            .iter()
            .map(|(p, t)| (p.as_str(), *t))
            .collect();
        BTreeMap::from([
            ("compression_detected".to_string(), json!(self.compression_detected)),
            (
                "detection_method".to_string(),
                json!(self.detection.method.map(|m| m.as_str())),
            ),
            ("detection_evidence".to_string(), json!(self.detection.evidence)),
            ("deep_dive_iterations".to_string(), json!(self.deep_dive_iterations)),
            ("estimated_tokens".to_string(), json!(self.estimated_tokens)),
            ("phase_tokens".to_string(), json!(phase_tokens)),
            ("recall".to_string(), json!(self.recall)),
            ("warnings".to_string(), json!(self.warnings)),
        ])
    }
}

#[derive(Default)]
struct Tally {
    chars_per_token: u64,
    total_chars: u64,
    per_phase: BTreeMap<Phase, u64>,
}

impl Tally {
    fn add(&mut self, phase: Phase, prompt: &str, response: &str) {
        let chars = (prompt.chars().count() + response.chars().count()) as u64;
        self.total_chars += chars;
        *self.per_phase.entry(phase).or_default() += chars;
    }

    fn estimate(&self, chars: u64) -> u64 {
        chars / self.chars_per_token.max(1)
    }

    fn total(&self) -> u64 {
        self.estimate(self.total_chars)
    }

    fn phases(&self) -> BTreeMap<Phase, u64> {
        self.per_phase
            .iter()
            .map(|(p, c)| (*p, self.estimate(*c)))
            .collect()
    }
}

/// Drives one session through the protocol.
pub struct ProtocolRunner {
    detector: Arc<dyn CompressionDetector>,
    max_iterations: u32,
    chars_per_token: u32,
}

impl ProtocolRunner {
    pub fn new(
        detector: Arc<dyn CompressionDetector>,
        max_iterations: u32,
        chars_per_token: u32,
    ) -> Self {
        Self {
            detector,
            max_iterations: max_iterations.max(1),
            chars_per_token,
        }
    }

    pub async fn run(
        &self,
        session: &mut dyn AgentSession,
        prompts: &PromptSet,
        observer: &dyn ProtocolObserver,
    ) -> SessionResult<SessionOutcome> {
        let mut tally = Tally {
            chars_per_token: u64::from(self.chars_per_token),
            ..Default::default()
        };
        let mut outcome = SessionOutcome::default();

        // Context load
        let turn = session.send(Phase::ContextLoad, &prompts.context_load).await?;
        tally.add(Phase::ContextLoad, &prompts.context_load, &turn.text);
        observer.milestone("context_loaded").await?;

        // Pre-compression analysis plus baseline answers
        let turn = session
            .send(Phase::PreCompression, &prompts.pre_compression)
            .await?;
        tally.add(Phase::PreCompression, &prompts.pre_compression, &turn.text);
        for question in &prompts.recall_questions {
            let turn = session.send(Phase::PreCompression, question).await?;
            tally.add(Phase::PreCompression, question, &turn.text);
            outcome.recall.push(RecallPair {
                question: question.clone(),
                pre_answer: turn.text,
                post_answer: String::new(),
            });
        }
        observer.milestone("pre_compression_complete").await?;

        // Deep-dive until the detector fires
        self.deep_dive(session, prompts, observer, &mut tally, &mut outcome)
            .await?;

        // Memory-only
        match session.send(Phase::MemoryOnly, &prompts.memory_only).await {
            Ok(turn) => tally.add(Phase::MemoryOnly, &prompts.memory_only, &turn.text),
            Err(SessionError::ContextExhausted(msg)) => {
                warn!(phase = %Phase::MemoryOnly, error = %msg, "context exhausted during memory-only phase");
                outcome
                    .warnings
                    .push(format!("memory-only phase hit context limit: {msg}"));
            }
            Err(e) => return Err(e),
        }
        observer.milestone("memory_only_complete").await?;

        // Recall
        for (i, question) in prompts.recall_questions.iter().enumerate() {
            match session.send(Phase::Recall, question).await {
                Ok(turn) => {
                    tally.add(Phase::Recall, question, &turn.text);
                    if let Some(pair) = outcome.recall.get_mut(i) {
                        pair.post_answer = turn.text;
                    }
                }
                Err(SessionError::ContextExhausted(msg)) => {
                    warn!(question = i + 1, error = %msg, "context exhausted during recall; remaining answers left empty");
                    outcome.warnings.push(format!(
                        "recall stopped at question {}: {msg}",
                        i + 1
                    ));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        observer.milestone("recall_complete").await?;

        outcome.artifacts = session.artifacts();
        outcome.phase_tokens = tally.phases();
        outcome.estimated_tokens = tally.total();
        Ok(outcome)
    }

    async fn deep_dive(
        &self,
        session: &mut dyn AgentSession,
        prompts: &PromptSet,
        observer: &dyn ProtocolObserver,
        tally: &mut Tally,
        outcome: &mut SessionOutcome,
    ) -> SessionResult<()> {
        let mut history: Vec<SessionSignal> = Vec::new();
        let mut warned = false;

        for iteration in 1..=self.max_iterations {
            outcome.deep_dive_iterations = iteration;
            let result = match session.send(Phase::DeepDive, &prompts.deep_dive).await {
                Ok(turn) => {
                    tally.add(Phase::DeepDive, &prompts.deep_dive, &turn.text);
                    history.push(signal(iteration, turn, tally.total()));
                    self.detector.observe(&history)
                }
                Err(SessionError::ContextExhausted(msg)) => {
                    debug!(iteration, error = %msg, "provider reported context exhausted");
                    DetectionResult::fired(DetectionMethod::SdkFlag, Evidence::Flag)
                }
                Err(e) => return Err(e),
            };

            if result.approaching_limit && !warned {
                warned = true;
                warn!(iteration, detector = self.detector.name(), "approaching context limit");
                outcome
                    .warnings
                    .push(format!("approaching context limit at iteration {iteration}"));
            }

            if result.fired {
                METRICS.inc_compressions_detected();
                outcome.compression_detected = true;
                outcome.detection = result;
                observer
                    .memory_only(&outcome.detection, iteration, false)
                    .await?;
                return Ok(());
            }
        }

        METRICS.inc_forced_transitions();
        let forced = DetectionResult {
            fired: false,
            method: Some(DetectionMethod::MaxIterations),
            evidence: Some(Evidence::Iterations {
                count: self.max_iterations,
                limit: self.max_iterations,
            }),
            approaching_limit: warned,
        };
        outcome.compression_detected = false;
        outcome.detection = forced;
        observer
            .memory_only(&outcome.detection, self.max_iterations, true)
            .await
    }
}

fn signal(iteration: u32, turn: Turn, estimated_tokens: u64) -> SessionSignal {
    SessionSignal {
        iteration,
        text: turn.text,
        context_left_percent: turn.context_left_percent,
        tokens_used: turn.context_tokens,
        estimated_tokens,
        limit_reached: turn.limit_reached,
    }
}
