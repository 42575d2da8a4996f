//! Agent session contracts and the fixed evaluation protocol.
//!
//! An [`AgentAdapter`] opens an [`AgentSession`] inside an isolated
//! workspace; the [`ProtocolRunner`] then drives that session through the
//! five phases in order, consulting a compression detector once per
//! deep-dive iteration.

mod error;
mod registry;
mod replay;
mod runner;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use membreak_state::AgentKind;

pub use error::{SessionError, SessionResult};
pub use registry::{AgentInfo, AgentRegistry, RegisteredAgent};
pub use replay::{ReplayAdapter, ReplayScript, ScriptedFailure, ScriptedTurn};
pub use runner::{ProtocolObserver, ProtocolRunner, RecallPair, SessionOutcome};

/// Protocol phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    ContextLoad,
    PreCompression,
    DeepDive,
    MemoryOnly,
    Recall,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::ContextLoad,
        Phase::PreCompression,
        Phase::DeepDive,
        Phase::MemoryOnly,
        Phase::Recall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ContextLoad => "context-load",
            Phase::PreCompression => "pre-compression",
            Phase::DeepDive => "deep-dive",
            Phase::MemoryOnly => "memory-only",
            Phase::Recall => "recall",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompts for one run, shared by every agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptSet {
    pub context_load: String,
    pub pre_compression: String,
    pub deep_dive: String,
    pub memory_only: String,
    pub recall_questions: Vec<String>,
}

/// One agent response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Turn {
    pub text: String,
    /// Tokens the provider reports as held in context after this turn.
    pub context_tokens: Option<u64>,
    /// Percent of context remaining, when the provider reports it directly.
    pub context_left_percent: Option<f64>,
    /// Provider flagged that it hit its token/response limit.
    pub limit_reached: bool,
}

impl Turn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A live conversation with one agent.
#[async_trait]
pub trait AgentSession: Send {
    async fn send(&mut self, phase: Phase, prompt: &str) -> SessionResult<Turn>;

    /// Artifacts produced so far, name → location.
    fn artifacts(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Release provider resources. Called on success and on cancellation.
    async fn close(&mut self) {}
}

/// Factory for sessions of one agent kind.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn open(&self, workspace: &Path) -> SessionResult<Box<dyn AgentSession>>;
}
