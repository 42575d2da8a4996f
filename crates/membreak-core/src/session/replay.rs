//! Deterministic adapter that replays a recorded session script.
//!
//! Each phase has an ordered list of scripted turns; once a phase's list is
//! exhausted its last turn repeats. Phases without turns acknowledge the
//! prompt with a short echo.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use membreak_state::AgentKind;

use super::{AgentAdapter, AgentSession, Phase, SessionError, SessionResult, Turn};

/// Failure injected in place of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ScriptedFailure {
    ContextExhausted(String),
    Execution(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedTurn {
    #[serde(flatten)]
    pub turn: Turn,
    pub fail: Option<ScriptedFailure>,
}

impl From<Turn> for ScriptedTurn {
    fn from(turn: Turn) -> Self {
        Self { turn, fail: None }
    }
}

impl ScriptedTurn {
    pub fn failing(fail: ScriptedFailure) -> Self {
        Self {
            turn: Turn::default(),
            fail: Some(fail),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayScript {
    /// Simulated provider latency per turn.
    pub turn_delay_ms: u64,
    pub phases: BTreeMap<Phase, Vec<ScriptedTurn>>,
    /// Make `open` fail with this message.
    pub fail_on_open: Option<String>,
    /// Artifacts reported by the session, name → location.
    pub artifacts: BTreeMap<String, String>,
}

impl ReplayScript {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.turn_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_turns(mut self, phase: Phase, turns: Vec<ScriptedTurn>) -> Self {
        self.phases.insert(phase, turns);
        self
    }

    pub fn failing_open(mut self, message: impl Into<String>) -> Self {
        self.fail_on_open = Some(message.into());
        self
    }
}

pub struct ReplayAdapter {
    kind: AgentKind,
    script: ReplayScript,
}

impl ReplayAdapter {
    pub fn new(kind: impl AsRef<str>, script: ReplayScript) -> Self {
        Self {
            kind: AgentKind::new(kind),
            script,
        }
    }
}

#[async_trait]
impl AgentAdapter for ReplayAdapter {
    fn kind(&self) -> AgentKind {
        self.kind.clone()
    }

    async fn open(&self, workspace: &Path) -> SessionResult<Box<dyn AgentSession>> {
        if let Some(msg) = &self.script.fail_on_open {
            return Err(SessionError::Execution(msg.clone()));
        }
        let mut artifacts = self.script.artifacts.clone();
        artifacts
            .entry("workspace".to_string())
            .or_insert_with(|| workspace.display().to_string());
        Ok(Box::new(ReplaySession {
            script: self.script.clone(),
            cursors: BTreeMap::new(),
            artifacts,
        }))
    }
}

struct ReplaySession {
    script: ReplayScript,
    cursors: BTreeMap<Phase, usize>,
    artifacts: BTreeMap<String, String>,
}

#[async_trait]
impl AgentSession for ReplaySession {
    async fn send(&mut self, phase: Phase, prompt: &str) -> SessionResult<Turn> {
        if self.script.turn_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.turn_delay_ms)).await;
        }

        let cursor = self.cursors.entry(phase).or_insert(0);
        let index = *cursor;
        *cursor += 1;

        let Some(turns) = self.script.phases.get(&phase).filter(|t| !t.is_empty()) else {
            let head: String = prompt.chars().take(48).collect();
            return Ok(Turn::text(format!("ack {phase}: {head}")));
        };
        let scripted = &turns[index.min(turns.len() - 1)];
        match &scripted.fail {
            Some(ScriptedFailure::ContextExhausted(msg)) => {
                Err(SessionError::ContextExhausted(msg.clone()))
            }
            Some(ScriptedFailure::Execution(msg)) => Err(SessionError::Execution(msg.clone())),
            None => Ok(scripted.turn.clone()),
        }
    }

    fn artifacts(&self) -> BTreeMap<String, String> {
        self.artifacts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_turn_repeats() {
        let script = ReplayScript::default().with_turns(
            Phase::DeepDive,
            vec![Turn::text("one").into(), Turn::text("two").into()],
        );
        let adapter = ReplayAdapter::new("claude", script);
        let mut session = adapter.open(Path::new("/tmp/ws")).await.unwrap();

        let mut texts = Vec::new();
        for _ in 0..3 {
            texts.push(session.send(Phase::DeepDive, "go").await.unwrap().text);
        }
        assert_eq!(texts, vec!["one", "two", "two"]);
        assert_eq!(session.artifacts()["workspace"], "/tmp/ws");
    }

    #[tokio::test]
    async fn test_unscripted_phase_echoes() {
        let adapter = ReplayAdapter::new("claude", ReplayScript::default());
        let mut session = adapter.open(Path::new(".")).await.unwrap();
        let turn = session.send(Phase::Recall, "What changed?").await.unwrap();
        assert_eq!(turn.text, "ack recall: What changed?");
    }

    #[tokio::test]
    async fn test_open_failure() {
        let adapter = ReplayAdapter::new("claude", ReplayScript::default().failing_open("no binary"));
        assert!(matches!(
            adapter.open(Path::new(".")).await,
            Err(SessionError::Execution(_))
        ));
    }

    #[test]
    fn test_script_from_json() {
        let script: ReplayScript = serde_json::from_str(
            r#"{
                "phases": {
                    "deep-dive": [
                        {"text": "[70% context left]"},
                        {"fail": {"kind": "context_exhausted", "message": "maximum context length"}}
                    ]
                }
            }"#,
        )
        .unwrap();
        let turns = &script.phases[&Phase::DeepDive];
        assert_eq!(turns[0].turn.text, "[70% context left]");
        assert!(matches!(
            turns[1].fail,
            Some(ScriptedFailure::ContextExhausted(_))
        ));
    }
}
