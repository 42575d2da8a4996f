//! Persisted entity shapes for evaluation runs.
//!
//! - `RunRecord`: one evaluation request (Run table, keyed by `RunId`)
//! - `AgentRunRecord`: one agent's participation (AgentRun table, unique per
//!   active `(RunId, AgentKind)` pair)
//! - `ScoreRecord`: one judge verdict (Score table, keyed by `AgentRunId`)
//!
//! Status enums carry their own forward-only transition tables so every
//! backend rejects regressions the same way.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UnknownDimension;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RunId)
    }
}

/// Unique identifier for one agent's participation in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRunId(pub Uuid);

impl AgentRunId {
    pub fn new() -> Self {
        AgentRunId(Uuid::new_v4())
    }
}

impl Default for AgentRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name under which an agent adapter is registered (`claude`, `gemini`, ...).
///
/// Normalised to trimmed lowercase so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentKind(String);

impl AgentKind {
    pub fn new(name: impl AsRef<str>) -> Self {
        AgentKind(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentKind {
    fn from(s: &str) -> Self {
        AgentKind::new(s)
    }
}

// ---------------------------------------------------------------------------
// Rubric
// ---------------------------------------------------------------------------

/// Default pass threshold applied to any dimension without an explicit one.
pub const DEFAULT_THRESHOLD: f64 = 0.7;

/// One named axis of evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RubricDimension {
    /// Recall of concrete details after compression.
    #[serde(rename = "AR")]
    AccurateRetrieval,
    /// Adapting retained knowledge to new scenarios.
    #[serde(rename = "TTL")]
    TestTimeLearning,
    /// Connections across components and broader context.
    #[serde(rename = "LRU")]
    LongRangeUnderstanding,
    /// Updating or discarding understanding when asked to.
    #[serde(rename = "SF")]
    SelectiveForgetting,
}

impl RubricDimension {
    pub const ALL: [RubricDimension; 4] = [
        RubricDimension::AccurateRetrieval,
        RubricDimension::TestTimeLearning,
        RubricDimension::LongRangeUnderstanding,
        RubricDimension::SelectiveForgetting,
    ];

    /// Short code used on the wire and in reports.
    pub fn code(&self) -> &'static str {
        match self {
            RubricDimension::AccurateRetrieval => "AR",
            RubricDimension::TestTimeLearning => "TTL",
            RubricDimension::LongRangeUnderstanding => "LRU",
            RubricDimension::SelectiveForgetting => "SF",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RubricDimension::AccurateRetrieval => {
                "Accurate Retrieval - How well can the agent recall specific details and facts?"
            }
            RubricDimension::TestTimeLearning => {
                "Test-Time Learning - How well can the agent adapt and apply knowledge to new scenarios?"
            }
            RubricDimension::LongRangeUnderstanding => {
                "Long-Range Understanding - How well can the agent understand connections and broader context?"
            }
            RubricDimension::SelectiveForgetting => {
                "Selective Forgetting - How well can the agent update/modify its understanding when needed?"
            }
        }
    }
}

impl fmt::Display for RubricDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for RubricDimension {
    type Err = UnknownDimension;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        RubricDimension::ALL
            .into_iter()
            .find(|d| d.code().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownDimension(wanted.to_string()))
    }
}

/// Per-dimension pass thresholds. Missing dimensions use [`DEFAULT_THRESHOLD`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RubricThresholds(BTreeMap<RubricDimension, f64>);

impl RubricThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dimension: RubricDimension, threshold: f64) -> Self {
        self.0.insert(dimension, threshold);
        self
    }

    pub fn get(&self, dimension: RubricDimension) -> f64 {
        self.0.get(&dimension).copied().unwrap_or(DEFAULT_THRESHOLD)
    }

    /// Explicit thresholds, without defaults filled in.
    pub fn explicit(&self) -> &BTreeMap<RubricDimension, f64> {
        &self.0
    }

    /// Materialise the threshold for every dimension in `rubric`.
    pub fn resolved(&self, rubric: &[RubricDimension]) -> RubricThresholds {
        RubricThresholds(rubric.iter().map(|d| (*d, self.get(*d))).collect())
    }
}

// ---------------------------------------------------------------------------
// Status state machines
// ---------------------------------------------------------------------------

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    /// Derived for observers only; never written by the coordinator.
    Judging,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Judging => "judging",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }

    /// Forward-only transitions. Retry is a separate explicit reset.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Error)
                | (Running, Judging)
                | (Running, Done)
                | (Running, Error)
                | (Judging, Done)
                | (Judging, Error)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one agent's participation in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Queued,
    Running,
    MemoryOnly,
    Evaluating,
    Done,
    Error,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRunStatus::Queued => "queued",
            AgentRunStatus::Running => "running",
            AgentRunStatus::MemoryOnly => "memory_only",
            AgentRunStatus::Evaluating => "evaluating",
            AgentRunStatus::Done => "done",
            AgentRunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentRunStatus::Done | AgentRunStatus::Error)
    }

    /// Whether the agent session itself is still executing.
    pub fn in_session(&self) -> bool {
        matches!(self, AgentRunStatus::Running | AgentRunStatus::MemoryOnly)
    }

    /// `Queued → Running → [MemoryOnly] → Evaluating → Done`, with `Error`
    /// reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: AgentRunStatus) -> bool {
        use AgentRunStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, MemoryOnly)
                | (Running, Evaluating)
                | (MemoryOnly, Evaluating)
                | (Evaluating, Done)
                | (_, Error)
        )
    }
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an agent run ended in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Agent kind unknown or its adapter unavailable.
    NotFound,
    /// Agent session internal failure.
    Execution,
    /// Session or phase exceeded its time budget.
    Timeout,
    /// Run was cancelled while this agent was in flight.
    Cancelled,
    /// Isolated workspace could not be provisioned.
    Workspace,
    /// State store rejected a write for this agent run.
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Workspace => "workspace",
            FailureKind::Storage => "storage",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error details recorded alongside an `Error` transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl AgentFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Named point in an agent run's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub name: String,
    pub at: DateTime<Utc>,
}

impl Milestone {
    pub fn now(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            at: Utc::now(),
        }
    }
}

/// One evaluation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    /// Code-change reference handed to the change source (e.g. a PR URL).
    pub change_request: String,
    pub agent_kinds: Vec<AgentKind>,
    pub rubric: Vec<RubricDimension>,
    pub thresholds: RubricThresholds,
    /// File budget passed to prompt generation.
    pub max_files: usize,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub changed_files: Vec<String>,
    pub prompt_hash: Option<String>,
}

impl RunRecord {
    pub fn new(
        change_request: impl Into<String>,
        agent_kinds: Vec<AgentKind>,
        rubric: Vec<RubricDimension>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            change_request: change_request.into(),
            agent_kinds,
            rubric,
            thresholds: RubricThresholds::default(),
            max_files: 50,
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            changed_files: Vec::new(),
            prompt_hash: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: RubricThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }
}

/// One agent's participation in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub id: AgentRunId,
    pub run_id: RunId,
    pub agent_kind: AgentKind,
    pub status: AgentRunStatus,
    pub milestones: Vec<Milestone>,
    /// Artifact name → location.
    pub artifacts: BTreeMap<String, String>,
    /// Opaque execution statistics.
    pub stats: BTreeMap<String, serde_json::Value>,
    pub error_message: Option<String>,
    pub failure: Option<FailureKind>,
    pub retry_count: u32,
    /// Replaced by a retry; kept for history only.
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentRunRecord {
    pub fn new(run_id: RunId, agent_kind: AgentKind) -> Self {
        let now = Utc::now();
        Self {
            id: AgentRunId::new(),
            run_id,
            agent_kind,
            status: AgentRunStatus::Queued,
            milestones: Vec::new(),
            artifacts: BTreeMap::new(),
            stats: BTreeMap::new(),
            error_message: None,
            failure: None,
            retry_count: 0,
            superseded: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Fresh `Queued` record replacing `previous`, with the retry count bumped.
    pub fn retry_of(previous: &AgentRunRecord) -> Self {
        let mut next = Self::new(previous.run_id, previous.agent_kind.clone());
        next.retry_count = previous.retry_count + 1;
        next
    }

    pub fn has_milestone(&self, name: &str) -> bool {
        self.milestones.iter().any(|m| m.name == name)
    }
}

/// Which judge produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeKind {
    Heuristic,
    Model,
}

impl JudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Heuristic => "heuristic",
            JudgeKind::Model => "model",
        }
    }
}

impl fmt::Display for JudgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JudgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heuristic" => Ok(JudgeKind::Heuristic),
            "model" | "llm" => Ok(JudgeKind::Model),
            other => Err(format!("unknown judge kind: {other}")),
        }
    }
}

/// One judge verdict for one agent run. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub agent_run_id: AgentRunId,
    pub run_id: RunId,
    pub agent_kind: AgentKind,
    pub scores: BTreeMap<RubricDimension, f64>,
    /// Arithmetic mean of `scores`.
    pub aggregate: f64,
    pub thresholds: RubricThresholds,
    pub breaking_dimensions: Vec<RubricDimension>,
    pub breaking_details: BTreeMap<RubricDimension, String>,
    pub passed: bool,
    pub judge_kind: JudgeKind,
    pub judge_model: Option<String>,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_run_transitions_forward_only() {
        use AgentRunStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(MemoryOnly));
        assert!(Running.can_transition_to(Evaluating));
        assert!(MemoryOnly.can_transition_to(Evaluating));
        assert!(Evaluating.can_transition_to(Done));

        assert!(!Queued.can_transition_to(MemoryOnly));
        assert!(!MemoryOnly.can_transition_to(Running));
        assert!(!Evaluating.can_transition_to(MemoryOnly));
        assert!(!Done.can_transition_to(Error));
        assert!(!Error.can_transition_to(Queued));
    }

    #[test]
    fn test_error_reachable_from_every_live_state() {
        use AgentRunStatus::*;
        for status in [Queued, Running, MemoryOnly, Evaluating] {
            assert!(status.can_transition_to(Error), "{status} -> error");
        }
    }

    #[test]
    fn test_run_status_never_regresses() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Done.can_transition_to(Running));
        assert!(!Error.can_transition_to(Done));
    }

    #[test]
    fn test_dimension_parse_is_case_insensitive() {
        assert_eq!(
            "ttl".parse::<RubricDimension>().unwrap(),
            RubricDimension::TestTimeLearning
        );
        assert!("XYZ".parse::<RubricDimension>().is_err());
    }

    #[test]
    fn test_dimension_serializes_as_code() {
        let json = serde_json::to_string(&vec![RubricDimension::TestTimeLearning]).unwrap();
        assert_eq!(json, r#"["TTL"]"#);
    }

    #[test]
    fn test_thresholds_default_to_point_seven() {
        let t = RubricThresholds::new().with(RubricDimension::AccurateRetrieval, 0.9);
        assert_eq!(t.get(RubricDimension::AccurateRetrieval), 0.9);
        assert_eq!(t.get(RubricDimension::SelectiveForgetting), DEFAULT_THRESHOLD);

        let resolved = t.resolved(&[RubricDimension::SelectiveForgetting]);
        assert_eq!(resolved.explicit().len(), 1);
    }

    #[test]
    fn test_agent_kind_normalised() {
        assert_eq!(AgentKind::new(" Claude "), AgentKind::new("claude"));
    }

    #[test]
    fn test_retry_of_bumps_count() {
        let first = AgentRunRecord::new(RunId::new(), AgentKind::new("gemini"));
        let second = AgentRunRecord::retry_of(&first);
        assert_eq!(second.retry_count, 1);
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, AgentRunStatus::Queued);
    }
}
