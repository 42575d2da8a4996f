//! Memory-break evaluation core
//!
//! Runs coding agents through a fixed compression protocol, detects when
//! their context was compacted, judges what they still remember, and
//! coordinates many agents per run across an agent pool and a judge pool.

pub mod config;
pub mod coordinator;
pub mod detector;
pub mod judge;
pub mod metrics;
pub mod obs;
pub mod pool;
pub mod scoring;
pub mod session;
pub mod telemetry;
pub mod workspace;

pub use config::{ConfigError, DetectionConfig, HeuristicConfig, JudgeConfig, OrchestratorConfig};

pub use coordinator::{
    CancelHandle, CancelReason, CoordinatorError, CoordinatorResult, CreateRunRequest, EvalService,
    RunCoordinator, RunStatusView, StartOutcome,
};

pub use detector::{
    CompositeDetector, CompressionDetector, ContextLeftDetector, DetectionMethod, DetectionResult,
    DetectorKind, Evidence, SessionSignal, StepCountDetector, TokenCounterDetector,
};

pub use judge::{
    HeuristicJudge, HttpReasoningClient, Judge, JudgeError, JudgeInput, JudgeOutput, JudgeService,
    ModelJudge, ReasoningClient, FALLBACK_MARKER,
};

pub use metrics::{MetricsSnapshot, METRICS};

pub use obs::{
    emit_agent_failed, emit_agent_judged, emit_agent_transition, emit_compression_detected,
    emit_judge_fallback, emit_run_finished, emit_run_started,
};

pub use pool::WorkerPool;
pub use scoring::{apply_thresholds, ThresholdVerdict};

pub use session::{
    AgentAdapter, AgentInfo, AgentRegistry, AgentSession, Phase, PromptSet, ProtocolRunner,
    ReplayAdapter, ReplayScript, SessionError, SessionOutcome, Turn,
};

pub use telemetry::init_tracing;

pub use workspace::{
    ChangeContext, ChangeSource, DirectoryIsolator, LocalChangeSource, PromptSource,
    StaticPromptSource, TemplatePromptSource, WorkspaceIsolator,
};

pub use membreak_state::{
    AgentKind, AgentRunRecord, AgentRunStatus, FailureKind, JudgeKind, MemoryRunStateStore,
    RubricDimension, RubricThresholds, RunId, RunRecord, RunStateStore, RunStatus, ScoreRecord,
};
