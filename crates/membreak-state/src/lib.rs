//! membreak-state: run state persistence for memory-break evaluations
//!
//! Holds the durable shape of an evaluation and the contract every
//! backend must honour.
//!
//! ## Key Components
//!
//! - `RunRecord` / `AgentRunRecord` / `ScoreRecord`: persisted entities
//! - `RunStatus` / `AgentRunStatus`: forward-only lifecycles
//! - `RunStateStore`: async, backend-agnostic store trait
//! - `fakes::MemoryRunStateStore`: in-memory implementation

mod error;
pub mod fakes;
mod schema;
pub mod storage_traits;

pub use error::{StoreError, UnknownDimension};
pub use fakes::MemoryRunStateStore;
pub use schema::{
    AgentFailure, AgentKind, AgentRunId, AgentRunRecord, AgentRunStatus, FailureKind, JudgeKind,
    Milestone, RubricDimension, RubricThresholds, RunId, RunRecord, RunStatus, ScoreRecord,
    DEFAULT_THRESHOLD,
};
pub use storage_traits::{RunPreparation, RunStateStore, StoreResult};
