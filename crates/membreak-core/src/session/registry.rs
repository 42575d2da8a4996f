//! Explicit registry of agent adapters, built once at process start and
//! handed to the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use membreak_state::AgentKind;

use super::{AgentAdapter, SessionError, SessionResult};
use crate::detector::DetectorKind;

/// Descriptive metadata for a registered agent kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub kind: AgentKind,
    pub display_name: String,
    pub description: String,
    pub detector: DetectorKind,
}

impl AgentInfo {
    /// Metadata with the per-kind default detector.
    pub fn new(kind: AgentKind, display_name: impl Into<String>) -> Self {
        let detector = DetectorKind::default_for(&kind);
        Self {
            kind,
            display_name: display_name.into(),
            description: String::new(),
            detector,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_detector(mut self, detector: DetectorKind) -> Self {
        self.detector = detector;
        self
    }
}

#[derive(Clone)]
pub struct RegisteredAgent {
    pub info: AgentInfo,
    pub adapter: Arc<dyn AgentAdapter>,
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its kind. An existing registration is kept
    /// (with a warning) unless `force` is set, and metadata describing a
    /// different kind is rejected. Returns whether it was stored.
    pub fn register(
        &mut self,
        adapter: Arc<dyn AgentAdapter>,
        info: AgentInfo,
        force: bool,
    ) -> bool {
        let kind = adapter.kind();
        if info.kind != kind {
            warn!(
                agent_kind = %kind,
                info_kind = %info.kind,
                "agent metadata does not match adapter kind; registration rejected"
            );
            return false;
        }
        if self.agents.contains_key(&kind) && !force {
            warn!(agent_kind = %kind, "agent kind already registered; use force to replace");
            return false;
        }
        info!(agent_kind = %kind, detector = ?info.detector, "registered agent adapter");
        self.agents.insert(kind, RegisteredAgent { info, adapter });
        true
    }

    /// Register with default metadata for the adapter's kind.
    pub fn register_default(&mut self, adapter: Arc<dyn AgentAdapter>) -> bool {
        let kind = adapter.kind();
        let info = AgentInfo::new(kind.clone(), kind.as_str());
        self.register(adapter, info, false)
    }

    pub fn get(&self, kind: &AgentKind) -> SessionResult<&RegisteredAgent> {
        self.agents
            .get(kind)
            .ok_or_else(|| SessionError::NotFound(kind.clone()))
    }

    pub fn contains(&self, kind: &AgentKind) -> bool {
        self.agents.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<AgentKind> {
        let mut kinds: Vec<_> = self.agents.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn infos(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<_> = self.agents.values().map(|a| a.info.clone()).collect();
        infos.sort_by(|a, b| a.kind.cmp(&b.kind));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ReplayAdapter, ReplayScript};

    fn adapter(kind: &str) -> Arc<dyn AgentAdapter> {
        Arc::new(ReplayAdapter::new(kind, ReplayScript::default()))
    }

    #[test]
    fn test_duplicate_registration_ignored_without_force() {
        let mut reg = AgentRegistry::new();
        assert!(reg.register_default(adapter("claude")));
        let replacement = AgentInfo::new(AgentKind::new("claude"), "Other");
        assert!(!reg.register(adapter("claude"), replacement.clone(), false));
        assert_eq!(reg.get(&AgentKind::new("claude")).unwrap().info.display_name, "claude");

        assert!(reg.register(adapter("claude"), replacement, true));
        assert_eq!(reg.get(&AgentKind::new("claude")).unwrap().info.display_name, "Other");
    }

    #[test]
    fn test_mismatched_metadata_is_rejected() {
        let mut reg = AgentRegistry::new();
        let info = AgentInfo::new(AgentKind::new("gemini"), "Gemini");
        assert!(!reg.register(adapter("claude"), info.clone(), false));
        assert!(!reg.register(adapter("claude"), info, true));
        assert!(!reg.contains(&AgentKind::new("claude")));
        assert!(!reg.contains(&AgentKind::new("gemini")));
    }

    #[test]
    fn test_unknown_kind_is_not_found() {
        let reg = AgentRegistry::new();
        let err = reg.get(&AgentKind::new("ghost")).err().unwrap();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn test_default_detector_follows_kind() {
        let mut reg = AgentRegistry::new();
        reg.register_default(adapter("gemini"));
        reg.register_default(adapter("custom"));
        let infos = reg.infos();
        assert_eq!(infos[0].detector, DetectorKind::StepCount);
        assert_eq!(infos[1].detector, DetectorKind::ContextFooter);
        assert_eq!(reg.kinds(), vec![AgentKind::new("custom"), AgentKind::new("gemini")]);
    }
}
