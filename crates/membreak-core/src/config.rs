//! Orchestrator configuration.
//!
//! Defaults mirror the production evaluation settings; [`OrchestratorConfig::from_env`]
//! overlays `MEMBREAK_*` environment variables on top of them.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use membreak_state::JudgeKind;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("configuration rejected: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Compression detector settings shared by every detector strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Percent-of-context-remaining low-water mark.
    pub threshold_low: f64,
    /// Minimum increase between consecutive readings that counts as a jump.
    pub jump_threshold: f64,
    pub max_context_tokens: u64,
    /// Fraction of the budget at which an "approaching" warning is emitted.
    pub approaching_ratio: f64,
    /// Iterations after which the step-count heuristic assumes compression.
    pub step_count_iterations: u32,
    pub chars_per_token: u32,
    pub compression_keywords: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold_low: 30.0,
            jump_threshold: 30.0,
            max_context_tokens: 200_000,
            approaching_ratio: 0.9,
            step_count_iterations: 3,
            chars_per_token: 4,
            compression_keywords: to_strings(&[
                "memory",
                "compressed",
                "summarized",
                "context window",
                "token limit",
            ]),
        }
    }
}

/// Tunable constants for the heuristic judge.
///
/// Empirically tuned; treat as knobs, not correctness constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub detail_keywords: Vec<String>,
    /// Score when the baseline answers contain no detail keywords.
    pub retrieval_neutral: f64,
    pub retrieval_floor: f64,
    pub learning_keywords: Vec<String>,
    /// Keyword density (per 100 words) that maps to a full score.
    pub learning_density_full: f64,
    pub connection_keywords: Vec<String>,
    pub architecture_keywords: Vec<String>,
    pub understanding_divisor: f64,
    pub change_keywords: Vec<String>,
    pub conditional_keywords: Vec<String>,
    pub forgetting_divisor: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            detail_keywords: to_strings(&[
                "function", "method", "class", "variable", "file", "import", "def ", "async ",
                "await", "return", "raise", "except", "if ", "for ", "while ", "with ",
            ]),
            retrieval_neutral: 0.5,
            retrieval_floor: 0.3,
            learning_keywords: to_strings(&[
                "would", "could", "should", "approach", "strategy", "implement", "similar",
                "adapt", "modify", "improve", "optimize", "consider",
            ]),
            learning_density_full: 2.0,
            connection_keywords: to_strings(&[
                "connect",
                "relate",
                "depend",
                "impact",
                "affect",
                "integrate",
                "system",
                "architecture",
                "component",
                "module",
                "service",
                "because",
                "therefore",
                "however",
                "moreover",
                "furthermore",
            ]),
            architecture_keywords: to_strings(&[
                "pattern",
                "design",
                "structure",
                "framework",
                "library",
                "database",
                "api",
                "interface",
                "protocol",
                "service",
            ]),
            understanding_divisor: 10.0,
            change_keywords: to_strings(&[
                "change", "update", "modify", "replace", "remove", "delete", "revert", "undo",
                "preserve", "keep", "maintain", "retain",
            ]),
            conditional_keywords: to_strings(&[
                "if",
                "when",
                "unless",
                "provided",
                "assuming",
                "given",
                "depends",
                "varies",
                "different",
                "alternative",
            ]),
            forgetting_divisor: 8.0,
        }
    }
}

/// Judge selection and model-backed judge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub default_judge: JudgeKind,
    pub model: String,
    /// OpenAI-compatible chat-completions endpoint.
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub temperature: f64,
    pub heuristic: HeuristicConfig,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            default_judge: JudgeKind::Heuristic,
            model: "gpt-4o".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            request_timeout_secs: 120,
            temperature: 0.1,
            heuristic: HeuristicConfig::default(),
        }
    }
}

impl JudgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub session_timeout_secs: u64,
    pub run_timeout_secs: u64,
    /// Time in-flight sessions get to wind down after cancellation.
    pub cancel_grace_secs: u64,
    pub max_deep_dive_iterations: u32,
    pub max_files: usize,
    pub detection: DetectionConfig,
    pub judge: JudgeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 3600,
            run_timeout_secs: 7200,
            cancel_grace_secs: 10,
            max_deep_dive_iterations: 100,
            max_files: 50,
            detection: DetectionConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `MEMBREAK_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        overlay(&lookup, "MEMBREAK_SESSION_TIMEOUT_SECS", &mut cfg.session_timeout_secs)?;
        overlay(&lookup, "MEMBREAK_RUN_TIMEOUT_SECS", &mut cfg.run_timeout_secs)?;
        overlay(&lookup, "MEMBREAK_CANCEL_GRACE_SECS", &mut cfg.cancel_grace_secs)?;
        overlay(&lookup, "MEMBREAK_MAX_TURNS", &mut cfg.max_deep_dive_iterations)?;
        overlay(&lookup, "MEMBREAK_MAX_FILES", &mut cfg.max_files)?;
        overlay(
            &lookup,
            "MEMBREAK_COMPRESSION_THRESHOLD_LOW",
            &mut cfg.detection.threshold_low,
        )?;
        overlay(
            &lookup,
            "MEMBREAK_COMPRESSION_JUMP_THRESHOLD",
            &mut cfg.detection.jump_threshold,
        )?;
        overlay(
            &lookup,
            "MEMBREAK_MAX_CONTEXT_TOKENS",
            &mut cfg.detection.max_context_tokens,
        )?;
        overlay(&lookup, "MEMBREAK_DEFAULT_JUDGE", &mut cfg.judge.default_judge)?;
        overlay(&lookup, "MEMBREAK_JUDGE_MODEL", &mut cfg.judge.model)?;
        overlay(&lookup, "MEMBREAK_JUDGE_ENDPOINT", &mut cfg.judge.endpoint)?;
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            cfg.judge.api_key = Some(key);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.session_timeout_secs == 0 || self.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.max_deep_dive_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_deep_dive_iterations must be at least 1".into(),
            ));
        }
        let d = &self.detection;
        if !(0.0..=100.0).contains(&d.threshold_low) {
            return Err(ConfigError::Invalid(format!(
                "threshold_low must be within 0..=100, got {}",
                d.threshold_low
            )));
        }
        if !(d.jump_threshold > 0.0 && d.jump_threshold <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "jump_threshold must be within (0, 100], got {}",
                d.jump_threshold
            )));
        }
        if !(d.approaching_ratio > 0.0 && d.approaching_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "approaching_ratio must be within (0, 1], got {}",
                d.approaching_ratio
            )));
        }
        if d.max_context_tokens == 0 || d.chars_per_token == 0 || d.step_count_iterations == 0 {
            return Err(ConfigError::Invalid(
                "token budget, chars_per_token and step_count_iterations must be non-zero".into(),
            ));
        }
        let h = &self.judge.heuristic;
        for (name, value) in [
            ("learning_density_full", h.learning_density_full),
            ("understanding_divisor", h.understanding_divisor),
            ("forgetting_divisor", h.forgetting_divisor),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "heuristic {name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

fn overlay<F, T>(lookup: &F, key: &str, slot: &mut T) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })?;
    Ok(())
}

fn to_strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.session_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.run_timeout(), Duration::from_secs(7200));
        assert_eq!(cfg.max_deep_dive_iterations, 100);
        assert_eq!(cfg.detection.threshold_low, 30.0);
        assert_eq!(cfg.detection.jump_threshold, 30.0);
        assert_eq!(cfg.judge.default_judge, JudgeKind::Heuristic);
        assert_eq!(cfg.judge.model, "gpt-4o");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let cfg = OrchestratorConfig::from_lookup(lookup_from(&[
            ("MEMBREAK_SESSION_TIMEOUT_SECS", "60"),
            ("MEMBREAK_MAX_TURNS", "7"),
            ("MEMBREAK_COMPRESSION_THRESHOLD_LOW", "5"),
            ("MEMBREAK_DEFAULT_JUDGE", "model"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(cfg.session_timeout_secs, 60);
        assert_eq!(cfg.max_deep_dive_iterations, 7);
        assert_eq!(cfg.detection.threshold_low, 5.0);
        assert_eq!(cfg.judge.default_judge, JudgeKind::Model);
        assert_eq!(cfg.judge.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_unparsable_env_is_an_error() {
        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "MEMBREAK_RUN_TIMEOUT_SECS",
            "two hours",
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "MEMBREAK_RUN_TIMEOUT_SECS"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let cfg = OrchestratorConfig {
            max_deep_dive_iterations: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let mut cfg = OrchestratorConfig::default();
        cfg.detection.threshold_low = 130.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_heuristic_divisor() {
        let mut cfg = OrchestratorConfig::default();
        cfg.judge.heuristic.forgetting_divisor = 0.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("forgetting_divisor"));

        let mut cfg = OrchestratorConfig::default();
        cfg.judge.heuristic.learning_density_full = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_toml_like_json() {
        let cfg: OrchestratorConfig =
            serde_json::from_str(r#"{"max_files": 10, "detection": {"jump_threshold": 25}}"#)
                .unwrap();
        assert_eq!(cfg.max_files, 10);
        assert_eq!(cfg.detection.jump_threshold, 25.0);
        assert_eq!(cfg.detection.threshold_low, 30.0);
    }
}
