//! Detectors for agents that expose no scalar context reading.

use super::{CompressionDetector, DetectionMethod, DetectionResult, Evidence, SessionSignal};
use crate::config::DetectionConfig;

/// Assume compression after a fixed number of deep-dive iterations.
#[derive(Debug, Clone)]
pub struct StepCountDetector {
    limit: u32,
}

impl StepCountDetector {
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }
}

impl CompressionDetector for StepCountDetector {
    fn name(&self) -> &'static str {
        "step-count"
    }

    fn observe(&self, history: &[SessionSignal]) -> DetectionResult {
        match history.last() {
            Some(s) if s.iteration >= self.limit => DetectionResult::fired(
                DetectionMethod::StepCount,
                Evidence::Iterations {
                    count: s.iteration,
                    limit: self.limit,
                },
            ),
            _ => DetectionResult::quiet(),
        }
    }
}

/// Provider explicitly reported hitting its token/response limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderFlagDetector;

impl CompressionDetector for ProviderFlagDetector {
    fn name(&self) -> &'static str {
        "provider-flag"
    }

    fn observe(&self, history: &[SessionSignal]) -> DetectionResult {
        match history.last() {
            Some(s) if s.limit_reached => {
                DetectionResult::fired(DetectionMethod::SdkFlag, Evidence::Flag)
            }
            _ => DetectionResult::quiet(),
        }
    }
}

/// The agent mentions its memory being compacted.
#[derive(Debug, Clone)]
pub struct KeywordDetector {
    keywords: Vec<String>,
}

impl KeywordDetector {
    pub fn new(cfg: &DetectionConfig) -> Self {
        Self {
            keywords: cfg
                .compression_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }
}

impl CompressionDetector for KeywordDetector {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn observe(&self, history: &[SessionSignal]) -> DetectionResult {
        let Some(current) = history.last() else {
            return DetectionResult::quiet();
        };
        let text = current.text.to_lowercase();
        match self.keywords.iter().find(|k| text.contains(k.as_str())) {
            Some(keyword) => DetectionResult::fired(
                DetectionMethod::KeywordHeuristic,
                Evidence::Keyword {
                    keyword: keyword.clone(),
                },
            ),
            None => DetectionResult::quiet(),
        }
    }
}

/// Character-derived token estimate crossing the context budget.
#[derive(Debug, Clone)]
pub struct TokenEstimateDetector {
    budget: u64,
    approaching_ratio: f64,
}

impl TokenEstimateDetector {
    pub fn new(cfg: &DetectionConfig) -> Self {
        Self {
            budget: cfg.max_context_tokens,
            approaching_ratio: cfg.approaching_ratio,
        }
    }
}

impl CompressionDetector for TokenEstimateDetector {
    fn name(&self) -> &'static str {
        "token-estimate"
    }

    fn observe(&self, history: &[SessionSignal]) -> DetectionResult {
        let Some(current) = history.last() else {
            return DetectionResult::quiet();
        };
        let estimated = current.estimated_tokens;
        if estimated >= self.budget {
            return DetectionResult::fired(
                DetectionMethod::TokenEstimate,
                Evidence::Estimate {
                    estimated,
                    budget: self.budget,
                },
            );
        }
        let approaching = estimated as f64 >= self.budget as f64 * self.approaching_ratio;
        DetectionResult::quiet().approaching(approaching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(iteration: u32) -> SessionSignal {
        SessionSignal {
            iteration,
            ..Default::default()
        }
    }

    #[test]
    fn test_step_count_fires_on_limit() {
        let det = StepCountDetector::new(3);
        assert!(!det.observe(&[at(1), at(2)]).fired);
        let r = det.observe(&[at(1), at(2), at(3)]);
        assert_eq!(r.method, Some(DetectionMethod::StepCount));
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let det = KeywordDetector::new(&DetectionConfig::default());
        let s = SessionSignal {
            text: "My earlier notes were SUMMARIZED to save space".into(),
            ..Default::default()
        };
        let r = det.observe(&[s]);
        assert_eq!(
            r.evidence,
            Some(Evidence::Keyword {
                keyword: "summarized".into()
            })
        );
    }

    #[test]
    fn test_estimate_warns_then_fires() {
        let det = TokenEstimateDetector::new(&DetectionConfig {
            max_context_tokens: 100,
            ..Default::default()
        });
        let warn = det.observe(&[SessionSignal {
            estimated_tokens: 95,
            ..Default::default()
        }]);
        assert!(!warn.fired);
        assert!(warn.approaching_limit);

        let fire = det.observe(&[SessionSignal {
            estimated_tokens: 100,
            ..Default::default()
        }]);
        assert_eq!(fire.method, Some(DetectionMethod::TokenEstimate));
    }
}
