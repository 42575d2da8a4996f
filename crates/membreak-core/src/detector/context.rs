//! Scalar-signal detectors: context-left footers and provider token counters.

use std::sync::OnceLock;

use regex::Regex;

use super::{
    percent_tests, CompressionDetector, DetectionMethod, DetectionResult, Evidence, SessionSignal,
};
use crate::config::DetectionConfig;

static FOOTER: OnceLock<Option<Regex>> = OnceLock::new();

fn footer_regex() -> Option<&'static Regex> {
    FOOTER
        .get_or_init(|| Regex::new(r"(?i)(\d{1,3}(?:\.\d+)?)\s*%\s*context\s+left").ok())
        .as_ref()
}

/// Extract the last `NN% context left` footer from a response.
pub fn parse_context_left(text: &str) -> Option<f64> {
    footer_regex()?
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .filter(|p| (0.0..=100.0).contains(p))
        .last()
}

fn percent_left(signal: &SessionSignal) -> Option<f64> {
    signal
        .context_left_percent
        .or_else(|| parse_context_left(&signal.text))
}

/// Fires on the percent-of-context-remaining reading a provider prints or reports.
#[derive(Debug, Clone)]
pub struct ContextLeftDetector {
    threshold_low: f64,
    jump_threshold: f64,
}

impl ContextLeftDetector {
    pub fn new(cfg: &DetectionConfig) -> Self {
        Self::with_thresholds(cfg.threshold_low, cfg.jump_threshold)
    }

    pub fn with_thresholds(threshold_low: f64, jump_threshold: f64) -> Self {
        Self {
            threshold_low,
            jump_threshold,
        }
    }
}

impl CompressionDetector for ContextLeftDetector {
    fn name(&self) -> &'static str {
        "context-footer"
    }

    fn observe(&self, history: &[SessionSignal]) -> DetectionResult {
        let Some((current, earlier)) = history.split_last() else {
            return DetectionResult::quiet();
        };
        let Some(now) = percent_left(current) else {
            return DetectionResult::quiet();
        };
        let previous = earlier.iter().rev().find_map(percent_left);

        match percent_tests(previous, now, self.threshold_low, self.jump_threshold) {
            Some(method) => DetectionResult::fired(
                method,
                Evidence::Percentages {
                    previous,
                    current: now,
                },
            ),
            None => DetectionResult::quiet(),
        }
    }
}

/// Converts provider token usage into percent remaining of the budget.
///
/// A provider limit flag short-circuits as an `sdk-flag` detection.
#[derive(Debug, Clone)]
pub struct TokenCounterDetector {
    threshold_low: f64,
    jump_threshold: f64,
    budget: u64,
    approaching_ratio: f64,
}

impl TokenCounterDetector {
    pub fn new(cfg: &DetectionConfig) -> Self {
        Self {
            threshold_low: cfg.threshold_low,
            jump_threshold: cfg.jump_threshold,
            budget: cfg.max_context_tokens,
            approaching_ratio: cfg.approaching_ratio,
        }
    }

    fn percent_remaining(&self, used: u64) -> f64 {
        let used = used.min(self.budget) as f64;
        100.0 * (1.0 - used / self.budget as f64)
    }
}

impl CompressionDetector for TokenCounterDetector {
    fn name(&self) -> &'static str {
        "token-counter"
    }

    fn observe(&self, history: &[SessionSignal]) -> DetectionResult {
        let Some((current, earlier)) = history.split_last() else {
            return DetectionResult::quiet();
        };
        if current.limit_reached {
            return DetectionResult::fired(DetectionMethod::SdkFlag, Evidence::Flag);
        }
        let Some(used) = current.tokens_used else {
            return DetectionResult::quiet();
        };
        let previous = earlier.iter().rev().find_map(|s| s.tokens_used);
        let approaching = used as f64 >= self.budget as f64 * self.approaching_ratio;

        let method = percent_tests(
            previous.map(|p| self.percent_remaining(p)),
            self.percent_remaining(used),
            self.threshold_low,
            self.jump_threshold,
        );
        match method {
            Some(method) => DetectionResult::fired(
                method,
                Evidence::Tokens {
                    previous,
                    current: used,
                },
            )
            .approaching(approaching),
            None => DetectionResult::quiet().approaching(approaching),
        }
    }
}
