//! Ordered combination of detectors; the first one to fire wins.

use super::{CompressionDetector, DetectionResult, SessionSignal};

pub struct CompositeDetector {
    parts: Vec<Box<dyn CompressionDetector>>,
}

impl CompositeDetector {
    pub fn new(parts: Vec<Box<dyn CompressionDetector>>) -> Self {
        Self { parts }
    }
}

impl CompressionDetector for CompositeDetector {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn observe(&self, history: &[SessionSignal]) -> DetectionResult {
        let mut approaching = false;
        for part in &self.parts {
            let result = part.observe(history);
            if result.fired {
                return result.approaching(approaching);
            }
            approaching |= result.approaching_limit;
        }
        DetectionResult::quiet().approaching(approaching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::detector::{DetectionMethod, DetectorKind};

    #[test]
    fn test_flag_wins_over_keyword() {
        let det = DetectorKind::Composite.build(&DetectionConfig::default());
        let s = SessionSignal {
            text: "context window is full".into(),
            limit_reached: true,
            ..Default::default()
        };
        assert_eq!(det.observe(&[s]).method, Some(DetectionMethod::SdkFlag));
    }

    #[test]
    fn test_quiet_keeps_approaching_flag() {
        let det = DetectorKind::Composite.build(&DetectionConfig {
            max_context_tokens: 100,
            ..Default::default()
        });
        let r = det.observe(&[SessionSignal {
            text: "plain analysis".into(),
            estimated_tokens: 92,
            ..Default::default()
        }]);
        assert!(!r.fired);
        assert!(r.approaching_limit);
    }
}
