//! Compression detectors replayed over recorded reading sequences.

use membreak_core::detector::{parse_context_left, Evidence, SessionSignal};
use membreak_core::{
    CompressionDetector, ContextLeftDetector, DetectionConfig, DetectionMethod, DetectorKind,
};

fn footers(readings: &[f64]) -> Vec<SessionSignal> {
    readings
        .iter()
        .enumerate()
        .map(|(i, pct)| SessionSignal {
            iteration: i as u32 + 1,
            text: format!("...analysis...\n[{pct}% context left]"),
            ..Default::default()
        })
        .collect()
}

/// Feed readings one at a time; return the 1-based index of the first
/// firing and the method that fired.
fn first_firing(detector: &dyn CompressionDetector, signals: &[SessionSignal]) -> Option<(usize, DetectionMethod)> {
    (1..=signals.len()).find_map(|n| {
        let result = detector.observe(&signals[..n]);
        result.fired.then(|| (n, result.method.unwrap()))
    })
}

#[test]
fn test_low_water_mark_wins_over_jump() {
    let detector = ContextLeftDetector::with_thresholds(30.0, 30.0);
    assert_eq!(
        first_firing(&detector, &footers(&[80.0, 75.0, 20.0])),
        Some((3, DetectionMethod::ThresholdFooter))
    );
}

#[test]
fn test_context_freed_up_fires_jump() {
    let detector = ContextLeftDetector::with_thresholds(5.0, 30.0);
    let signals = footers(&[40.0, 10.0, 45.0]);
    assert_eq!(first_firing(&detector, &signals), Some((3, DetectionMethod::TokenJump)));

    let result = detector.observe(&signals);
    assert_eq!(
        result.evidence,
        Some(Evidence::Percentages {
            previous: Some(10.0),
            current: 45.0
        })
    );
}

#[test]
fn test_steady_decline_never_fires() {
    let detector = ContextLeftDetector::with_thresholds(30.0, 30.0);
    assert_eq!(first_firing(&detector, &footers(&[95.0, 90.0, 70.0, 50.0, 35.0])), None);
}

#[test]
fn test_footer_parse_takes_last_occurrence() {
    assert_eq!(parse_context_left("[60% context left] ... [12.5% Context Left]"), Some(12.5));
    assert_eq!(parse_context_left("no footer here"), None);
}

#[test]
fn test_token_counter_converts_usage_to_percent() {
    let cfg = DetectionConfig {
        max_context_tokens: 1000,
        ..Default::default()
    };
    let detector = DetectorKind::TokenCounter.build(&cfg);
    let signals: Vec<SessionSignal> = [100u64, 300, 750]
        .iter()
        .enumerate()
        .map(|(i, used)| SessionSignal {
            iteration: i as u32 + 1,
            tokens_used: Some(*used),
            ..Default::default()
        })
        .collect();
    // 25% left at the third reading is under the default mark of 30.
    assert_eq!(
        first_firing(detector.as_ref(), &signals),
        Some((3, DetectionMethod::ThresholdFooter))
    );
}

#[test]
fn test_token_counter_honours_provider_limit_flag() {
    let detector = DetectorKind::TokenCounter.build(&DetectionConfig::default());
    let signals = vec![SessionSignal {
        iteration: 1,
        tokens_used: Some(10),
        limit_reached: true,
        ..Default::default()
    }];
    assert_eq!(first_firing(detector.as_ref(), &signals), Some((1, DetectionMethod::SdkFlag)));
}

#[test]
fn test_composite_falls_through_to_keywords() {
    let detector = DetectorKind::Composite.build(&DetectionConfig::default());
    let signals = vec![
        SessionSignal {
            iteration: 1,
            text: "Walking through the parser.".into(),
            ..Default::default()
        },
        SessionSignal {
            iteration: 2,
            text: "Earlier turns were summarized to save space.".into(),
            ..Default::default()
        },
    ];
    assert_eq!(
        first_firing(detector.as_ref(), &signals),
        Some((2, DetectionMethod::KeywordHeuristic))
    );
}

#[test]
fn test_default_detector_per_agent_kind() {
    use membreak_core::AgentKind;
    assert_eq!(DetectorKind::default_for(&AgentKind::new("Claude")), DetectorKind::TokenCounter);
    assert_eq!(DetectorKind::default_for(&AgentKind::new("gemini")), DetectorKind::ContextFooter);
    assert_eq!(DetectorKind::default_for(&AgentKind::new("iflow")), DetectorKind::Composite);
    assert_eq!(DetectorKind::default_for(&AgentKind::new("codex")), DetectorKind::StepCount);
}
