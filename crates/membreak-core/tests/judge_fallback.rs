//! Judge selection, fallback on bad model output, and the pass/fail law.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use membreak_core::judge::JudgeResult;
use membreak_core::{
    apply_thresholds, JudgeConfig, JudgeError, JudgeInput, JudgeKind, JudgeService, ModelJudge,
    ReasoningClient, RubricDimension, RubricThresholds, FALLBACK_MARKER,
};

struct CannedClient {
    reply: Result<String, String>,
}

#[async_trait]
impl ReasoningClient for CannedClient {
    fn model(&self) -> &str {
        "canned-judge"
    }

    async fn complete(&self, _prompt: &str) -> JudgeResult<String> {
        self.reply.clone().map_err(JudgeError::Transport)
    }
}

fn service(reply: Result<&str, &str>) -> JudgeService {
    let cfg = JudgeConfig::default();
    let client = CannedClient {
        reply: reply.map(str::to_string).map_err(str::to_string),
    };
    JudgeService::with_primary(&cfg, Arc::new(ModelJudge::new(client, &cfg)))
}

fn input() -> JudgeInput {
    JudgeInput {
        questions: vec!["What changed in the parser?".into()],
        pre_answers: vec!["The function parse_header now validates the class Token length.".into()],
        post_answers: vec!["The function parse_header validates length because headers can overflow.".into()],
        rubric: RubricDimension::ALL.to_vec(),
    }
}

#[tokio::test]
async fn test_garbage_output_falls_back_to_heuristic() {
    let out = service(Ok("I think the agent did great!")).evaluate(&input()).await;
    assert_eq!(out.judge_kind, JudgeKind::Heuristic);
    assert!(out.rationale.starts_with(FALLBACK_MARKER));
    assert_eq!(out.scores.len(), 4);
    assert!(out.scores.values().all(|s| (0.0..=1.0).contains(s)));
}

#[tokio::test]
async fn test_transport_error_falls_back_to_heuristic() {
    let out = service(Err("connection reset")).evaluate(&input()).await;
    assert_eq!(out.judge_kind, JudgeKind::Heuristic);
    assert!(out.rationale.contains(FALLBACK_MARKER));
    assert!(out.rationale.contains("connection reset"));
}

#[tokio::test]
async fn test_missing_dimension_falls_back() {
    let reply = r#"{"scores": {"AR": 0.9, "TTL": 0.8, "LRU": 0.7}, "rationale": "partial"}"#;
    let out = service(Ok(reply)).evaluate(&input()).await;
    assert_eq!(out.judge_kind, JudgeKind::Heuristic);
    assert!(out.rationale.contains(FALLBACK_MARKER));
}

#[tokio::test]
async fn test_well_formed_model_output_is_used() {
    let reply = "Here you go:\n```json\n{\"scores\": {\"AR\": 0.9, \"TTL\": 0.5, \"LRU\": 1.4, \"SF\": 0.75}, \"rationale\": \"Recall held up.\"}\n```";
    let out = service(Ok(reply)).evaluate(&input()).await;
    assert_eq!(out.judge_kind, JudgeKind::Model);
    assert_eq!(out.judge_model.as_deref(), Some("canned-judge"));
    assert_eq!(out.rationale, "Recall held up.");
    assert_eq!(out.scores[&RubricDimension::LongRangeUnderstanding], 1.0);

    let verdict = apply_thresholds(&out.scores, &RubricThresholds::default());
    assert!(!verdict.passed());
    assert_eq!(verdict.breaking_dimensions, vec![RubricDimension::TestTimeLearning]);
}

#[tokio::test]
async fn test_heuristic_service_without_api_key() {
    let cfg = JudgeConfig {
        default_judge: JudgeKind::Model,
        api_key: None,
        ..Default::default()
    };
    let judges = JudgeService::from_config(&cfg);
    assert_eq!(judges.primary_kind(), JudgeKind::Heuristic);
    let out = judges.evaluate(&input()).await;
    assert_eq!(out.judge_kind, JudgeKind::Heuristic);
    assert!(!out.rationale.contains(FALLBACK_MARKER));
}

#[test]
fn test_single_breaking_dimension_fails_run() {
    let scores = BTreeMap::from([
        (RubricDimension::AccurateRetrieval, 0.9),
        (RubricDimension::TestTimeLearning, 0.5),
    ]);
    let verdict = apply_thresholds(&scores, &RubricThresholds::default());
    assert!(!verdict.passed());
    assert_eq!(verdict.breaking_dimensions, vec![RubricDimension::TestTimeLearning]);
    assert_eq!(
        verdict.breaking_details[&RubricDimension::TestTimeLearning],
        "TTL: 0.50 < 0.70 (FAILED)"
    );
    assert!((verdict.aggregate - 0.7).abs() < 1e-9);
}

#[test]
fn test_score_equal_to_threshold_passes() {
    let scores = BTreeMap::from([(RubricDimension::SelectiveForgetting, 0.6)]);
    let thresholds = RubricThresholds::new().with(RubricDimension::SelectiveForgetting, 0.6);
    assert!(apply_thresholds(&scores, &thresholds).passed());
}
