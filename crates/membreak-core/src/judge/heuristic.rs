//! Keyword-density heuristic judge.

use std::collections::BTreeMap;

use async_trait::async_trait;

use membreak_state::{JudgeKind, RubricDimension};

use super::{Judge, JudgeError, JudgeInput, JudgeOutput, JudgeResult, FALLBACK_MARKER};
use crate::config::HeuristicConfig;

/// Deterministic, dependency-free judge.
#[derive(Debug, Clone)]
pub struct HeuristicJudge {
    cfg: HeuristicConfig,
}

impl Default for HeuristicJudge {
    fn default() -> Self {
        Self::new(HeuristicConfig::default())
    }
}

impl HeuristicJudge {
    /// Keywords are matched case-insensitively against lowercased answers.
    pub fn new(mut cfg: HeuristicConfig) -> Self {
        for keywords in [
            &mut cfg.detail_keywords,
            &mut cfg.learning_keywords,
            &mut cfg.connection_keywords,
            &mut cfg.architecture_keywords,
            &mut cfg.change_keywords,
            &mut cfg.conditional_keywords,
        ] {
            for keyword in keywords.iter_mut() {
                *keyword = keyword.to_lowercase();
            }
        }
        Self { cfg }
    }

    /// Score every requested dimension.
    pub fn score(&self, input: &JudgeInput) -> JudgeOutput {
        let pre = joined_lower(&input.pre_answers);
        let post = joined_lower(&input.post_answers);

        let mut scores = BTreeMap::new();
        let mut lines = Vec::with_capacity(input.rubric.len());
        for dim in &input.rubric {
            let (score, why) = match dim {
                RubricDimension::AccurateRetrieval => self.retrieval(&pre, &post),
                RubricDimension::TestTimeLearning => self.learning(&post),
                RubricDimension::LongRangeUnderstanding => self.understanding(&post),
                RubricDimension::SelectiveForgetting => self.forgetting(&post),
            };
            scores.insert(*dim, score.clamp(0.0, 1.0));
            lines.push(format!("{}: {}", dim.code(), why));
        }

        JudgeOutput {
            scores,
            rationale: lines.join("\n"),
            judge_kind: JudgeKind::Heuristic,
            judge_model: None,
        }
    }

    /// Heuristic verdict with the rationale marked as a fallback.
    pub fn fallback_for(&self, input: &JudgeInput, cause: &JudgeError) -> JudgeOutput {
        let mut out = self.score(input);
        out.rationale = format!("{FALLBACK_MARKER}: {cause}\n{}", out.rationale);
        out
    }

    fn retrieval(&self, pre: &str, post: &str) -> (f64, String) {
        let before = count_keywords(pre, &self.cfg.detail_keywords);
        let after = count_keywords(post, &self.cfg.detail_keywords);
        if before == 0 {
            return (
                self.cfg.retrieval_neutral,
                "No specific details found in pre-compression answers".to_string(),
            );
        }
        let ratio = after as f64 / before as f64;
        let score = self.cfg.retrieval_floor + (1.0 - self.cfg.retrieval_floor) * ratio.min(1.0);
        (
            score,
            format!(
                "Retained {after}/{before} specific details ({:.2}%)",
                ratio * 100.0
            ),
        )
    }

    fn learning(&self, post: &str) -> (f64, String) {
        let words = post.split_whitespace().count();
        if words == 0 {
            return (0.0, "No answers provided".to_string());
        }
        let hits = count_keywords(post, &self.cfg.learning_keywords);
        let density = hits as f64 / words as f64 * 100.0;
        let score = (density / self.cfg.learning_density_full).min(1.0);
        (
            score,
            format!("Learning indicators: {hits} in {words} words ({density:.1}%)"),
        )
    }

    fn understanding(&self, post: &str) -> (f64, String) {
        let connections = count_keywords(post, &self.cfg.connection_keywords);
        let arch = count_keywords(post, &self.cfg.architecture_keywords);
        let score = ((connections + arch) as f64 / self.cfg.understanding_divisor).min(1.0);
        (
            score,
            format!("Connection indicators: {connections}, Architecture terms: {arch}"),
        )
    }

    fn forgetting(&self, post: &str) -> (f64, String) {
        let changes = count_keywords(post, &self.cfg.change_keywords);
        let conditionals = count_keywords(post, &self.cfg.conditional_keywords);
        let score = ((changes + conditionals) as f64 / self.cfg.forgetting_divisor).min(1.0);
        (
            score,
            format!("Change indicators: {changes}, Conditionals: {conditionals}"),
        )
    }
}

#[async_trait]
impl Judge for HeuristicJudge {
    fn kind(&self) -> JudgeKind {
        JudgeKind::Heuristic
    }

    async fn evaluate(&self, input: &JudgeInput) -> JudgeResult<JudgeOutput> {
        Ok(self.score(input))
    }
}

fn joined_lower(answers: &[String]) -> String {
    answers.join(" ").to_lowercase()
}

/// Total non-overlapping substring occurrences of every keyword.
fn count_keywords(text: &str, keywords: &[String]) -> usize {
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| text.matches(k.as_str()).count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use RubricDimension::*;

    fn input(pre: &[&str], post: &[&str], rubric: &[RubricDimension]) -> JudgeInput {
        JudgeInput {
            questions: vec!["q".into(); pre.len().max(post.len())],
            pre_answers: pre.iter().map(|s| s.to_string()).collect(),
            post_answers: post.iter().map(|s| s.to_string()).collect(),
            rubric: rubric.to_vec(),
        }
    }

    #[test]
    fn test_retrieval_neutral_without_baseline_details() {
        let out = HeuristicJudge::default().score(&input(
            &["nothing"],
            &["nothing"],
            &[AccurateRetrieval],
        ));
        assert_eq!(out.scores[&AccurateRetrieval], 0.5);
    }

    #[test]
    fn test_retrieval_scales_with_retained_details() {
        // pre: "function" + "class" = 2, post: "function" = 1
        let out = HeuristicJudge::default().score(&input(
            &["the function and the class"],
            &["a function"],
            &[AccurateRetrieval],
        ));
        assert!((out.scores[&AccurateRetrieval] - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_configured_keywords_match_regardless_of_case() {
        let cfg = HeuristicConfig {
            detail_keywords: vec!["Function".into(), "CLASS".into()],
            ..Default::default()
        };
        let out = HeuristicJudge::new(cfg).score(&input(
            &["The Function and the class"],
            &["a FUNCTION"],
            &[AccurateRetrieval],
        ));
        assert!((out.scores[&AccurateRetrieval] - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_learning_empty_answers_score_zero() {
        let out = HeuristicJudge::default().score(&input(&[], &[], &[TestTimeLearning]));
        assert_eq!(out.scores[&TestTimeLearning], 0.0);
        assert!(out.rationale.contains("No answers provided"));
    }

    #[test]
    fn test_learning_density_saturates() {
        let out = HeuristicJudge::default().score(&input(
            &[],
            &["we could adapt this approach"],
            &[TestTimeLearning],
        ));
        assert_eq!(out.scores[&TestTimeLearning], 1.0);
    }

    #[test]
    fn test_understanding_and_forgetting_divisors() {
        let out = HeuristicJudge::default().score(&input(
            &[],
            &["the module and the database api"],
            &[LongRangeUnderstanding, SelectiveForgetting],
        ));
        assert!((out.scores[&LongRangeUnderstanding] - 0.3).abs() < 1e-9);
        assert_eq!(out.scores[&SelectiveForgetting], 0.0);
    }

    #[test]
    fn test_only_requested_dimensions_scored() {
        let out = HeuristicJudge::default().score(&input(&["a"], &["b"], &[SelectiveForgetting]));
        assert_eq!(out.scores.len(), 1);
        assert!(out.rationale.starts_with("SF: "));
    }

    #[test]
    fn test_fallback_rationale_is_marked() {
        let out = HeuristicJudge::default().fallback_for(
            &input(&["a"], &["b"], &[AccurateRetrieval]),
            &JudgeError::Malformed("no json".into()),
        );
        assert!(out.rationale.starts_with(FALLBACK_MARKER));
        assert_eq!(out.judge_kind, JudgeKind::Heuristic);
    }
}
