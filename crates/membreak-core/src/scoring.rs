//! Threshold law shared by every judge.
//!
//! A dimension is breaking iff its score is strictly below its threshold.
//! A verdict passes iff no dimension is breaking: a strict AND across
//! dimensions, never a majority vote.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use membreak_state::{AgentRunRecord, JudgeKind, RubricDimension, RubricThresholds, ScoreRecord};

/// Pass/fail outcome of a set of dimension scores against thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdVerdict {
    pub scores: BTreeMap<RubricDimension, f64>,
    /// Arithmetic mean of `scores`; 0 when empty.
    pub aggregate: f64,
    /// Thresholds actually applied, one per scored dimension.
    pub thresholds: RubricThresholds,
    pub breaking_dimensions: Vec<RubricDimension>,
    pub breaking_details: BTreeMap<RubricDimension, String>,
}

impl ThresholdVerdict {
    pub fn passed(&self) -> bool {
        self.breaking_dimensions.is_empty()
    }

    /// Materialise the immutable score row for an agent run.
    pub fn into_score(
        self,
        agent_run: &AgentRunRecord,
        judge_kind: JudgeKind,
        judge_model: Option<String>,
        rationale: String,
    ) -> ScoreRecord {
        let passed = self.passed();
        ScoreRecord {
            agent_run_id: agent_run.id,
            run_id: agent_run.run_id,
            agent_kind: agent_run.agent_kind.clone(),
            scores: self.scores,
            aggregate: self.aggregate,
            thresholds: self.thresholds,
            breaking_dimensions: self.breaking_dimensions,
            breaking_details: self.breaking_details,
            passed,
            judge_kind,
            judge_model,
            rationale,
            created_at: Utc::now(),
        }
    }
}

/// Apply `thresholds` to `scores`.
pub fn apply_thresholds(
    scores: &BTreeMap<RubricDimension, f64>,
    thresholds: &RubricThresholds,
) -> ThresholdVerdict {
    let aggregate = if scores.is_empty() {
        0.0
    } else {
        scores.values().sum::<f64>() / scores.len() as f64
    };

    let mut breaking_dimensions = Vec::new();
    let mut breaking_details = BTreeMap::new();
    for (dim, score) in scores {
        let threshold = thresholds.get(*dim);
        if *score < threshold {
            breaking_dimensions.push(*dim);
            breaking_details.insert(
                *dim,
                format!("{}: {:.2} < {:.2} (FAILED)", dim.code(), score, threshold),
            );
        }
    }

    let dims: Vec<RubricDimension> = scores.keys().copied().collect();
    ThresholdVerdict {
        scores: scores.clone(),
        aggregate,
        thresholds: thresholds.resolved(&dims),
        breaking_dimensions,
        breaking_details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RubricDimension::*;

    #[test]
    fn test_one_breaking_dimension_fails_the_verdict() {
        let scores = BTreeMap::from([(AccurateRetrieval, 0.9), (TestTimeLearning, 0.5)]);
        let thresholds = RubricThresholds::new()
            .with(AccurateRetrieval, 0.7)
            .with(TestTimeLearning, 0.7);

        let v = apply_thresholds(&scores, &thresholds);
        assert!(!v.passed());
        assert_eq!(v.breaking_dimensions, vec![TestTimeLearning]);
        assert_eq!(v.breaking_details[&TestTimeLearning], "TTL: 0.50 < 0.70 (FAILED)");
        assert!((v.aggregate - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_score_equal_to_threshold_passes() {
        let scores = BTreeMap::from([(SelectiveForgetting, 0.7)]);
        let v = apply_thresholds(&scores, &RubricThresholds::default());
        assert!(v.passed());
        assert_eq!(v.thresholds.get(SelectiveForgetting), 0.7);
    }

    #[test]
    fn test_empty_scores() {
        let v = apply_thresholds(&BTreeMap::new(), &RubricThresholds::default());
        assert_eq!(v.aggregate, 0.0);
        assert!(v.passed());
    }
}
