//! Model-backed judge over an OpenAI-compatible chat-completions service.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use membreak_state::{JudgeKind, RubricDimension};

use super::{HeuristicJudge, Judge, JudgeError, JudgeInput, JudgeOutput, JudgeResult};
use crate::config::JudgeConfig;

/// Text-in, text-out access to an external reasoning service.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str) -> JudgeResult<String>;
}

/// `reqwest` client for `/v1/chat/completions`-style endpoints.
pub struct HttpReasoningClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
}

impl HttpReasoningClient {
    pub fn from_config(cfg: &JudgeConfig) -> JudgeResult<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .ok_or_else(|| JudgeError::Unavailable("no API key configured".into()))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("membreak/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.request_timeout())
            .build()?;
        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> JudgeResult<String> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": 2000,
            "messages": [{"role": "user", "content": prompt}],
        });
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(JudgeError::Transport(format!("HTTP {status}: {text}")));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| JudgeError::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| JudgeError::Malformed("response has no message content".into()))
    }
}

/// Judge that asks a reasoning service for structured scores.
///
/// Any transport or parse failure yields the heuristic verdict with a
/// marked rationale, so `evaluate` never returns `Err`.
pub struct ModelJudge<C> {
    client: C,
    fallback: HeuristicJudge,
}

impl<C: ReasoningClient> ModelJudge<C> {
    pub fn new(client: C, cfg: &JudgeConfig) -> Self {
        Self {
            client,
            fallback: HeuristicJudge::new(cfg.heuristic.clone()),
        }
    }

    /// Query the service without falling back.
    pub async fn try_evaluate(&self, input: &JudgeInput) -> JudgeResult<JudgeOutput> {
        let prompt = render_prompt(input);
        let raw = self.client.complete(&prompt).await?;
        debug!(model = %self.client.model(), bytes = raw.len(), "judge response received");
        let (scores, rationale) = parse_model_output(&raw, &input.rubric)?;
        Ok(JudgeOutput {
            scores,
            rationale,
            judge_kind: JudgeKind::Model,
            judge_model: Some(self.client.model().to_string()),
        })
    }
}

#[async_trait]
impl<C: ReasoningClient> Judge for ModelJudge<C> {
    fn kind(&self) -> JudgeKind {
        JudgeKind::Model
    }

    async fn evaluate(&self, input: &JudgeInput) -> JudgeResult<JudgeOutput> {
        match self.try_evaluate(input).await {
            Ok(out) => Ok(out),
            Err(e) => {
                crate::obs::emit_judge_fallback(&e);
                crate::metrics::METRICS.inc_judge_fallbacks();
                Ok(self.fallback.fallback_for(input, &e))
            }
        }
    }
}

/// Evaluation prompt: rubric, question/answer triples, JSON response shape.
pub fn render_prompt(input: &JudgeInput) -> String {
    let mut out = String::new();
    out.push_str("# AI Agent Memory-Break Evaluation\n\n");
    out.push_str(
        "You are evaluating an AI agent's performance before and after a memory compression event.\n\n",
    );
    out.push_str("## Rubric Dimensions:\n");
    for dim in &input.rubric {
        out.push_str(&format!("- **{}**: {}\n", dim.code(), dim.description()));
    }
    out.push_str("\n## Questions and Answers:\n\n");
    for (i, question) in input.questions.iter().enumerate() {
        let pre = input.pre_answers.get(i).map_or("No answer", String::as_str);
        let post = input.post_answers.get(i).map_or("No answer", String::as_str);
        out.push_str(&format!("### Question {}: {}\n\n", i + 1, question));
        out.push_str(&format!("**Pre-compression answer**: {pre}\n\n"));
        out.push_str(&format!("**Post-compression answer**: {post}\n\n"));
    }
    out.push_str("## Instructions:\n\n");
    out.push_str(
        "Evaluate the agent on each rubric dimension by comparing the pre and post compression answers.\n",
    );
    out.push_str("Provide a score from 0.0 to 1.0 for each dimension, where:\n");
    out.push_str("- 0.0 = Complete failure\n- 0.5 = Moderate performance\n- 1.0 = Excellent performance\n\n");
    out.push_str("Format your response as JSON:\n```json\n{\n  \"scores\": {\n");
    let last = input.rubric.len().saturating_sub(1);
    for (i, dim) in input.rubric.iter().enumerate() {
        let comma = if i < last { "," } else { "" };
        out.push_str(&format!("    \"{}\": 0.0{comma}\n", dim.code()));
    }
    out.push_str("  },\n  \"rationale\": \"Detailed explanation of the scoring...\"\n}\n```\n");
    out
}

static FENCED: OnceLock<Option<Regex>> = OnceLock::new();
static BARE: OnceLock<Option<Regex>> = OnceLock::new();

fn extract_json(raw: &str) -> Option<&str> {
    let fenced = FENCED
        .get_or_init(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").ok())
        .as_ref();
    if let Some(c) = fenced.and_then(|re| re.captures(raw)) {
        return c.get(1).map(|m| m.as_str());
    }
    BARE.get_or_init(|| Regex::new(r"(?s)\{.*\}").ok())
        .as_ref()?
        .find(raw)
        .map(|m| m.as_str())
}

#[derive(Deserialize)]
struct ModelVerdict {
    scores: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Parse a model response into clamped scores for exactly `rubric`.
///
/// A requested dimension that is absent or non-numeric is malformed output.
pub fn parse_model_output(
    raw: &str,
    rubric: &[RubricDimension],
) -> JudgeResult<(BTreeMap<RubricDimension, f64>, String)> {
    let json = extract_json(raw)
        .ok_or_else(|| JudgeError::Malformed("no JSON found in response".into()))?;
    let verdict: ModelVerdict =
        serde_json::from_str(json).map_err(|e| JudgeError::Malformed(e.to_string()))?;

    let mut by_dim = BTreeMap::new();
    for (key, value) in &verdict.scores {
        if let Ok(dim) = key.parse::<RubricDimension>() {
            by_dim.insert(dim, value);
        }
    }

    let mut scores = BTreeMap::new();
    for dim in rubric {
        let value = by_dim
            .get(dim)
            .ok_or(JudgeError::MissingDimension(*dim))?;
        let score = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|s: &f64| s.is_finite())
            .ok_or_else(|| JudgeError::Malformed(format!("score for {dim} is not a number")))?;
        scores.insert(*dim, score.clamp(0.0, 1.0));
    }

    let rationale = verdict
        .rationale
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "No rationale provided".to_string());
    Ok((scores, rationale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use RubricDimension::*;

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Here you go:\n```json\n{\"scores\": {\"AR\": 0.8, \"TTL\": 1.4}, \"rationale\": \"solid\"}\n```";
        let (scores, rationale) = parse_model_output(raw, &[AccurateRetrieval, TestTimeLearning]).unwrap();
        assert_eq!(scores[&AccurateRetrieval], 0.8);
        assert_eq!(scores[&TestTimeLearning], 1.0);
        assert_eq!(rationale, "solid");
    }

    #[test]
    fn test_parse_bare_json() {
        let raw = "{\"scores\": {\"sf\": \"0.25\"}}";
        let (scores, rationale) = parse_model_output(raw, &[SelectiveForgetting]).unwrap();
        assert_eq!(scores[&SelectiveForgetting], 0.25);
        assert_eq!(rationale, "No rationale provided");
    }

    #[test]
    fn test_missing_dimension_is_an_error() {
        let raw = "{\"scores\": {\"AR\": 0.9}}";
        let err = parse_model_output(raw, &[AccurateRetrieval, LongRangeUnderstanding]).unwrap_err();
        assert!(matches!(err, JudgeError::MissingDimension(LongRangeUnderstanding)));
    }

    #[test]
    fn test_no_json_is_malformed() {
        let err = parse_model_output("I refuse.", &[AccurateRetrieval]).unwrap_err();
        assert!(matches!(err, JudgeError::Malformed(_)));
    }

    #[test]
    fn test_prompt_lists_rubric_and_answers() {
        let prompt = render_prompt(&JudgeInput {
            questions: vec!["What changed?".into(), "Why?".into()],
            pre_answers: vec!["the parser".into()],
            post_answers: vec![],
            rubric: vec![AccurateRetrieval, SelectiveForgetting],
        });
        assert!(prompt.contains("- **AR**: Accurate Retrieval"));
        assert!(prompt.contains("### Question 2: Why?"));
        assert!(prompt.contains("**Pre-compression answer**: the parser"));
        assert!(prompt.contains("**Post-compression answer**: No answer"));
        assert!(prompt.contains("\"AR\": 0.0,\n    \"SF\": 0.0\n"));
    }
}
