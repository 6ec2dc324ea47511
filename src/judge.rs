//! Rubric-based judging of preference pairs.
//!
//! The judge scores each side of a pair independently: one structured call
//! for the chosen response, one for the rejected response, sequential
//! within an evaluation. Whatever criteria the model returns are accepted
//! verbatim; we compute per-side means and the signed margin between them.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::time;

use crate::{
    client::CompletionApi,
    config::ModelConfig,
    json_repair,
    prelude::*,
    template,
    wire::ChatMessage,
};

/// Scores are interpreted on a 1..=5 scale; out-of-range values are kept
/// in the record but clamped when averaging.
const SCORE_MIN: f64 = 1.0;
const SCORE_MAX: f64 = 5.0;

/// One criterion's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    pub reasoning: String,
}

/// The judged outcome for one preference pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub chosen: BTreeMap<String, CriterionScore>,
    pub rejected: BTreeMap<String, CriterionScore>,
    pub chosen_mean: f64,
    pub rejected_mean: f64,
    /// `chosen_mean - rejected_mean`; positive means the chosen side
    /// dominates.
    pub margin: f64,
}

impl JudgeResult {
    pub fn new(
        chosen: BTreeMap<String, CriterionScore>,
        rejected: BTreeMap<String, CriterionScore>,
    ) -> Self {
        let chosen_mean = mean_score(&chosen);
        let rejected_mean = mean_score(&rejected);
        Self {
            margin: chosen_mean - rejected_mean,
            chosen,
            rejected,
            chosen_mean,
            rejected_mean,
        }
    }
}

fn mean_score(scores: &BTreeMap<String, CriterionScore>) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let total: f64 = scores
        .values()
        .map(|entry| entry.score.clamp(SCORE_MIN, SCORE_MAX))
        .sum();
    total / scores.len() as f64
}

/// The judge evaluator.
pub struct Judge {
    api: Arc<dyn CompletionApi>,
    spec: ModelConfig,
    rubric: String,
    system: Option<String>,
    timeout: Duration,
}

impl Judge {
    pub fn new(
        api: Arc<dyn CompletionApi>,
        spec: ModelConfig,
        rubric: String,
        system: Option<String>,
    ) -> Self {
        let timeout = spec.judge_timeout();
        Self {
            api,
            spec,
            rubric,
            system,
            timeout,
        }
    }

    /// Score both sides of a pair and compute the margin.
    pub async fn evaluate(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        chosen: &str,
        rejected: &str,
    ) -> Result<JudgeResult> {
        let chosen_scores = self
            .score_response(cancel, prompt, chosen)
            .await
            .context("judging the chosen response")?;
        let rejected_scores = self
            .score_response(cancel, prompt, rejected)
            .await
            .context("judging the rejected response")?;
        Ok(JudgeResult::new(chosen_scores, rejected_scores))
    }

    async fn score_response(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        response: &str,
    ) -> Result<BTreeMap<String, CriterionScore>> {
        let bindings = BTreeMap::from([
            ("prompt", prompt.to_owned()),
            ("response", response.to_owned()),
        ]);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(template::render(system, &bindings)));
        }
        messages.push(ChatMessage::user(template::render(&self.rubric, &bindings)));

        let call = self
            .api
            .chat_completion_structured(&self.spec, &messages, cancel);
        let reply = time::timeout(self.timeout, call)
            .await
            .map_err(|_| anyhow!("judge call timed out after {:?}", self.timeout))?
            .context("judge call failed")?;

        let value = json_repair::recover_json(&reply.content)
            .context("judge returned unrecoverable JSON")?;
        parse_score_map(&value)
    }
}

/// Read a `criterion -> {score, reasoning}` map out of whatever object the
/// model produced. The criteria set is not validated.
fn parse_score_map(value: &Value) -> Result<BTreeMap<String, CriterionScore>> {
    let object = value
        .as_object()
        .with_context(|| format!("expected a JSON object of criteria, got: {}", value))?;
    let mut scores = BTreeMap::new();
    for (criterion, entry) in object {
        let score = entry
            .get("score")
            .and_then(coerce_number)
            .with_context(|| format!("criterion {:?} has no numeric score", criterion))?;
        let reasoning = entry
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        scores.insert(criterion.clone(), CriterionScore { score, reasoning });
    }
    if scores.is_empty() {
        bail!("judge returned an empty criteria object");
    }
    Ok(scores)
}

/// Models sometimes quote their numbers.
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
