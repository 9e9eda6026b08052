//! Inference gateway: prompt in, parsed judgment out.
//!
//! The reply contract is a JSON object `{"reasoning": ..., "choice": ...}`.
//! Choice literals are not enforced here; anything other than Left/Right is
//! kept verbatim as [`Choice::Other`] so the validator can flag it.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::prompts::PromptInstance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    Left,
    Right,
    /// Anything the model answered that is not Left or Right.
    Other(String),
}

impl Choice {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("left") {
            Choice::Left
        } else if trimmed.eq_ignore_ascii_case("right") {
            Choice::Right
        } else {
            Choice::Other(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Choice::Left => "Left",
            Choice::Right => "Right",
            Choice::Other(s) => s,
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    pub reasoning: String,
    pub choice: Choice,
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("parse error: {0}")]
    Parse(String),
    /// Every unit of a non-empty batch failed at the transport level.
    #[error("entire batch of {units} failed: {last}")]
    BatchFailed { units: usize, last: String },
}

/// Gateway seam between the runner and the model.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn invoke(&self, prompt: &PromptInstance) -> Result<Judgment, JudgeError>;

    /// One result per prompt, in input order.
    ///
    /// The outer error means the whole batch failed and nothing in it is
    /// worth persisting.
    async fn batch(
        &self,
        prompts: &[PromptInstance],
    ) -> Result<Vec<Result<Judgment, JudgeError>>, JudgeError>;

    /// Provider spend so far, in nanodollars.
    fn spent_nanodollars(&self) -> i64 {
        0
    }
}

// =============================================================================
// Reply parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct JudgmentJson {
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    choice: Option<String>,
}

pub fn parse_judgment(raw: &str) -> Result<Judgment, JudgeError> {
    let json_str = extract_json(raw);
    let parsed: JudgmentJson =
        serde_json::from_str(json_str).map_err(|e| JudgeError::Parse(e.to_string()))?;

    let choice = parsed
        .choice
        .ok_or_else(|| JudgeError::Parse("missing 'choice'".into()))?;

    Ok(Judgment {
        reasoning: parsed.reasoning.unwrap_or_default(),
        choice: Choice::parse(&choice),
    })
}

/// First balanced `{...}` object in the reply (models sometimes wrap JSON in
/// prose or code fences).
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    let remainder = &trimmed[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }
    trimmed
}

// =============================================================================
// LLM judge
// =============================================================================

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// In-flight requests within one batch.
    pub concurrency: usize,
    pub call_timeout: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "google/gemini-2.0-flash-001".into(),
            temperature: 1.0,
            max_tokens: Some(512),
            concurrency: 8,
            call_timeout: Duration::from_secs(120),
        }
    }
}

pub struct LlmJudge {
    gateway: Arc<dyn ChatGateway>,
    config: JudgeConfig,
    run_id: Option<Uuid>,
    spent: AtomicI64,
}

impl LlmJudge {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: JudgeConfig) -> Self {
        Self {
            gateway,
            config,
            run_id: None,
            spent: AtomicI64::new(0),
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    fn request(&self, prompt: &PromptInstance) -> ChatRequest {
        let mut attribution = Attribution::new("judge::invoke");
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        let req = ChatRequest::new(
            ChatModel::openrouter(&self.config.model),
            prompt.to_messages(),
            attribution,
        )
        .temperature(self.config.temperature)
        .json();
        match self.config.max_tokens {
            Some(max) => req.max_tokens(max),
            None => req,
        }
    }
}

#[async_trait]
impl InferenceGateway for LlmJudge {
    async fn invoke(&self, prompt: &PromptInstance) -> Result<Judgment, JudgeError> {
        let deadline = self.config.call_timeout;
        let resp = tokio::time::timeout(deadline, self.gateway.chat(self.request(prompt)))
            .await
            .map_err(|_| ProviderError::Timeout(deadline, None))??;

        let cost = resp
            .upstream_cost_nanodollars
            .unwrap_or(resp.cost_nanodollars);
        self.spent.fetch_add(cost, Ordering::Relaxed);
        debug!(
            template = prompt.template_slug,
            input_tokens = resp.input_tokens,
            output_tokens = resp.output_tokens,
            "[judge] reply received"
        );

        parse_judgment(&resp.content)
    }

    async fn batch(
        &self,
        prompts: &[PromptInstance],
    ) -> Result<Vec<Result<Judgment, JudgeError>>, JudgeError> {
        let results: Vec<Result<Judgment, JudgeError>> = stream::iter(0..prompts.len())
            .map(|i| self.invoke(&prompts[i]))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let all_transport_failures = !results.is_empty()
            && results
                .iter()
                .all(|r| matches!(r, Err(JudgeError::Provider(_))));
        if all_transport_failures {
            let last = results
                .iter()
                .rev()
                .find_map(|r| r.as_ref().err())
                .map(ToString::to_string)
                .unwrap_or_default();
            return Err(JudgeError::BatchFailed {
                units: results.len(),
                last,
            });
        }
        Ok(results)
    }

    fn spent_nanodollars(&self) -> i64 {
        self.spent.load(Ordering::Relaxed)
    }
}
