//! Bounded summarizer with a strict prompt/response contract for context compaction.
//!
//! The generative summarizer delegates to the [`BackendRole::Summarizer`]
//! backend. Every summary is validated against its request before the
//! compressor accepts it; rejected or failed summaries are replaced by the
//! deterministic extractive summary, which is itself verified to shrink.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{CompressionFailureKind, SummarizationError};
use super::tokenizer::{fit_to_budget, TokenEstimator};
use crate::backend::{BackendCaller, BackendRequest, BackendRole};

const SUMMARIZER_SYSTEM_PROMPT: &str = "You are a context compressor for an autonomous coding \
pipeline. Summarize the conversation into dense bullet points. Preserve task objectives, \
constraints, decisions, error patterns and reviewer feedback. Discard pleasantries and \
repetition. Never exceed the requested length.";

/// What is being summarized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    /// A chunk of messages leaving the recent window.
    Chunk,
    /// The compressed history itself, re-summarized to stay within bounds.
    Rollup,
}

/// Contract for summarizer input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub kind: SummaryKind,
    /// Serialized text to summarize.
    pub text: String,
    /// Token count of `text`.
    pub input_tokens: u32,
    /// Maximum tokens for the summary output. Always below `input_tokens`
    /// unless the input is empty.
    pub max_output_tokens: u32,
}

impl SummaryRequest {
    pub fn new(kind: SummaryKind, text: String, input_tokens: u32, max_output_tokens: u32) -> Self {
        Self {
            kind,
            text,
            input_tokens,
            max_output_tokens: max_output_tokens.min(input_tokens.saturating_sub(1)),
        }
    }

    /// Check a generated summary against this request.
    ///
    /// Returns the summary's token count when accepted.
    pub fn validate(&self, summary: &str, estimator: &dyn TokenEstimator) -> Result<u32, CompressionFailureKind> {
        if summary.trim().is_empty() {
            return Err(CompressionFailureKind::EmptySummary);
        }
        let tokens = estimator.estimate(summary);
        if tokens >= self.input_tokens {
            return Err(CompressionFailureKind::NoShrinkage);
        }
        if tokens > self.max_output_tokens {
            return Err(CompressionFailureKind::SummaryTooLarge);
        }
        Ok(tokens)
    }
}

/// Produces summaries for the compressor.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String, SummarizationError>;

    /// Summarizer name for logs and errors.
    fn name(&self) -> &str;
}

/// Generative summarizer backed by the summarizer role.
pub struct BackendSummarizer {
    caller: Arc<BackendCaller>,
}

impl BackendSummarizer {
    pub fn new(caller: Arc<BackendCaller>) -> Self {
        Self { caller }
    }
}

#[async_trait]
impl Summarizer for BackendSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String, SummarizationError> {
        let instruction = match request.kind {
            SummaryKind::Chunk => "Summarize these conversation turns",
            SummaryKind::Rollup => "Condense this running summary further",
        };
        let prompt = format!(
            "{instruction} in at most {} tokens.\n\n{}",
            request.max_output_tokens, request.text
        );
        let backend_request = BackendRequest::new(BackendRole::Summarizer, SUMMARIZER_SYSTEM_PROMPT, prompt)
            .with_temperature(0.2)
            .with_max_tokens(request.max_output_tokens.max(1));

        self.caller
            .call(&backend_request)
            .await
            .map_err(|e| SummarizationError::new(self.name(), &e.to_string(), request.input_tokens))
    }

    fn name(&self) -> &str {
        "backend_summarizer"
    }
}

/// First sentence of a paragraph, without its trailing whitespace.
fn lead_sentence(paragraph: &str) -> &str {
    let trimmed = paragraph.trim();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(trimmed.len());
    trimmed[..end].trim_end()
}

/// Non-generative summary: the lead sentence of each paragraph, newest last,
/// cut to `max_output_tokens` and verified to be shorter than the input.
pub fn extractive_summary(request: &SummaryRequest, estimator: &dyn TokenEstimator) -> String {
    let budget = request.max_output_tokens;
    let mut lines: Vec<&str> = Vec::new();
    let mut used = 0u32;

    for paragraph in request.text.split("\n\n").filter(|p| !p.trim().is_empty()) {
        let sentence = lead_sentence(paragraph);
        if sentence.is_empty() {
            continue;
        }
        let cost = estimator.estimate(sentence) + 1;
        if used + cost > budget {
            break;
        }
        used += cost;
        lines.push(sentence);
    }

    let summary = if lines.is_empty() {
        // Nothing fits whole; keep the head of the first paragraph.
        let first = request.text.split("\n\n").map(lead_sentence).find(|s| !s.is_empty()).unwrap_or("");
        fit_to_budget(first, budget, estimator)
    } else {
        fit_to_budget(&lines.join("\n"), budget, estimator)
    };

    // Budget is below the input size, so this only trims estimator drift.
    if request.input_tokens > 0 && estimator.estimate(&summary) >= request.input_tokens {
        return fit_to_budget(&summary, request.input_tokens.saturating_sub(1), estimator);
    }
    summary
}

/// Test summarizer returning a fixed reply, or failing.
pub struct StaticSummarizer {
    reply: Option<String>,
}

impl StaticSummarizer {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
        }
    }

    pub fn failing() -> Self {
        Self { reply: None }
    }
}

#[async_trait]
impl Summarizer for StaticSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String, SummarizationError> {
        self.reply
            .clone()
            .ok_or_else(|| SummarizationError::new(self.name(), "simulated failure", request.input_tokens))
    }

    fn name(&self) -> &str {
        "static_summarizer"
    }
}
