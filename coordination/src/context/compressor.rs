//! Hierarchical, token-budgeted context compressor.
//!
//! One compressor per task. Recent messages stay verbatim in a bounded
//! window; older messages are summarized chunk by chunk into a running
//! compressed history, which is itself re-summarized whenever it outgrows its
//! share of the context. After every `compress_if_needed` call:
//!
//! - recent window tokens ≤ `recent_window_tokens` (when compression ran)
//! - compressed history tokens ≤ `max_context_tokens × max_compressed_ratio`
//!
//! Summarization failures never escape: they are counted and answered with an
//! extractive summary that is verified to be shorter than its input.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::errors::CompressionFailureKind;
use super::summarizer::{extractive_summary, SummaryKind, SummaryRequest, Summarizer};
use super::tokenizer::{fit_to_budget, TokenEstimator};

/// Rollup passes before the compressed history is cut to budget outright.
const MAX_ROLLUP_DEPTH: u32 = 3;

/// Token budget configuration for one compressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfig {
    pub max_context_tokens: u32,
    pub recent_window_tokens: u32,
    pub summary_chunk_size: u32,
    /// Fraction of `max_context_tokens` at which compression triggers.
    pub trigger_threshold: f64,
    /// Share of `max_context_tokens` the compressed history may occupy.
    pub max_compressed_ratio: f64,
    /// Upper bound for a single chunk summary.
    pub max_summary_tokens: u32,
}

impl CompressorConfig {
    /// Token ceiling for the compressed history.
    pub fn compressed_budget(&self) -> u32 {
        (self.max_context_tokens as f64 * self.max_compressed_ratio).floor() as u32
    }

    /// Total token count at which compression triggers.
    pub fn trigger_tokens(&self) -> f64 {
        self.max_context_tokens as f64 * self.trigger_threshold
    }
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_768,
            recent_window_tokens: 16_384,
            summary_chunk_size: 4_096,
            trigger_threshold: 0.95,
            max_compressed_ratio: 0.25,
            max_summary_tokens: 1_024,
        }
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One immutable entry in the recent window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub token_estimate: u32,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    fn render(&self) -> String {
        format!("{}: {}", self.role, self.content)
    }
}

/// What a compression pass did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionSummary {
    pub messages_compacted: usize,
    pub chunks_summarized: usize,
    pub fallback_summaries: usize,
    pub rollups: u32,
    pub tokens_before: u32,
    pub tokens_after: u32,
}

/// Result of [`ContextCompressor::compress_if_needed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompressionReport {
    /// Below threshold, or nothing to move.
    Skipped { total_tokens: u32 },
    Compressed(CompressionSummary),
}

impl CompressionReport {
    pub fn did_compress(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }
}

/// Read-only counters for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorStats {
    pub task_id: String,
    pub estimator: String,
    pub recent_messages: usize,
    pub recent_tokens: u32,
    pub compressed_tokens: u32,
    pub total_tokens: u32,
    pub max_context_tokens: u32,
    pub usage_ratio: f64,
    pub compression_runs: u32,
    pub messages_compacted: u64,
    pub rollups: u32,
    pub fallback_summaries: u32,
    /// Rejected or failed generative summaries, by cause.
    pub summarization_failures: BTreeMap<CompressionFailureKind, u32>,
}

impl CompressorStats {
    pub fn total_summarization_failures(&self) -> u32 {
        self.summarization_failures.values().sum()
    }
}

#[derive(Debug, Default)]
struct Counters {
    compression_runs: u32,
    messages_compacted: u64,
    rollups: u32,
    fallback_summaries: u32,
    failures: BTreeMap<CompressionFailureKind, u32>,
}

/// Per-task bounded conversation state.
pub struct ContextCompressor {
    task_id: String,
    config: CompressorConfig,
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Arc<dyn Summarizer>,
    system_prompt: Option<String>,
    recent_window: VecDeque<ConversationMessage>,
    recent_tokens: u32,
    compressed_history: String,
    compressed_token_count: u32,
    counters: Counters,
}

impl ContextCompressor {
    pub fn new(
        task_id: impl Into<String>,
        config: CompressorConfig,
        estimator: Arc<dyn TokenEstimator>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            config,
            estimator,
            summarizer,
            system_prompt: None,
            recent_window: VecDeque::new(),
            recent_tokens: 0,
            compressed_history: String::new(),
            compressed_token_count: 0,
            counters: Counters::default(),
        }
    }

    /// System preamble included by `get_context(true)`. Not part of the budget.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// Append a message to the recent window.
    pub fn add_message(&mut self, role: MessageRole, content: impl Into<String>) {
        let content = content.into();
        let token_estimate = self.estimator.estimate(&content);
        self.recent_tokens += token_estimate;
        self.recent_window.push_back(ConversationMessage {
            role,
            content,
            token_estimate,
            timestamp: Utc::now(),
        });
    }

    pub fn recent_messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.recent_window.iter()
    }

    pub fn compressed_history(&self) -> &str {
        &self.compressed_history
    }

    pub fn recent_tokens(&self) -> u32 {
        self.recent_tokens
    }

    pub fn compressed_token_count(&self) -> u32 {
        self.compressed_token_count
    }

    pub fn total_tokens(&self) -> u32 {
        self.recent_tokens + self.compressed_token_count
    }

    fn near_limit(&self) -> bool {
        self.total_tokens() as f64 >= self.config.trigger_tokens()
    }

    /// Compress when over the trigger threshold, or unconditionally if `force`.
    ///
    /// Idempotent: a second call with no new messages changes nothing.
    pub async fn compress_if_needed(&mut self, force: bool) -> CompressionReport {
        let tokens_before = self.total_tokens();
        if !force && !self.near_limit() {
            return CompressionReport::Skipped {
                total_tokens: tokens_before,
            };
        }

        let mut evicted = Vec::new();
        while self.recent_tokens > self.config.recent_window_tokens {
            let Some(msg) = self.recent_window.pop_front() else {
                break;
            };
            self.recent_tokens -= msg.token_estimate;
            evicted.push(msg);
        }

        let budget = self.config.compressed_budget();
        if evicted.is_empty() && self.compressed_token_count <= budget {
            debug!(task_id = %self.task_id, total = tokens_before, "compression found nothing to move");
            return CompressionReport::Skipped {
                total_tokens: tokens_before,
            };
        }

        let fallbacks_before = self.counters.fallback_summaries;
        let rollups_before = self.counters.rollups;
        let chunks = chunk_messages(&evicted, self.config.summary_chunk_size);
        let chunk_count = chunks.len();

        for chunk in chunks {
            let text = chunk
                .iter()
                .map(|m| m.render())
                .collect::<Vec<_>>()
                .join("\n\n");
            let input_tokens = self.estimator.estimate(&text);
            let target = self.config.max_summary_tokens.min((input_tokens / 4).max(1));
            let summary = self
                .summarize_verified(SummaryRequest::new(SummaryKind::Chunk, text, input_tokens, target))
                .await;
            self.append_summary(&summary);
        }

        self.enforce_compressed_bound().await;

        self.counters.compression_runs += 1;
        self.counters.messages_compacted += evicted.len() as u64;

        let summary = CompressionSummary {
            messages_compacted: evicted.len(),
            chunks_summarized: chunk_count,
            fallback_summaries: (self.counters.fallback_summaries - fallbacks_before) as usize,
            rollups: self.counters.rollups - rollups_before,
            tokens_before,
            tokens_after: self.total_tokens(),
        };

        info!(
            task_id = %self.task_id,
            messages = summary.messages_compacted,
            chunks = summary.chunks_summarized,
            fallbacks = summary.fallback_summaries,
            tokens_before,
            tokens_after = summary.tokens_after,
            compressed_tokens = self.compressed_token_count,
            "context compressed"
        );

        CompressionReport::Compressed(summary)
    }

    /// Ask the summarizer; on failure or contract violation use the extractive summary.
    async fn summarize_verified(&mut self, request: SummaryRequest) -> String {
        let failure = match self.summarizer.summarize(&request).await {
            Ok(summary) => match request.validate(&summary, self.estimator.as_ref()) {
                Ok(_) => return summary,
                Err(kind) => kind,
            },
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "summarizer call failed");
                CompressionFailureKind::SummarizerFailed
            }
        };

        *self.counters.failures.entry(failure).or_insert(0) += 1;
        self.counters.fallback_summaries += 1;
        warn!(
            task_id = %self.task_id,
            kind = ?request.kind,
            failure = %failure,
            input_tokens = request.input_tokens,
            "using extractive summary"
        );
        extractive_summary(&request, self.estimator.as_ref())
    }

    fn append_summary(&mut self, summary: &str) {
        if summary.trim().is_empty() {
            return;
        }
        if !self.compressed_history.is_empty() {
            self.compressed_history.push('\n');
        }
        self.compressed_history.push_str(summary.trim());
        self.compressed_token_count = self.estimator.estimate(&self.compressed_history);
    }

    /// Re-summarize the compressed history until it fits its budget.
    async fn enforce_compressed_bound(&mut self) {
        let budget = self.config.compressed_budget();
        let mut depth = 0;

        while self.compressed_token_count > budget {
            if depth >= MAX_ROLLUP_DEPTH {
                warn!(task_id = %self.task_id, budget, "rollup depth exhausted, cutting history to budget");
                self.compressed_history = fit_to_budget(&self.compressed_history, budget, self.estimator.as_ref());
                self.compressed_token_count = self.estimator.estimate(&self.compressed_history);
                break;
            }

            // Leave headroom for the next few chunk summaries.
            let target = (budget / 2).max(1).min(budget);
            let request = SummaryRequest::new(
                SummaryKind::Rollup,
                self.compressed_history.clone(),
                self.compressed_token_count,
                target,
            );
            let rolled = self.summarize_verified(request).await;
            debug!(
                task_id = %self.task_id,
                before = self.compressed_token_count,
                depth,
                "compressed history rolled up"
            );
            self.compressed_history = rolled.trim().to_string();
            self.compressed_token_count = self.estimator.estimate(&self.compressed_history);
            self.counters.rollups += 1;
            depth += 1;
        }
    }

    /// Prompt context for the next stage. Pure read: never compresses.
    pub fn get_context(&self, include_system: bool) -> String {
        if self.near_limit() {
            warn!(
                task_id = %self.task_id,
                total = self.total_tokens(),
                max = self.config.max_context_tokens,
                "context near limit; call compress_if_needed first"
            );
        }

        let mut sections = Vec::new();
        if include_system {
            if let Some(prompt) = &self.system_prompt {
                sections.push(prompt.clone());
            }
        }
        if !self.compressed_history.is_empty() {
            sections.push(format!("## Earlier context (summarized)\n{}", self.compressed_history));
        }
        if !self.recent_window.is_empty() {
            let recent = self
                .recent_window
                .iter()
                .map(|m| m.render())
                .collect::<Vec<_>>()
                .join("\n\n");
            sections.push(format!("## Recent conversation\n{recent}"));
        }
        sections.join("\n\n")
    }

    pub fn get_stats(&self) -> CompressorStats {
        let total = self.total_tokens();
        CompressorStats {
            task_id: self.task_id.clone(),
            estimator: self.estimator.name().to_string(),
            recent_messages: self.recent_window.len(),
            recent_tokens: self.recent_tokens,
            compressed_tokens: self.compressed_token_count,
            total_tokens: total,
            max_context_tokens: self.config.max_context_tokens,
            usage_ratio: if self.config.max_context_tokens == 0 {
                0.0
            } else {
                total as f64 / self.config.max_context_tokens as f64
            },
            compression_runs: self.counters.compression_runs,
            messages_compacted: self.counters.messages_compacted,
            rollups: self.counters.rollups,
            fallback_summaries: self.counters.fallback_summaries,
            summarization_failures: self.counters.failures.clone(),
        }
    }
}

/// Group messages, oldest first, into chunks of at most `chunk_size` tokens.
/// A single message larger than `chunk_size` forms its own chunk.
fn chunk_messages(messages: &[ConversationMessage], chunk_size: u32) -> Vec<Vec<&ConversationMessage>> {
    let mut chunks: Vec<Vec<&ConversationMessage>> = Vec::new();
    let mut current: Vec<&ConversationMessage> = Vec::new();
    let mut current_tokens = 0u32;

    for msg in messages {
        if !current.is_empty() && current_tokens + msg.token_estimate > chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += msg.token_estimate;
        current.push(msg);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::StaticSummarizer;
    use crate::context::tokenizer::CharCountEstimator;

    fn config(max: u32, window: u32, chunk: u32) -> CompressorConfig {
        CompressorConfig {
            max_context_tokens: max,
            recent_window_tokens: window,
            summary_chunk_size: chunk,
            trigger_threshold: 0.95,
            max_compressed_ratio: 0.25,
            max_summary_tokens: 200,
        }
    }

    fn compressor(cfg: CompressorConfig, summarizer: StaticSummarizer) -> ContextCompressor {
        ContextCompressor::new(
            "task-1",
            cfg,
            Arc::new(CharCountEstimator::default()),
            Arc::new(summarizer),
        )
    }

    /// A message of exactly `tokens` char-count tokens.
    fn message(i: usize, tokens: usize) -> String {
        let head = format!("Message {i} about the parser. ");
        let pad = tokens * 4 - head.len();
        format!("{head}{}", "x".repeat(pad))
    }

    #[test]
    fn test_chunking_respects_size() {
        let msgs: Vec<ConversationMessage> = [30u32, 30, 50, 10, 80]
            .iter()
            .map(|t| ConversationMessage {
                role: MessageRole::User,
                content: String::new(),
                token_estimate: *t,
                timestamp: Utc::now(),
            })
            .collect();
        let chunks = chunk_messages(&msgs, 60);
        let sizes: Vec<u32> = chunks
            .iter()
            .map(|c| c.iter().map(|m| m.token_estimate).sum())
            .collect();
        assert_eq!(sizes, vec![60, 60, 80]);
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let mut c = compressor(config(1000, 600, 300), StaticSummarizer::replying("s"));
        c.add_message(MessageRole::User, message(0, 100));
        let report = c.compress_if_needed(false).await;
        assert_eq!(report, CompressionReport::Skipped { total_tokens: 100 });
        assert_eq!(c.get_stats().compression_runs, 0);
    }

    #[tokio::test]
    async fn test_triggered_compression_bounds_window_and_history() {
        let mut c = compressor(config(1000, 600, 300), StaticSummarizer::replying("- parser work summarized"));
        for i in 0..10 {
            c.add_message(MessageRole::Assistant, message(i, 100));
        }
        let report = c.compress_if_needed(false).await;
        assert!(report.did_compress());
        assert!(c.recent_tokens() <= 600);
        assert!(c.compressed_token_count() <= 250);
        assert!(c.compressed_history().contains("parser work summarized"));
        assert_eq!(c.get_stats().messages_compacted, 4);
    }

    #[tokio::test]
    async fn test_second_call_is_idempotent() {
        let mut c = compressor(config(1000, 600, 300), StaticSummarizer::replying("- summary"));
        for i in 0..10 {
            c.add_message(MessageRole::User, message(i, 100));
        }
        c.compress_if_needed(false).await;
        let history = c.compressed_history().to_string();
        let stats = c.get_stats();

        let again = c.compress_if_needed(false).await;
        assert!(!again.did_compress());
        assert_eq!(c.compressed_history(), history);
        assert_eq!(c.get_stats(), stats);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_extractive_and_is_counted() {
        let mut c = compressor(config(1000, 600, 300), StaticSummarizer::failing());
        for i in 0..10 {
            c.add_message(MessageRole::User, message(i, 100));
        }
        let report = c.compress_if_needed(false).await;
        let CompressionReport::Compressed(summary) = report else {
            panic!("expected compression");
        };
        assert!(summary.fallback_summaries > 0);
        assert!(c.compressed_history().contains("Message 0 about the parser."));

        let stats = c.get_stats();
        assert!(stats.total_summarization_failures() > 0);
        assert!(stats.summarization_failures[&CompressionFailureKind::SummarizerFailed] > 0);
        assert!(c.compressed_token_count() <= 250);
    }

    #[tokio::test]
    async fn test_oversized_summary_is_rejected() {
        // The "summary" is longer than any chunk; validation must reject it.
        let mut c = compressor(config(1000, 600, 300), StaticSummarizer::replying("y".repeat(4000)));
        for i in 0..10 {
            c.add_message(MessageRole::User, message(i, 100));
        }
        c.compress_if_needed(false).await;
        let stats = c.get_stats();
        assert!(stats.summarization_failures.contains_key(&CompressionFailureKind::NoShrinkage));
        assert!(!c.compressed_history().contains("yyyy"));
        assert!(c.compressed_token_count() <= 250);
    }

    #[tokio::test]
    async fn test_forced_compression_below_threshold() {
        let mut c = compressor(config(1000, 100, 300), StaticSummarizer::replying("- early turns"));
        for i in 0..3 {
            c.add_message(MessageRole::User, message(i, 60));
        }
        assert!(!c.compress_if_needed(false).await.did_compress());
        assert!(c.compress_if_needed(true).await.did_compress());
        assert!(c.recent_tokens() <= 100);
    }

    #[tokio::test]
    async fn test_rollup_keeps_history_bounded_over_long_run() {
        let mut c = compressor(config(1000, 600, 300), StaticSummarizer::failing());
        for i in 0..200 {
            c.add_message(MessageRole::User, message(i, 100));
            c.compress_if_needed(false).await;
            assert!(c.compressed_token_count() <= 250, "iteration {i}");
            assert!(c.total_tokens() <= 1000, "iteration {i}");
        }
        assert!(c.get_stats().rollups > 0);
    }

    #[test]
    fn test_get_context_is_pure() {
        let mut c = compressor(config(100, 60, 30), StaticSummarizer::replying("s"))
            .with_system_prompt("You are the planner.");
        for i in 0..5 {
            c.add_message(MessageRole::User, message(i, 25));
        }
        let before = c.get_stats();
        let with_system = c.get_context(true);
        let without = c.get_context(false);
        assert!(with_system.starts_with("You are the planner."));
        assert!(!without.contains("You are the planner."));
        assert!(without.contains("user: Message 4"));
        assert_eq!(c.get_stats(), before);
    }
}
