//! Summarization failure taxonomy.
//!
//! Summarization failures never reach the compressor's caller. They are
//! classified here, counted in the compressor stats, and answered with the
//! extractive fallback.

use serde::{Deserialize, Serialize};

/// Why a generated summary was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionFailureKind {
    /// The summarizer backend call failed.
    SummarizerFailed,
    /// The summary came back empty.
    EmptySummary,
    /// The summary exceeded its output budget.
    SummaryTooLarge,
    /// The summary was not shorter than its input.
    NoShrinkage,
}

impl std::fmt::Display for CompressionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SummarizerFailed => write!(f, "summarizer_failed"),
            Self::EmptySummary => write!(f, "empty_summary"),
            Self::SummaryTooLarge => write!(f, "summary_too_large"),
            Self::NoShrinkage => write!(f, "no_shrinkage"),
        }
    }
}

/// Summarization-specific error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("summarization failed [{model}]: {reason} ({input_tokens} tokens)")]
pub struct SummarizationError {
    /// The summarizer that was used.
    pub model: String,
    /// What went wrong.
    pub reason: String,
    /// Total tokens in input.
    pub input_tokens: u32,
}

impl SummarizationError {
    pub fn new(model: &str, reason: &str, input_tokens: u32) -> Self {
        Self {
            model: model.to_string(),
            reason: reason.to_string(),
            input_tokens,
        }
    }
}
