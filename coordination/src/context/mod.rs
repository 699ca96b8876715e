//! Context compression: token estimation, bounded summaries and the
//! per-task compressor that keeps prompts inside the context window.

pub mod compressor;
pub mod errors;
pub mod summarizer;
pub mod tokenizer;

pub use compressor::{
    CompressionReport, CompressionSummary, CompressorConfig, CompressorStats, ContextCompressor,
    ConversationMessage, MessageRole,
};
pub use errors::{CompressionFailureKind, SummarizationError};
pub use summarizer::{
    extractive_summary, BackendSummarizer, StaticSummarizer, SummaryKind, SummaryRequest, Summarizer,
};
pub use tokenizer::{default_estimator, fit_to_budget, CharCountEstimator, TiktokenEstimator, TokenEstimator};
