//! Token estimation.
//!
//! The compressor's invariants are stated in tokens, so estimates must come
//! from a real BPE tokenizer. [`TiktokenEstimator`] is the default;
//! [`CharCountEstimator`] only stands in when the BPE tables cannot load.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Counts tokens in text.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text.
    fn estimate(&self, text: &str) -> u32;

    /// Estimator name for logging.
    fn name(&self) -> &str;
}

/// cl100k_base BPE tokenizer.
pub struct TiktokenEstimator {
    bpe: CoreBPE,
}

impl TiktokenEstimator {
    pub fn new() -> anyhow::Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()?;
        Ok(Self { bpe })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    fn name(&self) -> &str {
        "tiktoken_cl100k"
    }
}

/// Character-count based estimator (chars / divisor).
///
/// Uses the approximation that ~4 characters per token for English text.
#[derive(Debug, Clone)]
pub struct CharCountEstimator {
    /// Characters per token.
    pub chars_per_token: f64,
}

impl Default for CharCountEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl TokenEstimator for CharCountEstimator {
    fn estimate(&self, text: &str) -> u32 {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as u32
    }

    fn name(&self) -> &str {
        "char_count"
    }
}

/// The accurate estimator if it loads, otherwise the character heuristic.
pub fn default_estimator() -> Arc<dyn TokenEstimator> {
    match TiktokenEstimator::new() {
        Ok(estimator) => Arc::new(estimator),
        Err(e) => {
            warn!(error = %e, "tiktoken tables unavailable, falling back to char-count estimates");
            Arc::new(CharCountEstimator::default())
        }
    }
}

/// Cut `text` until it fits `budget` tokens, on char boundaries.
///
/// Returns the text unchanged when it already fits. The result is always
/// within budget (possibly empty).
pub fn fit_to_budget(text: &str, budget: u32, estimator: &dyn TokenEstimator) -> String {
    let mut tokens = estimator.estimate(text);
    if tokens <= budget {
        return text.to_string();
    }
    if budget == 0 {
        return String::new();
    }

    let mut current: Vec<char> = text.chars().collect();
    while tokens > budget && !current.is_empty() {
        // Shrink proportionally with a margin; always drop at least one char.
        let keep = ((current.len() as f64) * (budget as f64 / tokens as f64) * 0.9) as usize;
        let keep = keep.min(current.len() - 1);
        current.truncate(keep);
        let candidate: String = current.iter().collect();
        tokens = estimator.estimate(&candidate);
    }
    current.into_iter().collect()
}
