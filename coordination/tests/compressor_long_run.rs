//! Long conversations stay inside the context budget.

use std::sync::Arc;

use maker_coordination::context::{
    CharCountEstimator, CompressionReport, CompressorConfig, ContextCompressor, MessageRole, StaticSummarizer,
    TiktokenEstimator, TokenEstimator,
};

/// ~300 tokens of varied prose.
fn turn(i: usize) -> String {
    let words = ["parser", "buffer", "index", "retry", "socket", "schema", "cache", "token"];
    let body: Vec<String> = (0..290).map(|j| words[(i + j) % words.len()].to_string()).collect();
    format!("Turn {i}: {}", body.join(" "))
}

fn small_config() -> CompressorConfig {
    CompressorConfig {
        max_context_tokens: 1_000,
        recent_window_tokens: 600,
        summary_chunk_size: 500,
        trigger_threshold: 0.95,
        max_compressed_ratio: 0.25,
        max_summary_tokens: 100,
    }
}

#[tokio::test]
async fn test_two_hundred_turns_with_bpe_estimator() {
    let estimator: Arc<dyn TokenEstimator> = Arc::new(TiktokenEstimator::new().unwrap());
    let tokens = estimator.estimate(&turn(0));
    assert!((200..=450).contains(&tokens), "turn is {tokens} tokens");

    let summarizer = Arc::new(StaticSummarizer::replying("- earlier turns covered parser and cache work"));
    let mut compressor = ContextCompressor::new("long-run", small_config(), estimator, summarizer);

    let mut runs = 0;
    for i in 0..200 {
        compressor.add_message(
            if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant },
            turn(i),
        );
        if let CompressionReport::Compressed(summary) = compressor.compress_if_needed(false).await {
            runs += 1;
            assert!(summary.tokens_after < summary.tokens_before);
            assert!(compressor.total_tokens() <= 1_000, "total {} after compression", compressor.total_tokens());
            assert!(compressor.recent_tokens() <= 600);
            assert!(compressor.compressed_token_count() <= 250);
        }
    }

    let stats = compressor.get_stats();
    assert!(runs > 40, "only {runs} compressions");
    assert_eq!(stats.compression_runs, runs);
    assert_eq!(stats.fallback_summaries, 0);
    assert!(stats.messages_compacted > 150);

    let context = compressor.get_context(false);
    assert!(context.contains("## Earlier context (summarized)"));
    assert!(context.contains("Turn 199"));
    assert!(!context.contains("Turn 0:"));
}

#[tokio::test]
async fn test_failing_summarizer_still_bounded() {
    let estimator: Arc<dyn TokenEstimator> = Arc::new(CharCountEstimator::default());
    let mut compressor =
        ContextCompressor::new("fallback", small_config(), estimator, Arc::new(StaticSummarizer::failing()));

    for i in 0..60 {
        compressor.add_message(MessageRole::Assistant, turn(i));
        compressor.compress_if_needed(false).await;
        assert!(compressor.compressed_token_count() <= 250);
    }

    let stats = compressor.get_stats();
    assert!(stats.fallback_summaries > 0);
    assert_eq!(stats.total_summarization_failures(), stats.fallback_summaries);
}
