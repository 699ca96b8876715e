//! Candidate generation: N sampled solutions at distinct temperatures.
//!
//! Each generation call is gated individually by the coder role's admission
//! gate. With the default capacity of 1 the calls run one after another;
//! raise the coder capacity (or point the role at several server instances)
//! to get real parallelism.

use std::borrow::Cow;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::backend::{BackendCaller, BackendError, BackendRequest, BackendRole};
use crate::state::{candidate_label, Candidate};

const TRUNCATION_MARKER: &str = "\n\n[... middle of prompt truncated ...]\n\n";

/// Cap `prompt` at `max_chars` characters, keeping its head and tail.
///
/// The head carries the task and plan, the tail the latest feedback, so the
/// middle is what gets cut.
pub fn cap_prompt(prompt: &str, max_chars: usize) -> Cow<'_, str> {
    let total = prompt.chars().count();
    if total <= max_chars {
        return Cow::Borrowed(prompt);
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len * 2 {
        return Cow::Owned(prompt.chars().take(max_chars).collect());
    }

    let keep = max_chars - marker_len;
    let head_len = keep * 2 / 3;
    let tail_len = keep - head_len;
    let head: String = prompt.chars().take(head_len).collect();
    let tail: String = prompt.chars().skip(total - tail_len).collect();
    Cow::Owned(format!("{head}{TRUNCATION_MARKER}{tail}"))
}

/// Sampling temperatures for `n` candidates.
///
/// Uses `base` in order; beyond its end, keeps stepping up by 0.1 from the
/// last entry so every candidate gets a distinct temperature.
pub fn temperature_schedule(n: usize, base: &[f32]) -> Vec<f32> {
    (0..n)
        .map(|i| match base.get(i) {
            Some(t) => *t,
            None => {
                let last = base.last().copied().unwrap_or(0.0);
                let step = (i + 1 - base.len()) as f32 * 0.1;
                (last + step).min(2.0)
            }
        })
        .collect()
}

/// A generation call that produced no candidate.
#[derive(Debug, Clone)]
pub struct DroppedCandidate {
    /// Generation slot (0-based) the call was issued for.
    pub slot: usize,
    pub temperature: f32,
    pub error: BackendError,
}

/// Result of one GENERATE fan-out.
#[derive(Debug, Clone, Default)]
pub struct CandidateBatch {
    /// Surviving candidates, in generation order, labelled A, B, C, ...
    pub candidates: Vec<Candidate>,
    pub dropped: Vec<DroppedCandidate>,
}

impl CandidateBatch {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Issues the N generation calls for a GENERATE stage.
pub struct CandidateGenerator {
    caller: Arc<BackendCaller>,
    role: BackendRole,
    max_prompt_chars: usize,
    max_tokens: u32,
}

impl CandidateGenerator {
    pub fn new(caller: Arc<BackendCaller>, max_prompt_chars: usize) -> Self {
        Self {
            caller,
            role: BackendRole::Coder,
            max_prompt_chars,
            max_tokens: 4096,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Generate up to `n` candidates for `prompt`.
    ///
    /// Failed calls drop their candidate and are reported in
    /// [`CandidateBatch::dropped`]. Survivors are relabelled consecutively
    /// so candidate letters always match their position.
    pub async fn generate_candidates(&self, system_prompt: &str, prompt: &str, n: usize, temperatures: &[f32]) -> CandidateBatch {
        let prompt = cap_prompt(prompt, self.max_prompt_chars);
        let temps = temperature_schedule(n, temperatures);

        debug!(n, prompt_chars = prompt.len(), temps = ?temps, "dispatching candidate generation");

        let calls = temps.iter().enumerate().map(|(slot, temperature)| {
            let request = BackendRequest::new(self.role, system_prompt, prompt.as_ref())
                .with_temperature(*temperature)
                .with_max_tokens(self.max_tokens);
            async move { (slot, *temperature, self.caller.call(&request).await) }
        });

        let mut batch = CandidateBatch::default();
        for (slot, temperature, result) in join_all(calls).await {
            match result {
                Ok(text) if !text.trim().is_empty() => {
                    let index = batch.candidates.len();
                    batch.candidates.push(Candidate {
                        id: candidate_label(index),
                        index,
                        text,
                        temperature,
                    });
                }
                Ok(_) => {
                    warn!(slot, temperature, "candidate dropped: empty reply");
                    batch.dropped.push(DroppedCandidate {
                        slot,
                        temperature,
                        error: BackendError::Malformed {
                            role: self.role,
                            detail: "empty reply".to_string(),
                        },
                    });
                }
                Err(error) => {
                    warn!(slot, temperature, error = %error, "candidate dropped");
                    batch.dropped.push(DroppedCandidate {
                        slot,
                        temperature,
                        error,
                    });
                }
            }
        }

        info!(
            requested = n,
            survived = batch.candidates.len(),
            dropped = batch.dropped.len(),
            "candidates generated"
        );
        batch
    }
}
