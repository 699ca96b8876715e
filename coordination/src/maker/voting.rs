//! First-to-K voting over a candidate set.
//!
//! Up to 2K−1 voter calls each pick one candidate. The first candidate to
//! collect K votes wins at once and the remaining voters are abandoned. When
//! every voter has answered without a K-vote winner, the candidate with the
//! most votes wins, ties going to the earliest generated.
//!
//! The outcome depends only on the candidate set and the voter replies: two
//! different candidates can never both reach K within 2K−1 votes, so arrival
//! order cannot change the winner.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::candidates::cap_prompt;
use crate::backend::{BackendCaller, BackendError, BackendRequest, BackendRole};
use crate::state::{candidate_label, Candidate};

static VOTE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bvote\b\s*[:=\-]?\s*\**\s*(?:candidate\s+)?\(?([a-z])\b").expect("VOTE_TAG regex should compile")
});

static BARE_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s*(\[]*([A-Za-z])[\s*)\].:]*$").expect("BARE_LETTER regex should compile"));

const VOTER_SYSTEM_PROMPT: &str = "You are a code reviewer voting on candidate solutions. \
Pick the single candidate that best solves the task: correct, complete, idiomatic. \
Answer with one line of the form `VOTE: <letter>` and nothing else.";

/// Voter sampling temperature. Voters must disagree sometimes to be independent.
const VOTER_TEMPERATURE: f32 = 0.7;

/// Error type for voting operations
#[derive(Debug, thiserror::Error)]
pub enum VotingError {
    #[error("No candidates to vote on")]
    NoCandidates,

    #[error("Vote threshold must be at least 1")]
    InvalidThreshold,
}

/// Parse a voter reply into a candidate index.
///
/// Accepts `VOTE: B` anywhere in the reply (the last tag wins) or a reply
/// that is just a letter. Returns `None` for anything else, including
/// letters outside the candidate set.
pub fn parse_vote(reply: &str, candidate_count: usize) -> Option<usize> {
    let letter = VOTE_TAG
        .captures_iter(reply)
        .last()
        .and_then(|c| c.get(1))
        .or_else(|| BARE_LETTER.captures(reply.trim()).and_then(|c| c.get(1)))?
        .as_str()
        .chars()
        .next()?
        .to_ascii_uppercase();

    let index = (letter as u8).checked_sub(b'A')? as usize;
    (index < candidate_count).then_some(index)
}

/// Running first-to-K tally.
#[derive(Debug, Clone)]
pub struct VoteTally {
    k: u32,
    counts: Vec<u32>,
    winner: Option<usize>,
}

impl VoteTally {
    pub fn new(candidate_count: usize, k: u32) -> Self {
        Self {
            k: k.max(1),
            counts: vec![0; candidate_count],
            winner: None,
        }
    }

    /// Count one vote. Returns the winner once some candidate reaches K;
    /// votes after that are ignored.
    pub fn record(&mut self, index: usize) -> Option<usize> {
        if self.winner.is_some() {
            return self.winner;
        }
        if let Some(count) = self.counts.get_mut(index) {
            *count += 1;
            if *count >= self.k {
                self.winner = Some(index);
            }
        }
        self.winner
    }

    pub fn winner(&self) -> Option<usize> {
        self.winner
    }

    /// Most votes, ties to the lowest index. Index 0 when nothing was counted.
    pub fn leader(&self) -> usize {
        self.counts
            .iter()
            .enumerate()
            .fold((0usize, 0u32), |(best, best_count), (i, c)| {
                if *c > best_count {
                    (i, *c)
                } else {
                    (best, best_count)
                }
            })
            .0
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }
}

/// What happened to one voter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ballot {
    Counted { voter: usize, candidate_id: String },
    Discarded { voter: usize, reply: String },
    Failed { voter: usize, error: String },
}

/// How the winner was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    /// Single candidate; no voters were called.
    AutoWin,
    /// A candidate reached K votes.
    Threshold,
    /// No candidate reached K; most votes won.
    Plurality,
    /// Every voter call failed; the first candidate won.
    Default,
}

/// Result of one `maker_vote` round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub winner_index: usize,
    pub winner_id: String,
    pub decision: VoteDecision,
    /// Counted votes per candidate id.
    pub votes: BTreeMap<String, u32>,
    /// Voter results in arrival order.
    pub ballots: Vec<Ballot>,
    pub voters_dispatched: usize,
}

impl VoteOutcome {
    pub fn discarded(&self) -> usize {
        self.ballots.iter().filter(|b| matches!(b, Ballot::Discarded { .. })).count()
    }

    pub fn failed(&self) -> usize {
        self.ballots.iter().filter(|b| matches!(b, Ballot::Failed { .. })).count()
    }
}

/// Voter prompt presenting the full candidate set.
pub fn build_vote_prompt(task: &str, candidates: &[Candidate], max_task_chars: usize) -> String {
    let mut prompt = format!("## Task\n{}\n\n## Candidates\n", cap_prompt(task, max_task_chars));
    for candidate in candidates {
        prompt.push_str(&format!("\n### Candidate {}\n```\n{}\n```\n", candidate.id, candidate.text.trim()));
    }
    let last = candidate_label(candidates.len().saturating_sub(1));
    prompt.push_str(&format!("\nChoose one candidate from A to {last}. Reply with `VOTE: <letter>`."));
    prompt
}

/// Runs first-to-K voting rounds through the voter role.
pub struct MakerVoter {
    caller: Arc<BackendCaller>,
    max_task_chars: usize,
}

impl MakerVoter {
    pub fn new(caller: Arc<BackendCaller>, max_task_chars: usize) -> Self {
        Self { caller, max_task_chars }
    }

    /// Pick a winner among `candidates` with threshold `k`.
    ///
    /// At most `min(capacity(voter), 2k−1)` voter calls are in flight; a new
    /// voter starts only when one finishes without a decision.
    pub async fn maker_vote(&self, task: &str, candidates: &[Candidate], k: u32) -> Result<VoteOutcome, VotingError> {
        if candidates.is_empty() {
            return Err(VotingError::NoCandidates);
        }
        if k == 0 {
            return Err(VotingError::InvalidThreshold);
        }
        if candidates.len() == 1 {
            debug!("single candidate, voting skipped");
            return Ok(VoteOutcome {
                winner_index: 0,
                winner_id: candidates[0].id.clone(),
                decision: VoteDecision::AutoWin,
                votes: BTreeMap::new(),
                ballots: Vec::new(),
                voters_dispatched: 0,
            });
        }

        let total_voters = (k as usize).saturating_mul(2) - 1;
        let parallel = self.caller.admission().capacity(BackendRole::Voter).clamp(1, total_voters);
        let prompt = build_vote_prompt(task, candidates, self.max_task_chars);

        let cast = |voter: usize| {
            let request = BackendRequest::new(BackendRole::Voter, VOTER_SYSTEM_PROMPT, prompt.as_str())
                .with_temperature(VOTER_TEMPERATURE)
                .with_max_tokens(64);
            async move { (voter, self.caller.call(&request).await) }
        };

        let mut tally = VoteTally::new(candidates.len(), k);
        let mut ballots = Vec::with_capacity(total_voters.min(64));
        let mut in_flight = FuturesUnordered::new();
        let mut dispatched = 0usize;

        while dispatched < parallel {
            in_flight.push(cast(dispatched));
            dispatched += 1;
        }

        while let Some((voter, result)) = in_flight.next().await {
            ballots.push(self.ballot(voter, result, candidates, &mut tally));

            if let Some(winner) = tally.winner() {
                debug!(
                    winner = %candidates[winner].id,
                    abandoned = in_flight.len() + (total_voters - dispatched),
                    "vote threshold reached"
                );
                break;
            }
            if dispatched < total_voters {
                in_flight.push(cast(dispatched));
                dispatched += 1;
            }
        }
        // Dropping the remaining futures abandons their calls and releases their permits.
        drop(in_flight);

        let counted = tally.total();
        let (winner_index, decision) = match tally.winner() {
            Some(w) => (w, VoteDecision::Threshold),
            None if counted > 0 => (tally.leader(), VoteDecision::Plurality),
            None => {
                let failed = ballots.iter().filter(|b| matches!(b, Ballot::Failed { .. })).count();
                if failed == ballots.len() {
                    warn!(voters = ballots.len(), "every voter failed, first candidate wins by default");
                }
                (0, VoteDecision::Default)
            }
        };

        let votes = candidates
            .iter()
            .zip(tally.counts())
            .filter(|(_, n)| **n > 0)
            .map(|(c, n)| (c.id.clone(), *n))
            .collect();

        let outcome = VoteOutcome {
            winner_index,
            winner_id: candidates[winner_index].id.clone(),
            decision,
            votes,
            ballots,
            voters_dispatched: dispatched,
        };

        info!(
            winner = %outcome.winner_id,
            decision = ?outcome.decision,
            counted,
            discarded = outcome.discarded(),
            failed = outcome.failed(),
            dispatched,
            "consensus reached"
        );
        Ok(outcome)
    }

    fn ballot(
        &self,
        voter: usize,
        result: Result<String, BackendError>,
        candidates: &[Candidate],
        tally: &mut VoteTally,
    ) -> Ballot {
        match result {
            Ok(reply) => match parse_vote(&reply, candidates.len()) {
                Some(index) => {
                    tally.record(index);
                    Ballot::Counted {
                        voter,
                        candidate_id: candidates[index].id.clone(),
                    }
                }
                None => {
                    warn!(voter, reply = %reply.chars().take(80).collect::<String>(), "unparsable vote discarded");
                    Ballot::Discarded {
                        voter,
                        reply: reply.chars().take(200).collect(),
                    }
                }
            },
            Err(e) => {
                warn!(voter, error = %e, "voter call failed");
                Ballot::Failed {
                    voter,
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::backend::ScriptedBackend;
    use std::time::Duration;

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate {
                id: candidate_label(i),
                index: i,
                text: format!("fn candidate_{i}() {{}}"),
                temperature: 0.2,
            })
            .collect()
    }

    fn voter(backend: Arc<ScriptedBackend>) -> MakerVoter {
        let caller = BackendCaller::new(backend, Arc::new(AdmissionController::new(1)), Duration::from_secs(5));
        MakerVoter::new(Arc::new(caller), 10_000)
    }

    #[test]
    fn test_parse_vote_forms() {
        assert_eq!(parse_vote("VOTE: B", 5), Some(1));
        assert_eq!(parse_vote("vote = c", 5), Some(2));
        assert_eq!(parse_vote("Reasoning...\nVOTE: **D**", 5), Some(3));
        assert_eq!(parse_vote("VOTE: A then VOTE: E", 5), Some(4));
        assert_eq!(parse_vote("  B  ", 5), Some(1));
        assert_eq!(parse_vote("(A).", 5), Some(0));
        assert_eq!(parse_vote("VOTE: Candidate C", 5), Some(2));
    }

    #[test]
    fn test_parse_vote_rejects() {
        assert_eq!(parse_vote("VOTE: F", 5), None);
        assert_eq!(parse_vote("I like the second one", 5), None);
        assert_eq!(parse_vote("", 5), None);
        assert_eq!(parse_vote("VOTE: 2", 5), None);
        assert_eq!(parse_vote("I voted for B earlier", 5), None);
    }

    #[test]
    fn test_tally_first_to_k() {
        let mut tally = VoteTally::new(3, 3);
        assert_eq!(tally.record(0), None);
        assert_eq!(tally.record(0), None);
        assert_eq!(tally.record(1), None);
        assert_eq!(tally.record(0), Some(0));
        // Later votes cannot change the decision.
        assert_eq!(tally.record(1), Some(0));
        assert_eq!(tally.counts(), &[3, 1, 0]);
    }

    #[test]
    fn test_tally_leader_breaks_ties_low() {
        let mut tally = VoteTally::new(3, 2);
        tally.record(2);
        tally.record(1);
        assert_eq!(tally.leader(), 1);
        assert_eq!(VoteTally::new(3, 2).leader(), 0);
    }

    #[tokio::test]
    async fn test_single_candidate_auto_wins() {
        let backend = Arc::new(ScriptedBackend::new());
        let outcome = voter(backend.clone()).maker_vote("t", &candidates(1), 3).await.unwrap();
        assert_eq!(outcome.decision, VoteDecision::AutoWin);
        assert_eq!(outcome.winner_id, "A");
        assert_eq!(backend.call_count(BackendRole::Voter), 0);
    }

    #[tokio::test]
    async fn test_early_stop_at_threshold() {
        let backend = Arc::new(ScriptedBackend::new().with_replies(
            BackendRole::Voter,
            ["VOTE: B", "VOTE: B", "VOTE: A", "VOTE: B", "VOTE: A"],
        ));
        let outcome = voter(backend.clone()).maker_vote("t", &candidates(5), 3).await.unwrap();
        assert_eq!(outcome.winner_id, "B");
        assert_eq!(outcome.decision, VoteDecision::Threshold);
        assert_eq!(backend.call_count(BackendRole::Voter), 4);
        assert_eq!(outcome.voters_dispatched, 4);
    }

    #[tokio::test]
    async fn test_plurality_fallback_lowest_index() {
        let backend = Arc::new(ScriptedBackend::new().with_replies(BackendRole::Voter, ["VOTE: A", "VOTE: B", "VOTE: C"]));
        let outcome = voter(backend).maker_vote("t", &candidates(3), 2).await.unwrap();
        assert_eq!(outcome.winner_id, "A");
        assert_eq!(outcome.decision, VoteDecision::Plurality);
    }

    #[tokio::test]
    async fn test_unparsable_votes_are_discarded() {
        let backend = Arc::new(ScriptedBackend::new().with_replies(
            BackendRole::Voter,
            ["no idea", "VOTE: C", "VOTE: Z", "VOTE: C", "whatever"],
        ));
        let outcome = voter(backend).maker_vote("t", &candidates(3), 3).await.unwrap();
        assert_eq!(outcome.winner_id, "C");
        assert_eq!(outcome.decision, VoteDecision::Plurality);
        assert_eq!(outcome.discarded(), 3);
        assert_eq!(outcome.votes.get("C"), Some(&2));
    }

    #[tokio::test]
    async fn test_all_voters_failing_defaults_to_first() {
        let backend = Arc::new(
            ScriptedBackend::new().with_default(BackendRole::Voter, "[BACKEND_ERROR] voter offline"),
        );
        let outcome = voter(backend).maker_vote("t", &candidates(4), 2).await.unwrap();
        assert_eq!(outcome.winner_id, "A");
        assert_eq!(outcome.decision, VoteDecision::Default);
        assert_eq!(outcome.failed(), 3);
    }

    #[tokio::test]
    async fn test_prompt_lists_every_candidate() {
        let prompt = build_vote_prompt("sort a list", &candidates(3), 1000);
        assert!(prompt.contains("### Candidate A"));
        assert!(prompt.contains("### Candidate C"));
        assert!(prompt.contains("from A to C"));
    }

    #[tokio::test]
    async fn test_empty_candidates_is_error() {
        let backend = Arc::new(ScriptedBackend::new());
        assert!(matches!(
            voter(backend).maker_vote("t", &[], 3).await,
            Err(VotingError::NoCandidates)
        ));
    }
}
