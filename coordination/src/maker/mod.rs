//! MAKER consensus: sample N candidates, then let 2K−1 voters pick one
//! with first-to-K early stopping.

pub mod candidates;
pub mod voting;

pub use candidates::{cap_prompt, temperature_schedule, CandidateBatch, CandidateGenerator, DroppedCandidate};
pub use voting::{
    build_vote_prompt, parse_vote, Ballot, MakerVoter, VoteDecision, VoteOutcome, VoteTally, VotingError,
};
