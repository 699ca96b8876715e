//! Stage events streamed to the submitter of a task.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::context::CompressionSummary;
use crate::maker::VoteDecision;
use crate::state::{Stage, TaskId, TaskState};

/// Channel capacity for per-task event streams
pub const CHANNEL_CAPACITY: usize = 256;

/// Final result of a run. Failed runs carry the best partial artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    /// `Complete` or `Failed`; the last stage reached when cancelled.
    pub status: Stage,
    pub output: Option<String>,
    pub error: Option<String>,
    pub iterations: u32,
    pub generate_attempts: u32,
    pub escalated: bool,
    pub cancelled: bool,
}

impl TaskOutcome {
    pub fn from_state(state: &TaskState, cancelled: bool) -> Self {
        let output = match state.current_stage {
            Stage::Complete => state.final_output.clone(),
            _ => state.best_partial_output(),
        };
        Self {
            task_id: state.task_id.clone(),
            status: state.current_stage,
            output,
            error: state.error_message.clone(),
            iterations: state.iteration_count,
            generate_attempts: state.generate_attempts,
            escalated: state.escalated,
            cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Stage::Complete
    }
}

/// One step of a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    StageStarted {
        task_id: TaskId,
        stage: Stage,
        iteration: u32,
    },
    StageCompleted {
        task_id: TaskId,
        stage: Stage,
        next: Stage,
    },
    /// Streamed text from the planner.
    Token {
        task_id: TaskId,
        stage: Stage,
        text: String,
    },
    /// A streamed call failed and is starting over; tokens sent since the
    /// stage began belong to the abandoned attempt.
    StreamRestarted {
        task_id: TaskId,
        stage: Stage,
        attempt: u32,
    },
    CandidatesGenerated {
        task_id: TaskId,
        count: usize,
        dropped: usize,
    },
    CandidateDropped {
        task_id: TaskId,
        slot: usize,
        error: String,
    },
    VoteCast {
        task_id: TaskId,
        voter: usize,
        candidate_id: String,
    },
    VoteDiscarded {
        task_id: TaskId,
        voter: usize,
        reason: String,
    },
    ConsensusReached {
        task_id: TaskId,
        winner_id: String,
        decision: VoteDecision,
        votes: BTreeMap<String, u32>,
    },
    ReviewVerdict {
        task_id: TaskId,
        iteration: u32,
        approved: bool,
        feedback: String,
    },
    Escalated {
        task_id: TaskId,
        reason: String,
    },
    Compressed {
        task_id: TaskId,
        summary: CompressionSummary,
    },
    /// Persistence failed; the task continues in memory only.
    Degraded {
        task_id: TaskId,
        reason: String,
    },
    Cancelled {
        task_id: TaskId,
        stage: Stage,
    },
    Finished(TaskOutcome),
}

impl StageEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage_started",
            Self::StageCompleted { .. } => "stage_completed",
            Self::Token { .. } => "token",
            Self::StreamRestarted { .. } => "stream_restarted",
            Self::CandidatesGenerated { .. } => "candidates_generated",
            Self::CandidateDropped { .. } => "candidate_dropped",
            Self::VoteCast { .. } => "vote_cast",
            Self::VoteDiscarded { .. } => "vote_discarded",
            Self::ConsensusReached { .. } => "consensus_reached",
            Self::ReviewVerdict { .. } => "review_verdict",
            Self::Escalated { .. } => "escalated",
            Self::Compressed { .. } => "compressed",
            Self::Degraded { .. } => "degraded",
            Self::Cancelled { .. } => "cancelled",
            Self::Finished(_) => "finished",
        }
    }
}

/// Sending half of a task's event stream.
///
/// A dropped receiver does not stop the task; events are simply discarded.
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::Sender<StageEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<StageEvent>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    pub async fn emit(&self, event: StageEvent) {
        let event_type = event.event_type();
        if self.sender.send(event).await.is_err() {
            trace!(event_type, "event receiver gone");
        }
    }
}
