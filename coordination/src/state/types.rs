//! Persisted task state.
//!
//! A [`TaskState`] is the complete durable record of one workflow run. It is
//! written to the task store after every stage, and `resume` rebuilds a run
//! from it alone.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task identifier (caller-chosen or a UUID).
pub type TaskId = String;

/// Workflow stages.
///
/// `TaskState::current_stage` names the stage that runs next; `Complete` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Preprocess,
    Plan,
    Generate,
    Vote,
    Review,
    Complete,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preprocess => "preprocess",
            Self::Plan => "plan",
            Self::Generate => "generate",
            Self::Vote => "vote",
            Self::Review => "review",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generated solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Letter tag: "A", "B", ...
    pub id: String,
    /// Generation order, 0-based.
    pub index: usize,
    pub text: String,
    pub temperature: f32,
}

/// Letter tag for the candidate at `index` ("A" for 0).
pub fn candidate_label(index: usize) -> String {
    char::from(b'A' + (index % 26) as u8).to_string()
}

/// The winning candidate of one GENERATE → VOTE round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeIteration {
    /// `iteration_count` when this code was generated.
    pub iteration: u32,
    pub candidate_id: String,
    pub code: String,
    pub candidates_considered: usize,
    /// Counted votes per candidate id.
    #[serde(default)]
    pub votes: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
}

/// One reviewer verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub iteration: u32,
    pub approved: bool,
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A recorded stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Stage,
    pub to: Stage,
    /// `iteration_count` at the time of the transition.
    pub iteration: u32,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Durable state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub user_input: String,
    pub current_stage: Stage,
    #[serde(default)]
    pub preprocessed_text: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub code_iterations: Vec<CodeIteration>,
    #[serde(default)]
    pub review_results: Vec<ReviewResult>,
    /// Approved code on COMPLETE; the best partial artifact on FAILED.
    #[serde(default)]
    pub final_output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Rejections absorbed so far; never exceeds the configured maximum.
    pub iteration_count: u32,
    /// Whether the one-time replan has been used.
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub generate_attempts: u32,
    /// Candidates awaiting a vote; empty outside GENERATE → VOTE.
    #[serde(default)]
    pub pending_candidates: Vec<Candidate>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(task_id: impl Into<TaskId>, user_input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            user_input: user_input.into(),
            current_stage: Stage::Created,
            preprocessed_text: None,
            plan: None,
            code_iterations: Vec::new(),
            review_results: Vec::new(),
            final_output: None,
            error_message: None,
            iteration_count: 0,
            escalated: false,
            generate_attempts: 0,
            pending_candidates: Vec::new(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// Most recent winning code, if any.
    pub fn last_code(&self) -> Option<&str> {
        self.code_iterations.last().map(|c| c.code.as_str())
    }

    /// The best artifact produced so far: final output, else the latest
    /// code, else the plan.
    pub fn best_partial_output(&self) -> Option<String> {
        self.final_output
            .clone()
            .or_else(|| self.last_code().map(str::to_string))
            .or_else(|| self.plan.clone())
    }

    /// Input as seen by later stages.
    pub fn effective_input(&self) -> &str {
        self.preprocessed_text.as_deref().unwrap_or(&self.user_input)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_state() {
        let state = TaskState::new("t1", "write a parser");
        assert_eq!(state.current_stage, Stage::Created);
        assert_eq!(state.iteration_count, 0);
        assert!(!state.is_terminal());
        assert_eq!(state.effective_input(), "write a parser");
        assert!(state.best_partial_output().is_none());
    }

    #[test]
    fn test_best_partial_output_prefers_code_over_plan() {
        let mut state = TaskState::new("t1", "x");
        state.plan = Some("plan".into());
        assert_eq!(state.best_partial_output().as_deref(), Some("plan"));

        state.code_iterations.push(CodeIteration {
            iteration: 0,
            candidate_id: "A".into(),
            code: "fn a() {}".into(),
            candidates_considered: 1,
            votes: BTreeMap::new(),
            created_at: Utc::now(),
        });
        assert_eq!(state.best_partial_output().as_deref(), Some("fn a() {}"));

        state.final_output = Some("final".into());
        assert_eq!(state.best_partial_output().as_deref(), Some("final"));
    }

    #[test]
    fn test_candidate_labels() {
        assert_eq!(candidate_label(0), "A");
        assert_eq!(candidate_label(4), "E");
        assert_eq!(candidate_label(25), "Z");
    }

    #[test]
    fn test_stage_serde_snake_case() {
        assert_eq!(serde_json::to_string(&Stage::Preprocess).unwrap(), "\"preprocess\"");
        assert!(Stage::Complete.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Review.is_terminal());
    }

    #[test]
    fn test_old_records_without_optional_fields_load() {
        let json = r#"{
            "task_id": "t1",
            "user_input": "x",
            "current_stage": "plan",
            "iteration_count": 1,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let state: TaskState = serde_json::from_str(json).unwrap();
        assert_eq!(state.current_stage, Stage::Plan);
        assert!(state.transitions.is_empty());
        assert!(!state.escalated);
    }
}
