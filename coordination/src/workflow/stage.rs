//! Stage graph: legal transitions and the audited `advance` step.
//!
//! ```text
//! Created    → Preprocess
//! Preprocess → Plan
//! Plan       → Generate
//! Generate   → Vote | Plan (no candidates survived, escalation)
//! Vote       → Review | Generate (nothing pending after resume)
//! Review     → Complete | Generate (iterate) | Plan (escalation)
//! any non-terminal → Failed
//! ```

use chrono::Utc;
use tracing::info;

use crate::errors::OrchestratorError;
use crate::state::{Stage, TaskState, TransitionRecord};

/// Whether `from → to` is an edge of the stage graph.
pub fn is_legal_transition(from: Stage, to: Stage) -> bool {
    use Stage::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Created, Preprocess)
            | (Preprocess, Plan)
            | (Plan, Generate)
            | (Generate, Vote)
            | (Generate, Plan)
            | (Vote, Review)
            | (Vote, Generate)
            | (Review, Complete)
            | (Review, Generate)
            | (Review, Plan)
    )
}

/// Move `state` to `to`, recording the transition.
pub fn advance(state: &mut TaskState, to: Stage, reason: Option<String>) -> Result<(), OrchestratorError> {
    let from = state.current_stage;
    if !is_legal_transition(from, to) {
        return Err(OrchestratorError::IllegalTransition { from, to });
    }

    info!(
        task_id = %state.task_id,
        from = %from,
        to = %to,
        iteration = state.iteration_count,
        reason = reason.as_deref().unwrap_or(""),
        "stage transition"
    );

    state.transitions.push(TransitionRecord {
        from,
        to,
        iteration: state.iteration_count,
        at: Utc::now(),
        reason,
    });
    state.current_stage = to;
    state.touch();
    Ok(())
}
