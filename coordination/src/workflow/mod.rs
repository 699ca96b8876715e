//! Task workflow: the stage graph, the engine that drives it, and the
//! collaborators each stage calls out to.

pub mod engine;
pub mod events;
pub mod prompts;
pub mod review;
pub mod stage;
pub mod tools;

pub use engine::WorkflowEngine;
pub use events::{EventSink, StageEvent, TaskOutcome, CHANNEL_CAPACITY};
pub use review::{parse_review, ReviewVerdict};
pub use stage::{advance, is_legal_transition};
pub use tools::{
    referenced_paths, referenced_symbols, LocalToolServer, NoopToolServer, TestReport, ToolError, ToolServer,
};
