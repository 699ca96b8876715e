//! MAKER Coordination Library
//!
//! This library provides:
//! - A staged workflow engine (preprocess, plan, generate, vote, review) for
//!   coding tasks served by local inference backends
//! - MAKER candidate generation with first-to-K voting
//! - Token-budgeted context compression with hierarchical summaries
//! - Per-backend admission control for servers that are not reentrant
//!
//! # Backends
//!
//! Every call names a [`BackendRole`]. Each role maps to an OpenAI-compatible
//! endpoint ([`HttpBackend`]) or to a [`ScriptedBackend`] for offline runs.
//! Calls go through a [`BackendCaller`], which holds the role's admission
//! permit and applies the call timeout.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use maker_coordination::{InMemoryTaskStore, OrchestratorConfig, ScriptedBackend, StageEvent, WorkflowEngine};
//!
//! # async fn demo() -> Result<(), maker_coordination::OrchestratorError> {
//! let engine = WorkflowEngine::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(ScriptedBackend::new()),
//!     InMemoryTaskStore::new().shared(),
//! )?
//! .shared();
//!
//! let mut events = engine.submit("task-1", "Add a retry helper")?;
//! while let Some(event) = events.recv().await {
//!     if let StageEvent::Finished(outcome) = event {
//!         println!("{}: {:?}", outcome.status, outcome.output);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod admission;
pub mod backend;
pub mod config;
pub mod context;
pub mod errors;
pub mod maker;
pub mod state;
pub mod workflow;

pub use admission::{AdmissionController, AdmissionError, AdmissionPermit, RoleAdmissionStats};
pub use backend::{
    BackendCaller, BackendError, BackendRequest, BackendRole, HttpBackend, InferenceBackend, RoleEndpoint,
    RoleTable, ScriptedBackend, ScriptedReply,
};
pub use config::{ConfigError, OrchestratorConfig};
pub use context::{
    CompressionReport, CompressorConfig, CompressorStats, ContextCompressor, MessageRole, Summarizer,
    TiktokenEstimator, TokenEstimator,
};
pub use errors::{OrchestratorError, RetryCategory};
pub use maker::{CandidateGenerator, MakerVoter, VoteDecision, VoteOutcome, VotingError};
pub use state::{
    Candidate, FileTaskStore, InMemoryTaskStore, SharedTaskStore, Stage, TaskId, TaskState, TaskStore,
};
pub use workflow::{LocalToolServer, NoopToolServer, StageEvent, TaskOutcome, ToolServer, WorkflowEngine};
