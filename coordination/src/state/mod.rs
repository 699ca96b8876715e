//! Task state and its persistence.
//!
//! # Stores
//!
//! - [`InMemoryTaskStore`]: process-local, TTL-evicting
//! - [`FileTaskStore`]: one JSON envelope per task under a directory
//! - `RocksTaskStore`: RocksDB column family, behind the `heavy-state` feature
//!
//! # Usage
//!
//! ```ignore
//! use maker_coordination::state::{FileTaskStore, TaskState, TaskStore};
//!
//! let store = FileTaskStore::open("./maker-state").await?;
//! let state = TaskState::new("task-1", "Add a CSV parser");
//! store.set(&state.task_id, &state, Duration::from_secs(86_400)).await?;
//! ```

pub mod store;
pub mod types;

#[cfg(feature = "heavy-state")]
pub use store::RocksTaskStore;
pub use store::{FileTaskStore, InMemoryTaskStore, SharedTaskStore, StoreError, StoreResult, TaskStore};
pub use types::{
    candidate_label, Candidate, CodeIteration, ReviewResult, Stage, TaskId, TaskState, TransitionRecord,
};
