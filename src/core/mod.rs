//! Core orchestration logic.
//!
//! This module contains:
//! - Store: Key-value backends (file and in-memory)
//! - RunStore: Tolerant persistence for leads and runs
//! - Mutex: Advisory cross-instance start lock
//! - Guarded: Structured-output escalation around the generator
//! - Pipeline: Step prompts, required keys and typed step outputs
//! - Orchestrator: Main execution engine

pub mod guarded;
pub mod mutex;
pub mod orchestrator;
pub mod pipeline;
pub mod run_store;
pub mod store;

// Re-export commonly used types
pub use guarded::{Guarded, GuardError, GuardedGenerator, GuardedRequest};
pub use mutex::{MutexCoordinator, MutexLock, MutexSettings, START_MUTEX_KEY};
pub use orchestrator::{Orchestrator, OrchestratorSettings, ResumeReport, StartError};
pub use pipeline::{PipelineContext, PipelineError, StepOutput};
pub use run_store::{RunStore, SaveOutcome, StorageWarning};
pub use store::{FileStore, KeyValueStore, MemoryStore, StorageError};
