//! leadrun - Durable orchestrator for AI prospecting runs
//!
//! Picks the highest-scoring eligible lead, locks it, and drives a fixed
//! six-step generation pipeline over it in the background.
//!
//! # Architecture
//!
//! The system is built around whole-document persistence:
//! - Every step transition is written to the store before moving on
//! - Terminal runs are frozen and never rewritten
//! - Interrupted runs are resumed from the first unfinished step
//!
//! # Modules
//!
//! - `adapters`: Generator interface and the HTTP chat-completions client
//! - `core`: Orchestration logic (RunStore, MutexCoordinator, GuardedGenerator)
//! - `domain`: Data structures (Lead, Run, Step, Artifact)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Load leads and start a run
//! leadrun leads import leads.json
//! leadrun start
//!
//! # Check run status
//! leadrun status <run-id>
//!
//! # Continue runs interrupted by a crash
//! leadrun resume
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorSettings, RunStore};
pub use domain::{Artifact, Lead, LeadStatus, Run, RunStatus, Step, StepName, StepStatus};
