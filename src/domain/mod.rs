//! Domain types for the leadrun orchestrator.
//!
//! This module contains the core data structures:
//! - Lead: Prospect records and their lock fields
//! - Run: Pipeline execution state
//! - Step: Named units of work within a run
//! - Artifact: Step outputs

pub mod artifact;
pub mod lead;
pub mod run;
pub mod step;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactType};
pub use lead::{Lead, LeadStatus};
pub use run::{Run, RunStatus};
pub use step::{Step, StepName, StepStatus};
