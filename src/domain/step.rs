//! Pipeline steps.
//!
//! Every run executes the same fixed, ordered sequence of steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactType;

/// Identity of a pipeline step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    Enrichment,
    PersonaGeneration,
    OfferGeneration,
    OutreachGeneration,
    FinalPackageAssembly,
    Completion,
}

impl StepName {
    /// The full sequence every run executes
    pub const ALL: [StepName; 6] = [
        StepName::Enrichment,
        StepName::PersonaGeneration,
        StepName::OfferGeneration,
        StepName::OutreachGeneration,
        StepName::FinalPackageAssembly,
        StepName::Completion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrichment => "enrichment",
            Self::PersonaGeneration => "persona-generation",
            Self::OfferGeneration => "offer-generation",
            Self::OutreachGeneration => "outreach-generation",
            Self::FinalPackageAssembly => "final-package-assembly",
            Self::Completion => "completion",
        }
    }

    /// Kind of artifact the step produces
    pub fn artifact_type(&self) -> ArtifactType {
        match self {
            Self::Enrichment
            | Self::PersonaGeneration
            | Self::OfferGeneration
            | Self::OutreachGeneration => ArtifactType::Json,
            Self::FinalPackageAssembly => ArtifactType::Markdown,
            Self::Completion => ArtifactType::Text,
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully; never executed again
    Success,

    /// Failed (with error)
    Failed,

    /// Not executed
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One named unit of work within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: StepName,

    #[serde(default)]
    pub status: StepStatus,

    /// Number of times execution began
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Artifacts produced, in creation order
    #[serde(default)]
    pub output_artifact_ids: Vec<Uuid>,
}

impl Step {
    pub fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            started_at: None,
            completed_at: None,
            output_artifact_ids: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}
