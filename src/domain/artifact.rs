//! Artifacts produced by pipeline steps.
//!
//! An artifact belongs to the run that produced it and never changes after
//! creation. Resumed runs decode them back into pipeline context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::StepName;

/// An immutable output of a successful step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: Uuid,

    /// Run that owns this artifact
    pub run_id: Uuid,

    /// Step that produced it
    pub step_name: StepName,

    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,

    pub content: String,

    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create a new artifact
    pub fn new(
        run_id: Uuid,
        step_name: StepName,
        artifact_type: ArtifactType,
        content: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_name,
            artifact_type,
            content,
            created_at: Utc::now(),
        }
    }
}

/// Content encoding of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Structured model output
    Json,

    /// Compiled prose
    Markdown,

    #[default]
    Text,
}
