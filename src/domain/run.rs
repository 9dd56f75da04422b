//! Run state.
//!
//! A Run is one execution of the six-step lead pipeline. It is created once,
//! advanced only by the orchestrator, and frozen when it reaches a terminal
//! status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::Artifact;
use super::lead::Lead;
use super::step::{Step, StepName, StepStatus};

/// A pipeline execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Lead selected for this run
    pub lead_id: String,

    /// Lead name at selection time
    pub lead_name: String,

    /// Lead score at selection time
    pub lead_score: f64,

    /// Current status of the run
    pub status: RunStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// "Failed at <step>: <message>" for failed runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,

    /// Steps in execution order
    pub steps: Vec<Step>,

    /// Artifacts produced by successful steps
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl Run {
    /// Create a queued run for a lead with every step pending
    pub fn new(id: Uuid, lead: &Lead) -> Self {
        Self {
            id,
            lead_id: lead.id.clone(),
            lead_name: lead.business_name.clone(),
            lead_score: lead.lead_score,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_summary: None,
            steps: StepName::ALL.iter().copied().map(Step::pending).collect(),
            artifacts: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Get a step by name
    pub fn step(&self, name: StepName) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Latest artifact produced by a step
    pub fn output_of(&self, name: StepName) -> Option<&Artifact> {
        let step = self.step(name)?;
        step.output_artifact_ids
            .iter()
            .rev()
            .find_map(|id| self.artifacts.iter().find(|a| a.id == *id))
    }

    /// Whether any step still needs to execute
    pub fn has_unfinished_steps(&self) -> bool {
        self.steps.iter().any(|s| !s.is_success())
    }

    /// Count of steps in a given status
    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Move to `running` and stamp the start time
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.started_at = Some(now);
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Succeeded;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, summary: String, now: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.error_summary = Some(summary);
        self.completed_at = Some(now);
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Canceled;
        self.completed_at = Some(now);
    }
}

/// State of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up
    Queued,

    /// Executing steps
    Running,

    /// Every step succeeded
    Succeeded,

    /// Stopped at a failing step
    Failed,

    /// Stopped by an operator
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactType;

    #[test]
    fn test_run_creation() {
        let lead = Lead::new("lead-1", "Acme Plumbing", 85.0);
        let run = Run::new(Uuid::new_v4(), &lead);

        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.lead_id, "lead-1");
        assert_eq!(run.lead_name, "Acme Plumbing");
        assert_eq!(run.steps.len(), 6);
        assert_eq!(run.count_steps(StepStatus::Pending), 6);
        assert!(run.has_unfinished_steps());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_output_of_returns_latest_artifact() {
        let lead = Lead::new("lead-1", "Acme", 50.0);
        let mut run = Run::new(Uuid::new_v4(), &lead);

        let first = Artifact::new(run.id, StepName::Enrichment, ArtifactType::Json, "{}".into());
        let second = Artifact::new(
            run.id,
            StepName::Enrichment,
            ArtifactType::Json,
            "{\"a\":1}".into(),
        );
        let step = run.step_mut(StepName::Enrichment).unwrap();
        step.output_artifact_ids.push(first.id);
        step.output_artifact_ids.push(second.id);
        run.artifacts.push(first);
        run.artifacts.push(second.clone());

        assert_eq!(run.output_of(StepName::Enrichment), Some(&second));
        assert!(run.output_of(StepName::Completion).is_none());
    }
}
