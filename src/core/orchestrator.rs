//! Main orchestrator for lead pipeline runs.
//!
//! Selects and locks a lead, creates a run, drives its steps in a detached
//! task, persists after every transition, and resumes interrupted runs at
//! startup.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Generator;
use crate::domain::{Lead, LeadStatus, Run, RunStatus, StepName, StepStatus};

use super::guarded::GuardedGenerator;
use super::mutex::{MutexCoordinator, MutexSettings, START_MUTEX_KEY};
use super::pipeline::{self, PipelineContext, StepOutput};
use super::run_store::{RunStore, SaveOutcome};
use super::store::{KeyValueStore, StorageError};

/// Tunables for run orchestration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Model used for every step
    pub model: String,

    /// Cheaper model used to repair malformed structured output
    pub repair_model: String,

    /// How long a run holds its lead
    pub lock_ttl: chrono::Duration,

    /// Running runs older than this are presumed dead at startup
    pub stale_after: chrono::Duration,

    /// Pause after each successful step
    pub step_delay: Duration,

    /// Lifetime of the start mutex record
    pub mutex_ttl: Duration,

    pub mutex: MutexSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            repair_model: "gpt-4o-mini".to_string(),
            lock_ttl: chrono::Duration::minutes(30),
            stale_after: chrono::Duration::hours(6),
            step_delay: Duration::from_millis(1200),
            mutex_ttl: Duration::from_secs(5),
            mutex: MutexSettings::default(),
        }
    }
}

/// Why a run could not be started
#[derive(Debug, Error)]
pub enum StartError {
    #[error("System busy: another instance is starting a run, retry shortly")]
    Busy,

    #[error("No eligible leads")]
    NoEligibleLeads,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StartError {
    /// Whether retrying after a short delay may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// What startup recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Runs force-failed for exceeding the staleness window
    pub failed_stale: Vec<Uuid>,

    /// Runs handed back to the processing loop
    pub resumed: Vec<Uuid>,
}

struct Inner {
    store: RunStore,
    mutex: MutexCoordinator,
    generator: GuardedGenerator,
    settings: OrchestratorSettings,

    /// Runs this instance is currently processing
    active: Mutex<HashSet<Uuid>>,

    /// Set once startup recovery has run
    initialized: AtomicBool,
}

/// Marks a run as being processed by this instance until dropped
struct ActiveRun {
    inner: Arc<Inner>,
    run_id: Uuid,
}

impl ActiveRun {
    fn claim(inner: &Arc<Inner>, run_id: Uuid) -> Option<Self> {
        let inserted = inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id);

        inserted.then(|| Self {
            inner: Arc::clone(inner),
            run_id,
        })
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

/// Lead pipeline orchestrator; clones share the same state
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator over a shared store and generator
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        generator: Arc<dyn Generator>,
        settings: OrchestratorSettings,
    ) -> Self {
        let mutex = MutexCoordinator::new(Arc::clone(&kv), START_MUTEX_KEY, settings.mutex.clone());
        let generator = GuardedGenerator::new(generator, settings.repair_model.clone());

        Self {
            inner: Arc::new(Inner {
                store: RunStore::new(kv),
                mutex,
                generator,
                settings,
                active: Mutex::new(HashSet::new()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Underlying lead/run store
    pub fn store(&self) -> &RunStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Whether this instance is processing the run right now
    pub fn is_processing(&self, run_id: Uuid) -> bool {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&run_id)
    }

    /// Select the best eligible lead, lock it, and start a run for it
    ///
    /// Returns as soon as the run is persisted; steps execute in a
    /// background task.
    #[instrument(skip(self))]
    pub async fn start_run(&self) -> Result<Run, StartError> {
        let run_id = Uuid::new_v4();
        let owner = run_id.to_string();

        match self
            .inner
            .mutex
            .acquire(&owner, self.inner.settings.mutex_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(%run_id, "Start mutex busy");
                return Err(StartError::Busy);
            }
            Err(e) => {
                // The record may already have been written before the failure
                if let Err(release) = self.inner.mutex.release(&owner).await {
                    warn!(%run_id, error = %release, "Failed to release start mutex");
                }
                return Err(e.into());
            }
        }

        let created = self.create_run(run_id).await;

        if let Err(e) = self.inner.mutex.release(&owner).await {
            warn!(%run_id, error = %e, "Failed to release start mutex");
        }

        let run = created?;
        self.spawn_processing(run.id);
        Ok(run)
    }

    /// Lead selection and run creation; runs while the start mutex is held
    async fn create_run(&self, run_id: Uuid) -> Result<Run, StartError> {
        let store = &self.inner.store;
        store.clear_stale_locks().await?;

        let owner = run_id.to_string();
        let ttl = self.inner.settings.lock_ttl;
        let now = Utc::now();

        let selected = store
            .update_leads(|leads| {
                // First of the highest-scoring eligible leads
                let lead = leads
                    .iter_mut()
                    .filter(|l| l.is_eligible())
                    .min_by(|a, b| b.lead_score.total_cmp(&a.lead_score))?;
                lead.lock(&owner, ttl, now);
                Some(lead.clone())
            })
            .await?;

        let Some(lead) = selected else {
            info!("No eligible leads to process");
            return Err(StartError::NoEligibleLeads);
        };

        let run = Run::new(run_id, &lead);
        store.save_run(&run).await?;

        info!(
            %run_id,
            lead_id = %lead.id,
            lead = %lead.business_name,
            score = lead.lead_score,
            "Run created"
        );
        Ok(run)
    }

    fn spawn_processing(&self, run_id: Uuid) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.process_run(run_id).await {
                error!(%run_id, error = %format!("{:#}", e), "Run processing aborted");
            }
        });
    }

    /// Drive a run's remaining steps to a terminal status
    ///
    /// A no-op if this instance is already processing the run. Errors are
    /// storage failures only; step failures are recorded on the run.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn process_run(&self, run_id: Uuid) -> Result<()> {
        let Some(_active) = ActiveRun::claim(&self.inner, run_id) else {
            debug!("Run already being processed by this instance");
            return Ok(());
        };

        self.drive(run_id).await
    }

    async fn drive(&self, run_id: Uuid) -> Result<()> {
        let store = &self.inner.store;

        let Some(mut run) = store.get_run(run_id).await? else {
            warn!("Run not found");
            return Ok(());
        };
        if run.is_terminal() {
            debug!(status = %run.status, "Run already finished");
            return Ok(());
        }

        if run.status == RunStatus::Queued {
            run.mark_running(Utc::now());
            if !self.persist(&run).await? {
                return Ok(());
            }
            info!(lead = %run.lead_name, "Run started");
        }

        let lead = store
            .get_leads()
            .await?
            .into_iter()
            .find(|l| l.id == run.lead_id);

        let mut context = PipelineContext::default();
        let total = run.steps.len();

        for index in 0..total {
            // Observe cancellation (or any other finalization) between steps
            match store.get_run(run_id).await? {
                Some(stored) if !stored.is_terminal() => {}
                Some(stored) => {
                    info!(status = %stored.status, "Run finalized externally, halting");
                    return Ok(());
                }
                None => {
                    warn!("Run no longer in store, halting");
                    return Ok(());
                }
            }

            let step_name = run.steps[index].name;

            if run.steps[index].is_success() {
                if let Err(e) = Self::rehydrate(&run, step_name, &mut context) {
                    let message = e.root_cause().to_string();
                    error!(step = %step_name, error = %message, "Cannot restore completed step output");
                    run.mark_failed(format!("Failed at {}: {}", step_name, message), Utc::now());
                    self.persist(&run).await?;
                    return Ok(());
                }
                continue;
            }

            {
                let step = &mut run.steps[index];
                step.status = StepStatus::Running;
                step.error = None;
                step.started_at = Some(Utc::now());
                step.completed_at = None;
            }
            if !self.persist(&run).await? {
                return Ok(());
            }
            info!(step = %step_name, "Step started");

            let outcome = match &lead {
                Some(lead) => self.execute_step(step_name, lead, &context, run_id).await,
                None => Err(anyhow!("lead {} no longer exists", run.lead_id)),
            };

            match outcome {
                Ok(output) => {
                    let artifact = output.to_artifact(run_id);
                    let step = &mut run.steps[index];
                    step.status = StepStatus::Success;
                    step.completed_at = Some(Utc::now());
                    step.output_artifact_ids.push(artifact.id);
                    run.artifacts.push(artifact);
                    context.apply(output);

                    if !self.persist(&run).await? {
                        info!(step = %step_name, "Discarding step result for finalized run");
                        return Ok(());
                    }
                    info!(step = %step_name, "Step succeeded");
                }
                Err(e) => {
                    let message = e.root_cause().to_string();
                    error!(step = %step_name, error = %format!("{:#}", e), "Step failed");

                    let now = Utc::now();
                    let step = &mut run.steps[index];
                    step.status = StepStatus::Failed;
                    step.attempts += 1;
                    step.error = Some(message.clone());
                    step.completed_at = Some(now);
                    run.mark_failed(format!("Failed at {}: {}", step_name, message), now);
                    self.persist(&run).await?;
                    return Ok(());
                }
            }

            let delay = self.inner.settings.step_delay;
            if index + 1 < total && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        run.mark_succeeded(Utc::now());
        if self.persist(&run).await? {
            info!("Run succeeded");
        }
        Ok(())
    }

    /// Save progress; `false` means the stored run is already terminal
    async fn persist(&self, run: &Run) -> Result<bool> {
        match self.inner.store.save_run(run).await? {
            SaveOutcome::Saved => Ok(true),
            SaveOutcome::Deferred => {
                warn!(run_id = %run.id, "Run progress not persisted, continuing in memory");
                Ok(true)
            }
            SaveOutcome::Frozen => {
                info!(run_id = %run.id, "Run finalized elsewhere, halting");
                Ok(false)
            }
        }
    }

    /// Restore a completed step's output into the working context
    fn rehydrate(run: &Run, step: StepName, context: &mut PipelineContext) -> Result<()> {
        let artifact = run
            .output_of(step)
            .ok_or_else(|| anyhow!("no stored output for completed step"))?;
        let output = StepOutput::decode(step, artifact)?;
        context.apply(output);
        debug!(step = %step, "Restored step output from artifact");
        Ok(())
    }

    async fn execute_step(
        &self,
        step: StepName,
        lead: &Lead,
        context: &PipelineContext,
        run_id: Uuid,
    ) -> Result<StepOutput> {
        let model = &self.inner.settings.model;

        match step {
            StepName::Enrichment
            | StepName::PersonaGeneration
            | StepName::OfferGeneration
            | StepName::OutreachGeneration => {
                let request = pipeline::guarded_request(step, lead, context, model)?;
                let guarded = self.inner.generator.generate(&request).await?;
                debug!(step = %step, attempts = guarded.attempts, "Structured output received");
                Ok(StepOutput::structured(step, guarded.data)?)
            }
            StepName::FinalPackageAssembly => {
                let request = pipeline::final_package_request(lead, context, model)?;
                let content = self.inner.generator.generate_plain(&request).await?;
                if content.trim().is_empty() {
                    bail!("generator returned an empty package");
                }
                Ok(StepOutput::FinalPackage(content))
            }
            StepName::Completion => {
                self.release_lead(&lead.id, run_id).await?;
                Ok(StepOutput::Completion(pipeline::completion_note(lead, run_id)))
            }
        }
    }

    /// Hand the lead back unless another run has since taken it
    async fn release_lead(&self, lead_id: &str, run_id: Uuid) -> Result<()> {
        let owner = run_id.to_string();

        let released = self
            .inner
            .store
            .update_leads(|leads| {
                let Some(lead) = leads.iter_mut().find(|l| l.id == lead_id) else {
                    return false;
                };
                let ours = lead.locked_by_run_id.as_deref() == Some(owner.as_str());
                if lead.locked && !ours {
                    return false;
                }
                lead.unlock();
                lead.status = LeadStatus::Queued;
                true
            })
            .await
            .context("Failed to release lead lock")?;

        if released {
            info!(lead_id, "Lead released");
        } else {
            warn!(lead_id, "Lead missing or held by another run, leaving it");
        }
        Ok(())
    }

    /// Recover runs interrupted by a previous process
    ///
    /// Succeeds at most once per orchestrator; later calls return an empty
    /// report. Stale runs are failed, the rest are resumed in the
    /// background.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<ResumeReport> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("Already initialized");
            return Ok(ResumeReport::default());
        }

        let recovered = self.recover().await;
        if recovered.is_err() {
            // Allow a later call to retry the scan
            self.inner.initialized.store(false, Ordering::SeqCst);
        }
        recovered
    }

    async fn recover(&self) -> Result<ResumeReport> {
        let store = &self.inner.store;
        let stale_after = self.inner.settings.stale_after;
        let now = Utc::now();
        let mut report = ResumeReport::default();

        for run in store.list_runs().await? {
            if run.status != RunStatus::Running {
                continue;
            }

            let stale = run
                .started_at
                .map(|started| now - started > stale_after)
                .unwrap_or(true);

            if stale {
                let summary = format!(
                    "Run exceeded the {}h staleness window and was presumed interrupted",
                    stale_after.num_hours()
                );
                let updated = store
                    .update_run(run.id, |stored| {
                        if stored.status != RunStatus::Running {
                            return false;
                        }
                        stored.mark_failed(summary, now);
                        true
                    })
                    .await?;

                if matches!(updated, Some(ref r) if r.status == RunStatus::Failed) {
                    warn!(run_id = %run.id, "Failed stale run");
                    report.failed_stale.push(run.id);
                }
                continue;
            }

            if run.completed_at.is_none() && run.has_unfinished_steps() {
                info!(run_id = %run.id, lead = %run.lead_name, "Resuming interrupted run");
                report.resumed.push(run.id);
                self.spawn_processing(run.id);
            }
        }

        info!(
            failed = report.failed_stale.len(),
            resumed = report.resumed.len(),
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Request cancellation; the loop stops before its next step
    ///
    /// Returns `false` if the run had already finished.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        let mut canceled = false;
        let updated = self
            .inner
            .store
            .update_run(run_id, |run| {
                if run.is_terminal() {
                    return false;
                }
                run.mark_canceled(Utc::now());
                canceled = true;
                true
            })
            .await?;

        if updated.is_none() {
            bail!("Run {} not found", run_id);
        }
        if canceled {
            info!("Run canceled");
        }
        Ok(canceled)
    }

    /// Snapshot of one run
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.inner.store.get_run(run_id).await?)
    }

    /// All runs, newest first
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        Ok(self.inner.store.list_runs().await?)
    }

    /// Operator escape hatch: unlock every lead
    pub async fn force_unlock_all(&self) -> Result<usize> {
        Ok(self.inner.store.force_unlock_all().await?)
    }

    /// Operator control: drop the run history
    pub async fn clear_runs(&self) -> Result<()> {
        Ok(self.inner.store.clear_runs().await?)
    }
}
