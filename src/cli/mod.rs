//! Command-line interface for leadrun.
//!
//! Provides commands for starting runs, checking status, listing and
//! canceling runs, resuming interrupted runs, and managing leads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{Generator, HttpGenerator};
use crate::config::{self, ResolvedConfig};
use crate::core::{FileStore, Orchestrator, StartError};
use crate::domain::{Run, RunStatus, StepStatus};

pub mod leads;

/// Attempts made when the start mutex is busy
const START_ATTEMPTS: u32 = 3;

/// Interval between run status polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// leadrun - Durable AI prospecting runs over a lead collection
#[derive(Parser, Debug)]
#[command(name = "leadrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a run for the best eligible lead
    Start {
        /// Exit once processing has begun; finish later with `resume`
        #[arg(short, long)]
        detach: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Cancel a queued or running run
    Cancel {
        /// Run ID to cancel
        run_id: String,
    },

    /// Fail stale runs and continue interrupted ones
    Resume,

    /// Release every lead lock regardless of expiry
    UnlockAll,

    /// Delete the run history
    ClearRuns,

    /// Manage leads
    Leads {
        #[command(subcommand)]
        command: leads::LeadsCommands,
    },

    /// Show resolved configuration (debug)
    Config,

    /// Check that the generator is reachable and configured
    Check,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Start { detach } => start_run(cfg, detach).await,
            Commands::Status { run_id } => show_status(cfg, &run_id).await,
            Commands::Runs { limit } => list_runs(cfg, limit).await,
            Commands::Cancel { run_id } => cancel_run(cfg, &run_id).await,
            Commands::Resume => resume_runs(cfg).await,
            Commands::UnlockAll => unlock_all(cfg).await,
            Commands::ClearRuns => clear_runs(cfg).await,
            Commands::Leads { command } => execute_leads(cfg, command).await,
            Commands::Config => show_config(cfg),
            Commands::Check => check_generator(cfg).await,
        }
    }
}

/// Wire the file store and HTTP generator into an orchestrator
async fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let store = FileStore::open(cfg.store_dir())
        .await
        .with_context(|| format!("Failed to open store at {}", cfg.store_dir().display()))?
        .with_max_value_bytes(cfg.max_value_bytes);
    let generator = HttpGenerator::new(cfg.generator.http_config());

    Ok(Orchestrator::new(
        Arc::new(store),
        Arc::new(generator),
        cfg.orchestrator.clone(),
    ))
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Execute lead subcommands
async fn execute_leads(cfg: &ResolvedConfig, command: leads::LeadsCommands) -> Result<()> {
    let orchestrator = build_orchestrator(cfg).await?;
    match command {
        leads::LeadsCommands::List => leads::execute_list(orchestrator.store()).await,
        leads::LeadsCommands::Import { file } => {
            leads::execute_import(orchestrator.store(), &file).await
        }
    }
}

/// Start a run, retrying while another instance holds the start mutex
async fn start_run(cfg: &ResolvedConfig, detach: bool) -> Result<()> {
    let orchestrator = build_orchestrator(cfg).await?;
    let mut backoff = Duration::from_millis(500);
    let mut attempt = 1;

    let run = loop {
        match orchestrator.start_run().await {
            Ok(run) => break run,
            Err(e) if e.is_retryable() && attempt < START_ATTEMPTS => {
                eprintln!("System busy, retrying in {}ms...", backoff.as_millis());
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(StartError::NoEligibleLeads) => {
                println!("No eligible leads to process");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    };

    eprintln!(
        "Started run {} for {} (score {})",
        run.id, run.lead_name, run.lead_score
    );

    let run = if detach {
        wait_until(&orchestrator, run.id, |r| r.status != RunStatus::Queued).await?
    } else {
        wait_until(&orchestrator, run.id, Run::is_terminal).await?
    };

    report_outcome(&run, detach);
    Ok(())
}

/// Poll a run, printing step progress, until `done` holds
async fn wait_until<F>(orchestrator: &Orchestrator, run_id: Uuid, done: F) -> Result<Run>
where
    F: Fn(&Run) -> bool,
{
    let mut reported = 0;

    loop {
        let run = orchestrator
            .get_run(run_id)
            .await?
            .with_context(|| format!("Run {} disappeared from the store", run_id))?;

        let finished: Vec<_> = run
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Success | StepStatus::Failed))
            .collect();
        for step in finished.iter().skip(reported) {
            eprintln!("  {:<24} {}", step.name.as_str(), step.status.as_str());
        }
        reported = reported.max(finished.len());

        if done(&run) {
            return Ok(run);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn report_outcome(run: &Run, detached: bool) {
    match run.status {
        RunStatus::Succeeded => {
            if let Some(package) = run.output_of(crate::domain::StepName::FinalPackageAssembly) {
                println!("{}", package.content);
            }
            eprintln!("\n[Run {} completed successfully]", run.id);
        }
        RunStatus::Failed => {
            eprintln!(
                "\n[Run {} failed: {}]",
                run.id,
                run.error_summary.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
        RunStatus::Canceled => {
            eprintln!("\n[Run {} was canceled]", run.id);
        }
        RunStatus::Running if detached => {
            eprintln!("\n[Run {} is running; use `leadrun resume` to continue it later]", run.id);
        }
        other => {
            eprintln!("\n[Run {} in state: {}]", run.id, other);
        }
    }
}

/// Show the status of a run
async fn show_status(cfg: &ResolvedConfig, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let orchestrator = build_orchestrator(cfg).await?;
    let run = orchestrator
        .get_run(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    println!("Run ID: {}", run.id);
    println!("Lead: {} ({}, score {})", run.lead_name, run.lead_id, run.lead_score);
    println!("Status: {}", run.status);
    println!("Created: {}", run.created_at);
    if let Some(started) = run.started_at {
        println!("Started: {}", started);
    }
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(summary) = &run.error_summary {
        println!("Error: {}", summary);
    }
    println!("\nSteps:");
    for step in &run.steps {
        print!(
            "  {:<24} {:<8} attempts={}",
            step.name.as_str(),
            step.status.as_str(),
            step.attempts
        );
        match &step.error {
            Some(error) => println!("  error: {}", error),
            None => println!(),
        }
    }
    println!("\nArtifacts: {}", run.artifacts.len());

    Ok(())
}

/// List recent runs
async fn list_runs(cfg: &ResolvedConfig, limit: usize) -> Result<()> {
    let orchestrator = build_orchestrator(cfg).await?;
    let runs = orchestrator.list_runs().await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<30} {:<10} {:<6}", "RUN ID", "LEAD", "STATUS", "STEPS");
    println!("{}", "-".repeat(86));

    for run in runs.into_iter().take(limit) {
        let done = run.count_steps(StepStatus::Success);
        println!(
            "{:<38} {:<30} {:<10} {}/{}",
            run.id,
            run.lead_name,
            run.status,
            done,
            run.steps.len()
        );
    }

    Ok(())
}

async fn cancel_run(cfg: &ResolvedConfig, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let orchestrator = build_orchestrator(cfg).await?;

    if orchestrator.cancel_run(run_id).await? {
        println!("Run {} canceled", run_id);
    } else {
        println!("Run {} had already finished", run_id);
    }
    Ok(())
}

/// Run startup recovery and stay in the foreground until resumed runs finish
async fn resume_runs(cfg: &ResolvedConfig) -> Result<()> {
    let orchestrator = build_orchestrator(cfg).await?;
    let report = orchestrator.initialize().await?;

    for run_id in &report.failed_stale {
        eprintln!("Failed stale run {}", run_id);
    }
    if report.resumed.is_empty() {
        println!("No interrupted runs to resume");
        return Ok(());
    }

    for run_id in &report.resumed {
        eprintln!("Resuming run {}", run_id);
        let run = wait_until(&orchestrator, *run_id, Run::is_terminal).await?;
        println!("{} {}", run.id, run.status);
    }
    Ok(())
}

async fn unlock_all(cfg: &ResolvedConfig) -> Result<()> {
    let orchestrator = build_orchestrator(cfg).await?;
    let released = orchestrator.force_unlock_all().await?;
    println!("Unlocked {} leads", released);
    Ok(())
}

async fn clear_runs(cfg: &ResolvedConfig) -> Result<()> {
    let orchestrator = build_orchestrator(cfg).await?;
    orchestrator.clear_runs().await?;
    println!("Run history cleared");
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    let o = &cfg.orchestrator;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  Store: {}", cfg.store_dir().display());
    println!();
    println!("Generator:");
    println!("  Base URL:     {}", cfg.generator.base_url);
    println!("  Model:        {}", cfg.generator.model);
    println!("  Repair model: {}", cfg.generator.repair_model);
    println!(
        "  API key:      {} (${})",
        if cfg.generator.api_key.is_some() { "set" } else { "missing" },
        cfg.generator.api_key_env
    );
    println!("  Timeout:      {}s", cfg.generator.timeout.as_secs());
    println!();
    println!("Orchestrator:");
    println!("  Lead lock TTL:   {}m", o.lock_ttl.num_minutes());
    println!("  Stale run after: {}h", o.stale_after.num_hours());
    println!("  Step delay:      {}ms", o.step_delay.as_millis());
    println!("  Mutex TTL:       {}ms", o.mutex_ttl.as_millis());
    println!(
        "  Mutex jitter:    {}-{}ms (settle {}ms)",
        o.mutex.jitter_min.as_millis(),
        o.mutex.jitter_max.as_millis(),
        o.mutex.settle.as_millis()
    );
    println!();
    println!("Storage:");
    match cfg.max_value_bytes {
        Some(limit) => println!("  Max value size: {} bytes", limit),
        None => println!("  Max value size: unlimited"),
    }

    Ok(())
}

async fn check_generator(cfg: &ResolvedConfig) -> Result<()> {
    let generator = HttpGenerator::new(cfg.generator.http_config());
    match generator.health_check().await {
        Ok(()) => {
            println!("Generator at {} is reachable", cfg.generator.base_url);
            Ok(())
        }
        Err(e) if e.is_configuration() => {
            anyhow::bail!("Generator is not configured ({}): {}", cfg.generator.api_key_env, e)
        }
        Err(e) => anyhow::bail!("Generator health check failed: {}", e),
    }
}
