//! Lead CLI subcommands.
//!
//! - `list`: Show the lead collection with lock state
//! - `import`: Merge leads from a JSON array file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;

use crate::core::RunStore;
use crate::domain::Lead;

/// Lead-related subcommands
#[derive(Subcommand, Debug)]
pub enum LeadsCommands {
    /// List stored leads, best first
    List,

    /// Import leads from a JSON array, replacing entries with the same id
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },
}

/// Print the lead table
pub async fn execute_list(store: &RunStore) -> Result<()> {
    let mut leads = store.get_leads().await?;
    if leads.is_empty() {
        println!("No leads stored");
        return Ok(());
    }

    leads.sort_by(|a, b| b.lead_score.total_cmp(&a.lead_score));
    let now = Utc::now();

    println!("{:<24} {:<30} {:>7} {:<12} {:<10}", "ID", "BUSINESS", "SCORE", "STATUS", "LOCK");
    println!("{}", "-".repeat(87));

    for lead in leads {
        let lock = if lead.has_active_lock(now) {
            "held"
        } else if lead.locked {
            "stale"
        } else {
            "-"
        };
        println!(
            "{:<24} {:<30} {:>7.1} {:<12} {:<10}",
            truncate(&lead.id, 24),
            truncate(&lead.business_name, 30),
            lead.lead_score,
            lead.status.as_str(),
            lock
        );
    }

    Ok(())
}

/// Merge leads from a file into the store
pub async fn execute_import(store: &RunStore, file: &Path) -> Result<()> {
    let incoming = read_leads_file(file)?;
    let count = incoming.len();

    let (added, replaced) = store
        .update_leads(|leads| merge_leads(leads, incoming))
        .await?;

    if store.current_warning().is_some() {
        eprintln!("Warning: lead collection exceeds storage capacity and was not saved");
    }

    println!(
        "Imported {} leads from {} ({} new, {} replaced)",
        count,
        file.display(),
        added,
        replaced
    );
    Ok(())
}

fn read_leads_file(file: &Path) -> Result<Vec<Lead>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read leads file: {}", file.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse leads file (expected a JSON array): {}", file.display()))
}

/// Upsert by id; lock fields of existing leads are preserved
fn merge_leads(leads: &mut Vec<Lead>, incoming: Vec<Lead>) -> (usize, usize) {
    let mut added = 0;
    let mut replaced = 0;

    for mut lead in incoming {
        match leads.iter_mut().find(|l| l.id == lead.id) {
            Some(existing) => {
                lead.locked = existing.locked;
                lead.locked_by_run_id = existing.locked_by_run_id.take();
                lead.locked_at = existing.locked_at;
                lead.lock_expires_at = existing.lock_expires_at;
                if existing.locked {
                    lead.status = existing.status.clone();
                }
                *existing = lead;
                replaced += 1;
            }
            None => {
                leads.push(lead);
                added += 1;
            }
        }
    }

    (added, replaced)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LeadStatus;

    #[test]
    fn test_merge_preserves_locks() {
        let now = Utc::now();
        let mut locked = Lead::new("a", "Acme", 50.0);
        locked.lock("run-1", chrono::Duration::minutes(30), now);
        let mut leads = vec![locked];

        let incoming = vec![Lead::new("a", "Acme Renamed", 90.0), Lead::new("b", "Bolt", 10.0)];
        let (added, replaced) = merge_leads(&mut leads, incoming);

        assert_eq!((added, replaced), (1, 1));
        assert_eq!(leads[0].business_name, "Acme Renamed");
        assert_eq!(leads[0].lead_score, 90.0);
        assert!(leads[0].locked);
        assert_eq!(leads[0].locked_by_run_id.as_deref(), Some("run-1"));
        assert_eq!(leads[0].status, LeadStatus::Processing);
        assert_eq!(leads[1].id, "b");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer name", 10), "a much ...");
    }
}
