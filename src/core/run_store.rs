//! Durable store for leads and runs.
//!
//! Runs live in one versioned JSON document:
//!
//! ```json
//! { "version": 1, "runs": { "<run-id>": { ... } } }
//! ```
//!
//! Reads are tolerant (bad entries are dropped, legacy flat maps are migrated,
//! garbage resets to an empty document). Writes are strict and always emit the
//! full versioned wrapper. Leads live in a separate JSON array that is read
//! and replaced as a whole; entries that fail to decode ride along untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Lead, Run};

use super::store::{KeyValueStore, StorageError};

/// Key holding the run document
pub const RUNS_KEY: &str = "runs";

/// Key holding the lead collection
pub const LEADS_KEY: &str = "leads";

/// Current run document schema version
pub const RUN_DOCUMENT_VERSION: u64 = 1;

/// Versioned wrapper persisted under [`RUNS_KEY`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    pub version: u64,
    pub runs: BTreeMap<String, Run>,
}

impl Default for RunDocument {
    fn default() -> Self {
        Self {
            version: RUN_DOCUMENT_VERSION,
            runs: BTreeMap::new(),
        }
    }
}

/// How a stored payload was interpreted
#[derive(Debug)]
pub enum DecodedDocument {
    /// Current schema; `dropped` entries failed to decode
    Current { document: RunDocument, dropped: usize },

    /// Unversioned flat map that must be written back in the current schema
    Legacy { document: RunDocument, dropped: usize },

    /// Unparseable or unknown shape
    Unrecognized,
}

/// Interpret a raw run document payload
pub fn decode_document(raw: &str) -> DecodedDocument {
    let mut map = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => return DecodedDocument::Unrecognized,
    };

    match map.get("version").map(Value::as_u64) {
        None => {
            let (runs, dropped) = decode_entries(map);
            DecodedDocument::Legacy {
                document: RunDocument {
                    version: RUN_DOCUMENT_VERSION,
                    runs,
                },
                dropped,
            }
        }
        Some(Some(RUN_DOCUMENT_VERSION)) => match map.remove("runs") {
            Some(Value::Object(entries)) => {
                let (runs, dropped) = decode_entries(entries);
                DecodedDocument::Current {
                    document: RunDocument {
                        version: RUN_DOCUMENT_VERSION,
                        runs,
                    },
                    dropped,
                }
            }
            _ => DecodedDocument::Unrecognized,
        },
        Some(_) => DecodedDocument::Unrecognized,
    }
}

fn decode_entries(entries: Map<String, Value>) -> (BTreeMap<String, Run>, usize) {
    let mut runs = BTreeMap::new();
    let mut dropped = 0;

    for (key, value) in entries {
        match serde_json::from_value::<Run>(value) {
            Ok(run) => {
                runs.insert(run.id.to_string(), run);
            }
            Err(e) => {
                debug!(entry = %key, error = %e, "Dropping invalid run entry");
                dropped += 1;
            }
        }
    }

    (runs, dropped)
}

/// One stored lead entry, kept alongside its raw form
enum LeadEntry {
    Decoded { raw: Value, lead: Lead },

    /// Not a lead this crate can read; preserved verbatim
    Opaque(Value),
}

fn decoded_leads(entries: &[LeadEntry]) -> Vec<Lead> {
    entries
        .iter()
        .filter_map(|entry| match entry {
            LeadEntry::Decoded { lead, .. } => Some(lead.clone()),
            LeadEntry::Opaque(_) => None,
        })
        .collect()
}

/// Put edited leads back into their stored positions
///
/// Decoded slots take the next edited lead in order; unchanged ones keep
/// their raw form. Leads beyond the original count are appended.
fn splice_leads(entries: Vec<LeadEntry>, leads: Vec<Lead>) -> Result<Vec<Value>, serde_json::Error> {
    let mut edited = leads.into_iter();
    let mut out = Vec::with_capacity(entries.len());

    for entry in entries {
        match entry {
            LeadEntry::Opaque(raw) => out.push(raw),
            LeadEntry::Decoded { raw, lead } => match edited.next() {
                Some(next) if next == lead => out.push(raw),
                Some(next) => out.push(serde_json::to_value(&next)?),
                None => {}
            },
        }
    }

    for extra in edited {
        out.push(serde_json::to_value(&extra)?);
    }
    Ok(out)
}

/// Result of a write that may have been deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Persisted
    Saved,

    /// Capacity exceeded; only the caller's in-memory copy is current
    Deferred,

    /// The stored run is already terminal and was left untouched
    Frozen,
}

/// User-visible notice that a write could not be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct StorageWarning {
    pub key: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Lead and run persistence over a shared key-value store
pub struct RunStore {
    kv: Arc<dyn KeyValueStore>,

    /// Serializes this process's read-modify-write cycles on the run document
    runs_lock: Mutex<()>,

    /// Same, for the lead collection
    leads_lock: Mutex<()>,

    warnings: watch::Sender<Option<StorageWarning>>,
}

impl RunStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        let (warnings, _) = watch::channel(None);
        Self {
            kv,
            runs_lock: Mutex::new(()),
            leads_lock: Mutex::new(()),
            warnings,
        }
    }

    /// The underlying key-value store
    pub fn backend(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.kv)
    }

    /// Subscribe to storage warnings; `None` once a write succeeds again
    pub fn warnings(&self) -> watch::Receiver<Option<StorageWarning>> {
        self.warnings.subscribe()
    }

    /// Latest unresolved storage warning
    pub fn current_warning(&self) -> Option<StorageWarning> {
        self.warnings.borrow().clone()
    }

    /// Write a value, turning capacity failures into a warning
    async fn write(&self, key: &str, value: &str) -> Result<SaveOutcome, StorageError> {
        match self.kv.set(key, value).await {
            Ok(()) => {
                if self.warnings.borrow().is_some() {
                    info!(key, "Storage write succeeded, clearing warning");
                    self.warnings.send_replace(None);
                }
                Ok(SaveOutcome::Saved)
            }
            Err(e @ StorageError::CapacityExceeded { .. }) => {
                warn!(key, error = %e, "Storage write deferred; in-memory state is authoritative");
                self.warnings.send_replace(Some(StorageWarning {
                    key: key.to_string(),
                    message: e.to_string(),
                    at: Utc::now(),
                }));
                Ok(SaveOutcome::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Leads
    // ------------------------------------------------------------------

    async fn read_lead_entries(&self) -> Result<Vec<LeadEntry>, StorageError> {
        let Some(raw) = self.kv.get(LEADS_KEY).await? else {
            return Ok(Vec::new());
        };

        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            _ => {
                warn!("Lead collection is unreadable, treating as empty");
                return Ok(Vec::new());
            }
        };

        Ok(entries
            .into_iter()
            .map(|raw| match serde_json::from_value::<Lead>(raw.clone()) {
                Ok(lead) => LeadEntry::Decoded { raw, lead },
                Err(e) => {
                    warn!(error = %e, "Skipping invalid lead entry");
                    LeadEntry::Opaque(raw)
                }
            })
            .collect())
    }

    /// Read every lead
    pub async fn get_leads(&self) -> Result<Vec<Lead>, StorageError> {
        let _guard = self.leads_lock.lock().await;
        let entries = self.read_lead_entries().await?;
        Ok(decoded_leads(&entries))
    }

    /// Replace the whole lead collection
    pub async fn save_leads(&self, leads: &[Lead]) -> Result<SaveOutcome, StorageError> {
        let _guard = self.leads_lock.lock().await;
        let json = serde_json::to_string(leads)?;
        self.write(LEADS_KEY, &json).await
    }

    /// Read-modify-write the lead collection; writes only if `f` changed it
    ///
    /// `f` sees the decodable leads only. Entries it cannot see, and leads it
    /// left unchanged, are written back exactly as they were stored.
    pub async fn update_leads<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Vec<Lead>) -> T,
    {
        let _guard = self.leads_lock.lock().await;
        let entries = self.read_lead_entries().await?;
        let before = decoded_leads(&entries);
        let mut leads = before.clone();
        let out = f(&mut leads);

        if leads != before {
            let json = serde_json::to_string(&splice_leads(entries, leads)?)?;
            self.write(LEADS_KEY, &json).await?;
        }
        Ok(out)
    }

    /// Release every lock whose expiry is missing, unreadable, or past
    pub async fn clear_stale_locks(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let released = self
            .update_leads(|leads| {
                let mut released = 0;
                for lead in leads.iter_mut().filter(|l| l.has_stale_lock(now)) {
                    debug!(lead_id = %lead.id, run_id = ?lead.locked_by_run_id, "Releasing stale lead lock");
                    lead.unlock();
                    released += 1;
                }
                released
            })
            .await?;

        if released > 0 {
            info!(released, "Cleared stale lead locks");
        }
        Ok(released)
    }

    /// Clear lock fields on every lead regardless of expiry
    pub async fn force_unlock_all(&self) -> Result<usize, StorageError> {
        let released = self
            .update_leads(|leads| {
                let mut released = 0;
                for lead in leads.iter_mut() {
                    if lead.locked || lead.locked_by_run_id.is_some() || lead.lock_expires_at.is_some() {
                        lead.unlock();
                        released += 1;
                    }
                }
                released
            })
            .await?;

        warn!(released, "Force-unlocked all leads");
        Ok(released)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Load the run document, migrating or resetting it as needed.
    /// Callers must hold `runs_lock`.
    async fn load_document(&self) -> Result<RunDocument, StorageError> {
        let Some(raw) = self.kv.get(RUNS_KEY).await? else {
            return Ok(RunDocument::default());
        };

        match decode_document(&raw) {
            DecodedDocument::Current { document, dropped } => {
                if dropped > 0 {
                    debug!(dropped, "Ignored invalid run entries");
                }
                Ok(document)
            }
            DecodedDocument::Legacy { document, dropped } => {
                info!(
                    runs = document.runs.len(),
                    dropped, "Migrating legacy run map to versioned document"
                );
                let json = serde_json::to_string(&document)?;
                self.write(RUNS_KEY, &json).await?;
                Ok(document)
            }
            DecodedDocument::Unrecognized => {
                let document = RunDocument::default();
                if raw.trim().is_empty() {
                    debug!("Run document is empty, starting fresh");
                } else {
                    warn!("Run document is unreadable, resetting to an empty document");
                    let json = serde_json::to_string(&document)?;
                    self.write(RUNS_KEY, &json).await?;
                }
                Ok(document)
            }
        }
    }

    /// Get a run by ID
    pub async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StorageError> {
        let _guard = self.runs_lock.lock().await;
        let mut document = self.load_document().await?;
        Ok(document.runs.remove(&id.to_string()))
    }

    /// Insert or replace a run
    ///
    /// Returns [`SaveOutcome::Frozen`] without writing when the stored copy
    /// is already terminal.
    pub async fn save_run(&self, run: &Run) -> Result<SaveOutcome, StorageError> {
        let _guard = self.runs_lock.lock().await;
        let mut document = self.load_document().await?;
        let key = run.id.to_string();

        if let Some(stored) = document.runs.get(&key) {
            if stored.is_terminal() {
                debug!(run_id = %run.id, status = %stored.status, "Refusing to overwrite terminal run");
                return Ok(SaveOutcome::Frozen);
            }
        }

        document.runs.insert(key, run.clone());
        let json = serde_json::to_string(&document)?;
        self.write(RUNS_KEY, &json).await
    }

    /// Read-modify-write one run; `f` returns whether to write it back
    ///
    /// Terminal runs are handed to `f` like any other, but a write is still
    /// refused for them. Returns the run as stored afterwards, or `None` if
    /// it does not exist.
    pub async fn update_run<F>(&self, id: Uuid, f: F) -> Result<Option<Run>, StorageError>
    where
        F: FnOnce(&mut Run) -> bool,
    {
        let _guard = self.runs_lock.lock().await;
        let mut document = self.load_document().await?;
        let key = id.to_string();

        let Some(mut run) = document.runs.get(&key).cloned() else {
            return Ok(None);
        };
        let was_terminal = run.is_terminal();

        if !f(&mut run) || was_terminal {
            return Ok(document.runs.remove(&key));
        }

        document.runs.insert(key, run.clone());
        let json = serde_json::to_string(&document)?;
        self.write(RUNS_KEY, &json).await?;
        Ok(Some(run))
    }

    /// All runs, most recently created first
    pub async fn list_runs(&self) -> Result<Vec<Run>, StorageError> {
        let _guard = self.runs_lock.lock().await;
        let document = self.load_document().await?;
        let mut runs: Vec<Run> = document.runs.into_values().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Drop the entire run history
    pub async fn clear_runs(&self) -> Result<(), StorageError> {
        let _guard = self.runs_lock.lock().await;
        self.kv.remove(RUNS_KEY).await?;
        warn!("Cleared run history");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use crate::domain::RunStatus;
    use serde_json::json;

    fn sample_run(name: &str) -> Run {
        Run::new(Uuid::new_v4(), &Lead::new(format!("lead-{}", name), name, 50.0))
    }

    #[test]
    fn test_decode_current_document_drops_invalid_entries() {
        let run = sample_run("Acme");
        let raw = json!({
            "version": 1,
            "runs": {
                run.id.to_string(): run,
                "broken": { "id": "nope" }
            }
        })
        .to_string();

        match decode_document(&raw) {
            DecodedDocument::Current { document, dropped } => {
                assert_eq!(document.runs.len(), 1);
                assert_eq!(dropped, 1);
            }
            other => panic!("Expected current document, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_shapes() {
        assert!(matches!(decode_document("not json"), DecodedDocument::Unrecognized));
        assert!(matches!(decode_document("[1,2,3]"), DecodedDocument::Unrecognized));
        assert!(matches!(
            decode_document(r#"{"version": 2, "runs": {}}"#),
            DecodedDocument::Unrecognized
        ));
        assert!(matches!(
            decode_document(r#"{"version": 1, "runs": []}"#),
            DecodedDocument::Unrecognized
        ));
    }

    #[test]
    fn test_decode_flat_map_is_legacy() {
        let run = sample_run("Acme");
        let raw = json!({ run.id.to_string(): run }).to_string();
        assert!(matches!(
            decode_document(&raw),
            DecodedDocument::Legacy { dropped: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_terminal_runs_are_frozen() {
        let store = RunStore::new(Arc::new(MemoryStore::new()));
        let mut run = sample_run("Acme");
        run.mark_canceled(Utc::now());
        assert_eq!(store.save_run(&run).await.unwrap(), SaveOutcome::Saved);

        run.status = RunStatus::Running;
        assert_eq!(store.save_run(&run).await.unwrap(), SaveOutcome::Frozen);

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Canceled);
    }

    #[test]
    fn test_splice_keeps_opaque_entries_in_place() {
        let first = Lead::new("a", "Acme", 10.0);
        let opaque = json!({ "id": "b", "leadScore": "high" });
        let entries = vec![
            LeadEntry::Decoded {
                raw: serde_json::to_value(&first).unwrap(),
                lead: first.clone(),
            },
            LeadEntry::Opaque(opaque.clone()),
        ];

        let mut edited = first.clone();
        edited.business_name = "Acme Ltd".to_string();
        let added = Lead::new("c", "Cobalt", 5.0);

        let out = splice_leads(entries, vec![edited, added]).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["businessName"], json!("Acme Ltd"));
        assert_eq!(out[1], opaque);
        assert_eq!(out[2]["id"], json!("c"));
    }

    #[tokio::test]
    async fn test_update_leads_skips_write_when_unchanged() {
        let kv = MemoryStore::new();
        let store = RunStore::new(Arc::new(kv.clone()));

        let count = store.update_leads(|leads| leads.len()).await.unwrap();
        assert_eq!(count, 0);
        assert!(kv.get(LEADS_KEY).await.unwrap().is_none());
    }
}
