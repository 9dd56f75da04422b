//! Advisory cross-instance mutex over a non-atomic store.
//!
//! The store has no compare-and-swap, so acquisition is
//! jitter → read → write → settle → read back. Whoever still owns the record
//! after the settle delay wins. This is adequate for short-held,
//! low-contention locks between a handful of instances on one machine. It is
//! not linearizable and does not tolerate skewed clocks. Backends with real
//! transactions should replace it with an atomic conditional write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::{KeyValueStore, StorageError};

/// Key of the lock record guarding run start
pub const START_MUTEX_KEY: &str = "mutex:run-start";

/// Persisted lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutexLock {
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

impl MutexLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What the lock key currently holds
enum Record {
    Absent,
    Held(MutexLock),
    /// Unparseable payload, treated as free
    Unreadable,
}

/// Timing knobs for acquisition
#[derive(Debug, Clone)]
pub struct MutexSettings {
    /// Lower bound of the random pre-read delay
    pub jitter_min: Duration,

    /// Upper bound of the random pre-read delay
    pub jitter_max: Duration,

    /// Wait between writing and reading back
    pub settle: Duration,
}

impl Default for MutexSettings {
    fn default() -> Self {
        Self {
            jitter_min: Duration::from_millis(10),
            jitter_max: Duration::from_millis(40),
            settle: Duration::from_millis(25),
        }
    }
}

/// Best-effort mutual exclusion keyed by a single store record
pub struct MutexCoordinator {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    settings: MutexSettings,
}

impl MutexCoordinator {
    pub fn new(kv: Arc<dyn KeyValueStore>, key: impl Into<String>, settings: MutexSettings) -> Self {
        Self {
            kv,
            key: key.into(),
            settings,
        }
    }

    fn jitter(&self) -> Duration {
        let min = self.settings.jitter_min.as_millis() as u64;
        let max = (self.settings.jitter_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn read(&self) -> Result<Record, StorageError> {
        Ok(match self.kv.get(&self.key).await? {
            None => Record::Absent,
            Some(raw) => match serde_json::from_str::<MutexLock>(&raw) {
                Ok(lock) => Record::Held(lock),
                Err(_) => Record::Unreadable,
            },
        })
    }

    /// Try to take the lock for `owner_id`
    pub async fn acquire(&self, owner_id: &str, ttl: Duration) -> Result<bool, StorageError> {
        tokio::time::sleep(self.jitter()).await;

        if let Record::Held(current) = self.read().await? {
            if current.owner_id != owner_id && !current.is_expired(Utc::now()) {
                debug!(key = %self.key, owner = %current.owner_id, "Mutex held by another owner");
                return Ok(false);
            }
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(5));
        let record = MutexLock {
            owner_id: owner_id.to_string(),
            expires_at: Utc::now() + ttl,
        };
        self.kv
            .set(&self.key, &serde_json::to_string(&record)?)
            .await?;

        tokio::time::sleep(self.settings.settle).await;

        match self.read().await? {
            Record::Held(stored) if stored.owner_id == owner_id => {
                debug!(key = %self.key, owner = owner_id, "Mutex acquired");
                Ok(true)
            }
            _ => {
                debug!(key = %self.key, owner = owner_id, "Mutex lost to a concurrent writer");
                Ok(false)
            }
        }
    }

    /// Release the lock if `owner_id` holds it
    pub async fn release(&self, owner_id: &str) -> Result<(), StorageError> {
        match self.read().await? {
            Record::Absent => Ok(()),
            Record::Unreadable => {
                warn!(key = %self.key, "Mutex record unreadable, removing it");
                self.kv.remove(&self.key).await
            }
            Record::Held(current) if current.owner_id == owner_id => self.kv.remove(&self.key).await,
            Record::Held(current) => {
                debug!(key = %self.key, owner = %current.owner_id, "Mutex owned elsewhere, leaving it");
                Ok(())
            }
        }
    }

    /// Current holder, if an unexpired record exists
    pub async fn holder(&self) -> Result<Option<String>, StorageError> {
        Ok(match self.read().await? {
            Record::Held(lock) if !lock.is_expired(Utc::now()) => Some(lock.owner_id),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;

    fn coordinator(kv: &MemoryStore) -> MutexCoordinator {
        MutexCoordinator::new(
            Arc::new(kv.clone()),
            START_MUTEX_KEY,
            MutexSettings {
                jitter_min: Duration::from_millis(1),
                jitter_max: Duration::from_millis(3),
                settle: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let kv = MemoryStore::new();
        let mutex = coordinator(&kv);

        assert!(mutex.acquire("a", Duration::from_secs(5)).await.unwrap());
        assert_eq!(mutex.holder().await.unwrap().as_deref(), Some("a"));
        assert!(!mutex.acquire("b", Duration::from_secs(5)).await.unwrap());

        mutex.release("a").await.unwrap();
        assert!(mutex.holder().await.unwrap().is_none());
        assert!(mutex.acquire("b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_keeps_lock() {
        let kv = MemoryStore::new();
        let mutex = coordinator(&kv);

        assert!(mutex.acquire("a", Duration::from_secs(5)).await.unwrap());
        mutex.release("b").await.unwrap();
        assert_eq!(mutex.holder().await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let kv = MemoryStore::new();
        let stale = MutexLock {
            owner_id: "ghost".to_string(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        kv.set(START_MUTEX_KEY, &serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();

        let mutex = coordinator(&kv);
        assert!(mutex.acquire("a", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_record_is_removed_on_release() {
        let kv = MemoryStore::new();
        kv.set(START_MUTEX_KEY, "{garbage").await.unwrap();

        let mutex = coordinator(&kv);
        mutex.release("anyone").await.unwrap();
        assert!(kv.get(START_MUTEX_KEY).await.unwrap().is_none());
    }
}
