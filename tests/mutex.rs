//! Start Mutex Integration Tests
//!
//! Several coordinators over one shared store model separate instances
//! contending for the start lock.

use std::sync::Arc;
use std::time::Duration;

use leadrun::core::{KeyValueStore, MemoryStore, MutexCoordinator, MutexSettings, START_MUTEX_KEY};

fn contender(kv: &MemoryStore) -> MutexCoordinator {
    MutexCoordinator::new(
        Arc::new(kv.clone()),
        START_MUTEX_KEY,
        MutexSettings {
            jitter_min: Duration::from_millis(5),
            jitter_max: Duration::from_millis(50),
            settle: Duration::from_millis(150),
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_single_winner() {
    let kv = MemoryStore::new();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let mutex = contender(&kv);
            tokio::spawn(async move {
                let owner = format!("instance-{}", i);
                let won = mutex.acquire(&owner, Duration::from_secs(5)).await.unwrap();
                (owner, won)
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        let (owner, won) = handle.await.unwrap();
        if won {
            winners.push(owner);
        }
    }

    assert_eq!(winners.len(), 1, "winners: {:?}", winners);

    // The stored record names the winner
    let holder = contender(&kv).holder().await.unwrap();
    assert_eq!(holder.as_ref(), winners.first());
}

#[tokio::test]
async fn test_holder_blocks_until_release() {
    let kv = MemoryStore::new();
    let a = contender(&kv);
    let b = contender(&kv);

    assert!(a.acquire("a", Duration::from_secs(5)).await.unwrap());
    assert!(!b.acquire("b", Duration::from_secs(5)).await.unwrap());

    a.release("a").await.unwrap();
    assert!(kv.get(START_MUTEX_KEY).await.unwrap().is_none());
    assert!(b.acquire("b", Duration::from_secs(5)).await.unwrap());
}

#[tokio::test]
async fn test_lock_expires_after_ttl() {
    let kv = MemoryStore::new();
    let a = contender(&kv);
    let b = contender(&kv);

    assert!(a.acquire("a", Duration::from_millis(50)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(a.holder().await.unwrap().is_none());
    assert!(b.acquire("b", Duration::from_secs(5)).await.unwrap());
}
