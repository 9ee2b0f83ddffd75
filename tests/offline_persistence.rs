use std::sync::Arc;

use stepsync::capabilities::kv::SqliteKv;
use stepsync::config::{QueueConfig, SyncConfig};
use stepsync::model::ConflictResolution;
use stepsync::{DurableQueueStore, KeyValueStore, Priority, StepQueue, SyncEngine, TransportError};
use tempfile::tempdir;

fn open_queue(kv: Arc<dyn KeyValueStore>) -> StepQueue {
    StepQueue::new(DurableQueueStore::new(kv), QueueConfig::default())
}

#[tokio::test]
async fn test_queue_survives_restart_on_sqlite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("steps.db");

    let (high_id, conflict_id) = {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::open(&path).unwrap());
        let queue = open_queue(kv);
        queue.initialize().await;

        queue.queue_steps(40, Priority::Low, None).await;
        let high = queue.queue_steps(900, Priority::High, None).await.unwrap();
        queue.queue_steps(-15, Priority::Normal, None).await;
        let conflict = queue.record_conflict(100, 1_150, 1_100).await;
        (high, conflict.id)
    };

    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::open(&path).unwrap());
    let queue = open_queue(kv);
    queue.initialize().await;

    let items = queue.unsynced_steps().await;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].id, high_id);
    assert_eq!(
        items.iter().map(|i| i.priority).collect::<Vec<_>>(),
        vec![Priority::High, Priority::Normal, Priority::Low]
    );
    assert_eq!(queue.total_unsynced_delta().await, 925);

    let conflicts = queue.unresolved_conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, conflict_id);
    assert_eq!(conflicts[0].discrepancy(), 50);

    queue
        .resolve_conflict(&conflict_id, ConflictResolution::AcceptServer)
        .await
        .unwrap();
    assert!(queue.unresolved_conflicts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_items_are_dropped_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("steps.db");

    {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::open(&path).unwrap());
        let queue = Arc::new(open_queue(kv));
        queue.initialize().await;
        queue.queue_steps(60, Priority::Normal, None).await;

        let engine = SyncEngine::new(Arc::clone(&queue), SyncConfig::default());
        for _ in 0..2 {
            let outcome = engine
                .sync_with_retry(
                    |_req| async {
                        Err::<i64, _>(TransportError::Timeout { timeout_ms: 30_000 })
                    },
                    3,
                )
                .await;
            assert!(!outcome.is_success());
        }
        assert_eq!(queue.unsynced_steps().await[0].attempts, 6);
    }

    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::open(&path).unwrap());
    let queue = open_queue(kv);
    queue.initialize().await;
    assert_eq!(queue.unsynced_steps().await[0].attempts, 6);

    assert_eq!(queue.remove_failed_items(5).await, 1);
    assert!(queue.unsynced_steps().await.is_empty());
}

#[tokio::test]
async fn test_mark_all_synced_is_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("steps.db");

    {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::open(&path).unwrap());
        let queue = open_queue(kv);
        queue.queue_steps(10, Priority::Normal, None).await;
        queue.queue_steps(20, Priority::Critical, None).await;
        queue.mark_all_synced().await;
        queue.mark_all_synced().await;
    }

    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::open(&path).unwrap());
    let queue = open_queue(kv);
    let stats = queue.stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.synced, 2);
    assert_eq!(stats.unsynced, 0);

    assert_eq!(queue.clear_synced().await, 2);
    assert_eq!(queue.stats().await.total, 0);
}
