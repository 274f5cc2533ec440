//! End-to-end queue behaviour against the public API: scheduling, retry
//! exhaustion, cancellation events, and crash recovery on reload.

use std::sync::Arc;
use std::time::Duration;

use skiff::events::{EngineEvent, EngineEvents};
use skiff::queue::{TaskSpec, TransferQueue, RETRY_CAP};
use skiff::remote::RemoteDispatcher;
use skiff::types::{TaskStatus, TransferDirection};
use tempfile::tempdir;

fn download_spec(dir: &std::path::Path, remote: &str) -> TaskSpec {
    TaskSpec {
        direction: TransferDirection::Download,
        local_path: dir.join("out.bin"),
        remote_path: remote.to_string(),
        name: None,
        total: 0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_transfer_retries_then_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("transfers.json");
    let queue = TransferQueue::load_from(
        &path,
        Arc::new(RemoteDispatcher::new()),
        EngineEvents::new(),
    )
    .unwrap();

    let id = queue
        .enqueue(download_spec(dir.path(), "/remote/file.bin"))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let task = loop {
        let task = queue
            .snapshot()
            .into_iter()
            .find(|task| task.id == id)
            .unwrap();
        if task.status == TaskStatus::Failed {
            break task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task stuck in {:?}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    // One initial attempt plus RETRY_CAP requeues.
    assert_eq!(task.retry_count, RETRY_CAP + 1);
    assert!(task.error.as_deref().unwrap().contains("not connected"));

    // The terminal state survives a reload untouched.
    drop(queue);
    let reloaded = TransferQueue::load_from(
        &path,
        Arc::new(RemoteDispatcher::new()),
        EngineEvents::new(),
    )
    .unwrap();
    assert_eq!(reloaded.snapshot()[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn admitted_tasks_reload_as_interrupted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("transfers.json");
    {
        let queue = TransferQueue::load_from(
            &path,
            Arc::new(RemoteDispatcher::new()),
            EngineEvents::new(),
        )
        .unwrap();
        queue.add(download_spec(dir.path(), "/a.bin")).unwrap();
        queue.add(download_spec(dir.path(), "/b.bin")).unwrap();
        queue.flush();
    }

    let reloaded = TransferQueue::load_from(
        &path,
        Arc::new(RemoteDispatcher::new()),
        EngineEvents::new(),
    )
    .unwrap();
    let snapshot = reloaded.snapshot();
    assert_eq!(snapshot.len(), 2);
    for task in snapshot {
        assert_eq!(task.status, TaskStatus::Interrupted);
        assert_eq!(task.speed, 0);
    }
}

#[tokio::test]
async fn cancel_publishes_snapshot_and_terminal_event() {
    let dir = tempdir().unwrap();
    let events = EngineEvents::new();
    let queue = TransferQueue::load_from(
        &dir.path().join("transfers.json"),
        Arc::new(RemoteDispatcher::new()),
        events.clone(),
    )
    .unwrap();

    let mut rx = events.subscribe();
    let id = queue.add(download_spec(dir.path(), "/victim.bin")).unwrap();
    queue.cancel(&id);

    let mut saw_cancelled_snapshot = false;
    let mut saw_finished = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::QueueUpdated { tasks } => {
                if tasks.iter().any(|t| t.status == TaskStatus::Cancelled) {
                    saw_cancelled_snapshot = true;
                }
            }
            EngineEvent::TaskFinished { id: task_id, status, .. } => {
                assert_eq!(task_id, id);
                assert_eq!(status, TaskStatus::Cancelled);
                saw_finished = true;
            }
            _ => {}
        }
    }
    assert!(saw_cancelled_snapshot);
    assert!(saw_finished);
}
