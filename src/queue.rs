//! Persistent FIFO transfer queue.
//!
//! Single in-process scheduler: at most three tasks run at once, promoted
//! in enqueue order from the pending/interrupted set. Every status change
//! persists `transfers.json`; progress ticks persist at most every 500 ms.
//! On startup, anything that was active or pending when the process died
//! reloads as interrupted and is resumed with `offset = transferred`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use uuid::Uuid;

use crate::config_paths;
use crate::error::RemoteError;
use crate::events::{EngineEvent, EngineEvents};
use crate::paths::remote_basename;
use crate::remote::{CancelFlag, ProgressFn, RemoteDispatcher};
use crate::store::{write_json_atomic, StoreError};
use crate::types::{now_iso, TaskStatus, TransferDirection, TransferTask};

pub const MAX_CONCURRENT: usize = 3;
pub const RETRY_CAP: u32 = 3;
const PERSIST_INTERVAL: Duration = Duration::from_millis(500);

/// What a caller supplies to enqueue a transfer.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Display name; defaults to the transfer's basename.
    pub name: Option<String>,
    /// Bytes, when known at enqueue time.
    pub total: u64,
}

/// Speed window: when it opened and the byte count at that instant.
struct SpeedWindow {
    started: Instant,
    start_bytes: u64,
}

struct QueueState {
    tasks: HashMap<String, TransferTask>,
    /// Enqueue order; drives FIFO promotion and snapshot order.
    order: Vec<String>,
    running: HashSet<String>,
    cancel_flags: HashMap<String, CancelFlag>,
    speed_windows: HashMap<String, SpeedWindow>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            running: HashSet::new(),
            cancel_flags: HashMap::new(),
            speed_windows: HashMap::new(),
        }
    }

    /// First pending or interrupted task in enqueue order.
    fn next_ready(&self) -> Option<String> {
        self.order
            .iter()
            .find(|id| {
                !self.running.contains(*id)
                    && self
                        .tasks
                        .get(*id)
                        .map(|task| {
                            matches!(task.status, TaskStatus::Pending | TaskStatus::Interrupted)
                        })
                        .unwrap_or(false)
            })
            .cloned()
    }

    fn snapshot(&self) -> Vec<TransferTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }
}

pub struct TransferQueue {
    state: Mutex<QueueState>,
    dispatcher: Arc<RemoteDispatcher>,
    events: EngineEvents,
    state_path: PathBuf,
}

impl TransferQueue {
    /// Load the persisted queue from the default location and apply
    /// startup recovery.
    pub fn load(
        dispatcher: Arc<RemoteDispatcher>,
        events: EngineEvents,
    ) -> Result<Arc<Self>, StoreError> {
        let path = config_paths::transfers_path()?;
        Self::load_from(&path, dispatcher, events)
    }

    /// Load from an explicit path. Previously active or pending tasks are
    /// rewritten to interrupted with their transferred byte count intact;
    /// the scheduler resumes them from there.
    pub fn load_from(
        path: &Path,
        dispatcher: Arc<RemoteDispatcher>,
        events: EngineEvents,
    ) -> Result<Arc<Self>, StoreError> {
        let mut state = QueueState::new();

        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let tasks: Vec<TransferTask> = serde_json::from_str(&raw)?;
            for mut task in tasks {
                if matches!(task.status, TaskStatus::Active | TaskStatus::Pending) {
                    task.status = TaskStatus::Interrupted;
                    task.speed = 0;
                }
                state.order.push(task.id.clone());
                state.tasks.insert(task.id.clone(), task);
            }
        }

        let queue = Arc::new(Self {
            state: Mutex::new(state),
            dispatcher,
            events,
            state_path: path.to_path_buf(),
        });
        queue.persist_and_emit();
        Ok(queue)
    }

    /// Admission: assign an id, persist as pending, publish the snapshot.
    /// Does not start the scheduler; use [`TransferQueue::enqueue`] for
    /// add-and-run.
    pub fn add(&self, spec: TaskSpec) -> Result<String, RemoteError> {
        let id = Uuid::new_v4().to_string();
        let name = spec.name.unwrap_or_else(|| match spec.direction {
            TransferDirection::Upload => spec
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| spec.remote_path.clone()),
            TransferDirection::Download => remote_basename(&spec.remote_path).to_string(),
        });

        let task = TransferTask {
            id: id.clone(),
            direction: spec.direction,
            local_path: spec.local_path.to_string_lossy().into_owned(),
            remote_path: spec.remote_path,
            name,
            total: spec.total,
            transferred: 0,
            speed: 0,
            progress: 0,
            status: TaskStatus::Pending,
            retry_count: 0,
            error: None,
            created_at: now_iso(),
        };

        {
            let mut state = self.lock()?;
            state.order.push(id.clone());
            state.tasks.insert(id.clone(), task);
        }
        self.persist_and_emit();
        Ok(id)
    }

    pub fn enqueue(self: &Arc<Self>, spec: TaskSpec) -> Result<String, RemoteError> {
        let id = self.add(spec)?;
        self.kick();
        Ok(id)
    }

    /// Fill free slots from the ready set and spawn their transfers.
    pub fn kick(self: &Arc<Self>) {
        for (id, offset, cancel) in self.claim_ready() {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                let result = queue.execute(&id, offset, &cancel).await;
                match result {
                    Ok(bytes) => queue.finish(&id, TaskStatus::Completed, None, Some(bytes)),
                    Err(RemoteError::Cancelled) => {
                        queue.finish(&id, TaskStatus::Cancelled, None, None)
                    }
                    Err(err) => queue.fail_with_retry(&id, &err),
                }
                queue.kick();
            });
        }
    }

    /// Promote ready tasks up to the concurrency bound, registering one
    /// controller per promotion. Returns what to run.
    fn claim_ready(&self) -> Vec<(String, u64, CancelFlag)> {
        let mut started = Vec::new();
        {
            let Ok(mut state) = self.lock() else {
                return started;
            };
            while state.running.len() < MAX_CONCURRENT {
                let Some(id) = state.next_ready() else {
                    break;
                };

                let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
                state.running.insert(id.clone());
                state.cancel_flags.insert(id.clone(), cancel.clone());

                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                // Interrupted tasks resume where the client-side count
                // stopped; everything else restarts.
                let offset = if task.status == TaskStatus::Interrupted {
                    task.transferred
                } else {
                    0
                };
                if offset == 0 {
                    task.transferred = 0;
                    task.progress = 0;
                }
                task.status = TaskStatus::Active;
                task.speed = 0;

                started.push((id, offset, cancel));
            }
        }
        if !started.is_empty() {
            self.persist_and_emit();
        }
        started
    }

    async fn execute(
        self: &Arc<Self>,
        id: &str,
        offset: u64,
        cancel: &CancelFlag,
    ) -> Result<u64, RemoteError> {
        let (direction, local_path, remote_path) = {
            let state = self.lock()?;
            let task = state
                .tasks
                .get(id)
                .ok_or_else(|| RemoteError::Internal("task disappeared".to_string()))?;
            (
                task.direction,
                PathBuf::from(&task.local_path),
                task.remote_path.clone(),
            )
        };

        let progress_queue = Arc::clone(self);
        let progress_id = id.to_string();
        let on_progress: ProgressFn = Box::new(move |transferred, _chunk, total| {
            progress_queue.on_progress(&progress_id, transferred, total);
        });

        info!(id, ?direction, remote = %remote_path, offset, "transfer started");
        match direction {
            TransferDirection::Upload => {
                self.dispatcher
                    .put_with_progress(&local_path, &remote_path, offset, cancel, on_progress)
                    .await
            }
            TransferDirection::Download => {
                self.dispatcher
                    .get_with_progress(&remote_path, &local_path, offset, cancel, on_progress)
                    .await
            }
        }
    }

    /// Raw progress tick. Derived speed recomputes on ≥500 ms windows and
    /// each window boundary persists the queue. A backwards `transferred`
    /// is a backend's restart-from-zero signal; accounting resets once.
    fn on_progress(&self, id: &str, transferred: u64, total: u64) {
        let mut tick = false;
        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            let now = Instant::now();

            let Some(task) = state.tasks.get_mut(id) else {
                return;
            };
            if task.status != TaskStatus::Active {
                return;
            }

            let reset = transferred < task.transferred;
            task.transferred = transferred;
            if total > 0 {
                task.total = total;
            }
            task.progress = calculate_percentage(task.transferred, task.total);

            let window = state
                .speed_windows
                .entry(id.to_string())
                .or_insert(SpeedWindow {
                    started: now,
                    start_bytes: transferred,
                });
            if reset {
                window.started = now;
                window.start_bytes = transferred;
            }

            let elapsed = now.duration_since(window.started);
            if elapsed >= PERSIST_INTERVAL {
                let delta = transferred.saturating_sub(window.start_bytes);
                let speed = (delta as f64 / elapsed.as_secs_f64()) as u64;
                window.started = now;
                window.start_bytes = transferred;
                if let Some(task) = state.tasks.get_mut(id) {
                    task.speed = speed;
                }
                tick = true;
            }
        }
        if tick {
            self.persist_and_emit();
        }
    }

    /// Terminal (or cancelled-elsewhere) transition for a finished run.
    /// Applies only if the task is still active: a cancel that already won
    /// the race keeps its verdict.
    fn finish(&self, id: &str, status: TaskStatus, error: Option<String>, bytes: Option<u64>) {
        let mut finished: Option<TransferTask> = None;
        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            state.running.remove(id);
            state.cancel_flags.remove(id);
            state.speed_windows.remove(id);

            if let Some(task) = state.tasks.get_mut(id) {
                if task.status == TaskStatus::Active {
                    task.status = status;
                    task.speed = 0;
                    task.error = error;
                    if let Some(bytes) = bytes {
                        task.transferred = bytes;
                        if task.total == 0 {
                            task.total = bytes;
                        }
                    }
                    if status == TaskStatus::Completed {
                        task.transferred = task.total;
                        task.progress = 100;
                        task.retry_count = 0;
                    } else {
                        task.progress = calculate_percentage(task.transferred, task.total);
                    }
                    finished = Some(task.clone());
                }
            }
        }
        self.persist_and_emit();
        if let Some(task) = finished {
            info!(id, status = ?task.status, "transfer finished");
            self.events.emit(EngineEvent::TaskFinished {
                id: task.id,
                status: task.status,
                error: task.error,
            });
        }
    }

    /// Failure path: annotate and return to pending while retries remain,
    /// otherwise mark failed.
    fn fail_with_retry(&self, id: &str, err: &RemoteError) {
        let mut exhausted: Option<TransferTask> = None;
        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            state.running.remove(id);
            state.cancel_flags.remove(id);
            state.speed_windows.remove(id);

            if let Some(task) = state.tasks.get_mut(id) {
                if task.status == TaskStatus::Active {
                    task.retry_count += 1;
                    task.speed = 0;
                    if task.retry_count <= RETRY_CAP {
                        warn!(id, retry = task.retry_count, error = %err, "transfer failed, requeueing");
                        task.status = TaskStatus::Pending;
                        task.error = Some(format!("Retry {}/{}: {err}", task.retry_count, RETRY_CAP));
                    } else {
                        warn!(id, error = %err, "transfer failed, retries exhausted");
                        task.status = TaskStatus::Failed;
                        task.error = Some(err.to_string());
                        exhausted = Some(task.clone());
                    }
                }
            }
        }
        self.persist_and_emit();
        if let Some(task) = exhausted {
            self.events.emit(EngineEvent::TaskFinished {
                id: task.id,
                status: task.status,
                error: task.error,
            });
        }
    }

    /// Flip to cancelled immediately and fire the controller if one is
    /// registered; the running transfer observes the flag at its next I/O
    /// boundary.
    pub fn cancel(&self, id: &str) {
        let mut cancelled: Option<TransferTask> = None;
        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            if let Some(flag) = state.cancel_flags.remove(id) {
                flag.store(true, Ordering::SeqCst);
            }
            state.running.remove(id);
            state.speed_windows.remove(id);

            if let Some(task) = state.tasks.get_mut(id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Cancelled;
                    task.speed = 0;
                    task.error = None;
                    cancelled = Some(task.clone());
                }
            }
        }
        self.persist_and_emit();
        if let Some(task) = cancelled {
            self.events.emit(EngineEvent::TaskFinished {
                id: task.id,
                status: task.status,
                error: task.error,
            });
        }
    }

    /// Manual retry: failed, cancelled or interrupted goes back to pending
    /// with a clean slate, then the scheduler is kicked.
    pub fn retry(self: &Arc<Self>, id: &str) {
        if self.revive(id) {
            self.persist_and_emit();
        }
        self.kick();
    }

    pub fn retry_all(self: &Arc<Self>) {
        let ids: Vec<String> = self
            .lock()
            .map(|state| state.order.clone())
            .unwrap_or_default();
        let mut revived = false;
        for id in &ids {
            revived |= self.revive(id);
        }
        if revived {
            self.persist_and_emit();
        }
        self.kick();
    }

    fn revive(&self, id: &str) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        let Some(task) = state.tasks.get_mut(id) else {
            return false;
        };
        if !matches!(
            task.status,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Interrupted
        ) {
            return false;
        }
        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.error = None;
        task.speed = 0;
        true
    }

    /// Remove a single non-active task from the list.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let Ok(mut state) = self.lock() else {
                return false;
            };
            if state.running.contains(id) {
                false
            } else if state.tasks.remove(id).is_some() {
                state.order.retain(|existing| existing != id);
                state.cancel_flags.remove(id);
                true
            } else {
                false
            }
        };
        if removed {
            self.persist_and_emit();
        }
        removed
    }

    /// Drop every terminal task.
    pub fn clear_finished(&self) {
        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            let keep: HashSet<String> = state
                .tasks
                .iter()
                .filter(|(_, task)| !task.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            state.order.retain(|id| keep.contains(id));
            state.tasks.retain(|id, _| keep.contains(id));
        }
        self.persist_and_emit();
    }

    pub fn snapshot(&self) -> Vec<TransferTask> {
        self.lock()
            .map(|state| state.snapshot())
            .unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.lock().map(|state| state.running.len()).unwrap_or(0)
    }

    /// Persist on shutdown so the next start recovers the exact state.
    pub fn flush(&self) {
        self.persist_and_emit();
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Internal("queue state lock poisoned".to_string()))
    }

    fn persist_and_emit(&self) {
        let Ok(state) = self.lock() else {
            return;
        };
        let snapshot = state.snapshot();
        drop(state);
        if let Err(err) = write_json_atomic(&self.state_path, &snapshot) {
            warn!("failed to persist transfer queue: {err}");
        }
        self.events.emit(EngineEvent::QueueUpdated { tasks: snapshot });
    }
}

fn calculate_percentage(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        0
    } else {
        (((transferred as f64) / (total as f64)) * 100.0)
            .round()
            .min(100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_queue(dir: &std::path::Path) -> Arc<TransferQueue> {
        TransferQueue::load_from(
            &dir.join("transfers.json"),
            Arc::new(RemoteDispatcher::new()),
            EngineEvents::new(),
        )
        .unwrap()
    }

    fn spec(remote: &str) -> TaskSpec {
        TaskSpec {
            direction: TransferDirection::Download,
            local_path: PathBuf::from("/tmp/out"),
            remote_path: remote.to_string(),
            name: None,
            total: 1000,
        }
    }

    #[test]
    fn admission_is_pending_and_persisted() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/a.bin")).unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].status, TaskStatus::Pending);

        let raw = std::fs::read_to_string(dir.path().join("transfers.json")).unwrap();
        let persisted: Vec<TransferTask> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn claim_respects_fifo_and_concurrency_cap() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let ids: Vec<String> = (0..10)
            .map(|i| queue.add(spec(&format!("/f{i}.bin"))).unwrap())
            .collect();

        let claimed = queue.claim_ready();
        assert_eq!(claimed.len(), MAX_CONCURRENT);
        let claimed_ids: Vec<&String> = claimed.iter().map(|(id, _, _)| id).collect();
        assert_eq!(claimed_ids, vec![&ids[0], &ids[1], &ids[2]]);

        // All slots taken; nothing further is promoted, nothing twice.
        assert!(queue.claim_ready().is_empty());
        assert_eq!(queue.active_count(), MAX_CONCURRENT);

        let snapshot = queue.snapshot();
        assert_eq!(
            snapshot
                .iter()
                .filter(|t| t.status == TaskStatus::Active)
                .count(),
            MAX_CONCURRENT
        );
        assert_eq!(
            snapshot
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .count(),
            7
        );
    }

    #[test]
    fn interrupted_tasks_resume_with_their_offset() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/big.bin")).unwrap();
        {
            let mut state = queue.lock().unwrap();
            let task = state.tasks.get_mut(&id).unwrap();
            task.status = TaskStatus::Interrupted;
            task.transferred = 30 * 1024 * 1024;
        }

        let claimed = queue.claim_ready();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].1, 30 * 1024 * 1024);
    }

    #[test]
    fn fresh_promotion_resets_accounting() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/f.bin")).unwrap();
        {
            let mut state = queue.lock().unwrap();
            let task = state.tasks.get_mut(&id).unwrap();
            task.transferred = 400;
            task.progress = 40;
        }

        let claimed = queue.claim_ready();
        assert_eq!(claimed[0].1, 0);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].transferred, 0);
        assert_eq!(snapshot[0].progress, 0);
    }

    #[test]
    fn retry_annotation_then_exhaustion() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/flaky.bin")).unwrap();

        for attempt in 1..=RETRY_CAP {
            queue.claim_ready();
            queue.fail_with_retry(&id, &RemoteError::NetworkDropped("reset".to_string()));
            let task = &queue.snapshot()[0];
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.retry_count, attempt);
            let annotation = task.error.as_deref().unwrap();
            assert!(annotation.starts_with(&format!("Retry {attempt}/{RETRY_CAP}:")));
        }

        queue.claim_ready();
        queue.fail_with_retry(&id, &RemoteError::NetworkDropped("reset".to_string()));
        let task = &queue.snapshot()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.speed, 0);
    }

    #[test]
    fn cancel_pending_needs_no_controller() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/x.bin")).unwrap();

        queue.cancel(&id);
        let task = &queue.snapshot()[0];
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(queue.lock().unwrap().cancel_flags.is_empty());
    }

    #[test]
    fn cancel_active_fires_the_token_and_wins_the_race() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/y.bin")).unwrap();

        let claimed = queue.claim_ready();
        let token = claimed[0].2.clone();
        queue.cancel(&id);
        assert!(token.load(Ordering::SeqCst));
        assert_eq!(queue.snapshot()[0].status, TaskStatus::Cancelled);

        // The transfer task returns afterwards; its verdict must not
        // overwrite the cancellation.
        queue.finish(&id, TaskStatus::Completed, None, Some(1000));
        assert_eq!(queue.snapshot()[0].status, TaskStatus::Cancelled);
    }

    #[test]
    fn completion_pins_progress_and_resets_retries() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/z.bin")).unwrap();
        queue.claim_ready();
        {
            let mut state = queue.lock().unwrap();
            state.tasks.get_mut(&id).unwrap().retry_count = 2;
        }

        queue.finish(&id, TaskStatus::Completed, None, Some(1000));
        let task = &queue.snapshot()[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.transferred, task.total);
        assert_eq!(task.retry_count, 0);
        assert!(queue.lock().unwrap().running.is_empty());
    }

    #[test]
    fn progress_tolerates_a_restart_from_zero() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/s3-up.bin")).unwrap();
        queue.claim_ready();

        queue.on_progress(&id, 600, 1000);
        assert_eq!(queue.snapshot()[0].transferred, 600);

        // Backend announced a restart by reporting from zero again.
        queue.on_progress(&id, 100, 1000);
        let task = &queue.snapshot()[0];
        assert_eq!(task.transferred, 100);
        assert_eq!(task.progress, 10);
    }

    #[test]
    fn startup_recovery_rewrites_live_statuses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transfers.json");
        {
            let queue = test_queue(dir.path());
            let active = queue.add(spec("/was-active.bin")).unwrap();
            let pending = queue.add(spec("/was-pending.bin")).unwrap();
            let done = queue.add(spec("/was-done.bin")).unwrap();
            queue.claim_ready();
            {
                let mut state = queue.lock().unwrap();
                state.tasks.get_mut(&active).unwrap().transferred = 750;
                state.tasks.get_mut(&pending).unwrap().status = TaskStatus::Pending;
                let done_task = state.tasks.get_mut(&done).unwrap();
                done_task.status = TaskStatus::Completed;
                done_task.progress = 100;
            }
            queue.flush();
        }

        let reloaded = TransferQueue::load_from(
            &path,
            Arc::new(RemoteDispatcher::new()),
            EngineEvents::new(),
        )
        .unwrap();
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot[0].status, TaskStatus::Interrupted);
        assert_eq!(snapshot[0].transferred, 750);
        assert_eq!(snapshot[0].speed, 0);
        assert_eq!(snapshot[1].status, TaskStatus::Interrupted);
        assert_eq!(snapshot[2].status, TaskStatus::Completed);
    }

    #[test]
    fn manual_retry_flips_back_to_pending() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/failed.bin")).unwrap();
        {
            let mut state = queue.lock().unwrap();
            let task = state.tasks.get_mut(&id).unwrap();
            task.status = TaskStatus::Failed;
            task.retry_count = RETRY_CAP + 1;
            task.error = Some("connection dropped: gone".to_string());
        }

        assert!(queue.revive(&id));
        let task = &queue.snapshot()[0];
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.error.is_none());

        // Active and completed tasks are not revivable.
        assert!(!queue.revive(&id));
    }

    #[test]
    fn clear_finished_keeps_live_tasks() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let keep = queue.add(spec("/live.bin")).unwrap();
        let drop_id = queue.add(spec("/done.bin")).unwrap();
        {
            let mut state = queue.lock().unwrap();
            state.tasks.get_mut(&drop_id).unwrap().status = TaskStatus::Completed;
        }

        queue.clear_finished();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, keep);
    }

    #[test]
    fn remove_refuses_active_tasks() {
        let dir = tempdir().unwrap();
        let queue = test_queue(dir.path());
        let id = queue.add(spec("/busy.bin")).unwrap();
        queue.claim_ready();
        assert!(!queue.remove(&id));
        queue.finish(&id, TaskStatus::Completed, None, Some(1));
        assert!(queue.remove(&id));
        assert!(queue.snapshot().is_empty());
    }

    #[test]
    fn percentage_is_clamped() {
        assert_eq!(calculate_percentage(0, 0), 0);
        assert_eq!(calculate_percentage(500, 1000), 50);
        assert_eq!(calculate_percentage(2000, 1000), 100);
    }
}
