//! External-edit bridge: download a remote file to a temp directory, hand
//! it to the OS default application, and re-upload on every saved change.
//!
//! Uploads are debounced behind a short quiescence window and guarded by a
//! re-entrancy flag so a burst of editor writes never overlaps uploads of
//! the same file. Temp directories from previous runs are swept at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{recommended_watcher, EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RemoteError, RemoteResult};
use crate::events::{EditOutcome, EngineEvent, EngineEvents};
use crate::paths::{normalize_remote_path, remote_basename};
use crate::remote::{RemoteDispatcher, DRAG_TEMP_PREFIX};

/// Temp directory prefix for edit sessions; swept at startup.
pub const EDIT_TEMP_PREFIX: &str = "skiff-edit-";

/// Quiescence before a saved change is re-uploaded.
const UPLOAD_DEBOUNCE: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct EditSession {
    _watcher: notify::RecommendedWatcher,
    stop: Arc<AtomicBool>,
}

pub struct EditBridge {
    dispatcher: Arc<RemoteDispatcher>,
    events: EngineEvents,
    sessions: Mutex<HashMap<String, EditSession>>,
}

impl EditBridge {
    pub fn new(dispatcher: Arc<RemoteDispatcher>, events: EngineEvents) -> Self {
        Self {
            dispatcher,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Download `remote_path` into a fresh temp directory, shell-open it,
    /// and watch it for changes. Returns the local path.
    pub async fn open(&self, remote_path: &str) -> RemoteResult<PathBuf> {
        let remote = normalize_remote_path(remote_path);
        self.close(&remote);

        let dir = std::env::temp_dir().join(format!("{EDIT_TEMP_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let name = remote_basename(&remote);
        let local = dir.join(if name.is_empty() { "file" } else { name });

        let cancel = Arc::new(AtomicBool::new(false));
        self.dispatcher.get(&remote, &local, &cancel).await?;
        info!(remote = %remote, local = %local.display(), "opened for external edit");

        if let Err(err) = open::that_detached(&local) {
            warn!("could not shell-open {}: {err}", local.display());
        }

        let pending: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let pending_for_events = pending.clone();
        let stop_for_events = stop.clone();
        let mut watcher = recommended_watcher(
            move |event_result: Result<notify::Event, notify::Error>| match event_result {
                Ok(event) => {
                    if stop_for_events.load(Ordering::SeqCst) {
                        return;
                    }
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        if let Ok(mut pending) = pending_for_events.lock() {
                            *pending = Some(Instant::now());
                        }
                    }
                }
                Err(err) => warn!("edit watcher error: {err}"),
            },
        )
        .map_err(|err| RemoteError::Internal(format!("failed to create watcher: {err}")))?;
        watcher
            .watch(&local, RecursiveMode::NonRecursive)
            .map_err(|err| RemoteError::Internal(format!("failed to watch edited file: {err}")))?;

        self.spawn_uploader(remote.clone(), local.clone(), pending, stop.clone());

        self.sessions
            .lock()
            .map_err(|_| RemoteError::Internal("edit session lock poisoned".to_string()))?
            .insert(
                remote,
                EditSession {
                    _watcher: watcher,
                    stop,
                },
            );
        Ok(local)
    }

    /// Stop watching a remote path. Idempotent; the temp file stays until
    /// the next startup sweep.
    pub fn close(&self, remote_path: &str) {
        let remote = normalize_remote_path(remote_path);
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some(session) = sessions.remove(&remote) {
                session.stop.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn active(&self, remote_path: &str) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.contains_key(&normalize_remote_path(remote_path)))
            .unwrap_or(false)
    }

    pub fn close_all(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            for (_, session) in sessions.drain() {
                session.stop.store(true, Ordering::SeqCst);
            }
        }
    }

    fn spawn_uploader(
        &self,
        remote: String,
        local: PathBuf,
        pending: Arc<Mutex<Option<Instant>>>,
        stop: Arc<AtomicBool>,
    ) {
        let dispatcher = self.dispatcher.clone();
        let events = self.events.clone();
        let uploading = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                let due = {
                    let pending = match pending.lock() {
                        Ok(guard) => guard,
                        Err(_) => break,
                    };
                    pending
                        .map(|last| last.elapsed() >= UPLOAD_DEBOUNCE)
                        .unwrap_or(false)
                };
                if !due {
                    continue;
                }
                // One upload in flight per file, ever.
                if uploading.swap(true, Ordering::SeqCst) {
                    continue;
                }
                if let Ok(mut pending) = pending.lock() {
                    *pending = None;
                }

                let cancel = Arc::new(AtomicBool::new(false));
                debug!(remote = %remote, "re-uploading edited file");
                match dispatcher.put(&local, &remote, &cancel).await {
                    Ok(_) => events.emit(EngineEvent::EditStatus {
                        remote_path: remote.clone(),
                        status: EditOutcome::Uploaded,
                        error: None,
                    }),
                    Err(err) => events.emit(EngineEvent::EditStatus {
                        remote_path: remote.clone(),
                        status: EditOutcome::Error,
                        error: Some(err.to_string()),
                    }),
                }
                uploading.store(false, Ordering::SeqCst);
            }
        });
    }
}

/// Remove leftover edit/drag temp directories from previous runs.
/// Best-effort: anything locked or vanished is skipped.
pub fn sweep_temp_dirs() -> usize {
    let temp_root = std::env::temp_dir();
    let Ok(entries) = std::fs::read_dir(&temp_root) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(EDIT_TEMP_PREFIX) && !name.starts_with(DRAG_TEMP_PREFIX) {
            continue;
        }
        if !entry.path().is_dir() {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => debug!("could not sweep {}: {err}", entry.path().display()),
        }
    }
    if removed > 0 {
        info!(removed, "swept stale temp directories");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_temp(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("leftover.bin"), b"stale").unwrap();
        path
    }

    #[test]
    fn sweep_removes_only_engine_prefixes() {
        let edit_dir = make_temp(&format!("{EDIT_TEMP_PREFIX}sweep-test-a"));
        let drag_dir = make_temp(&format!("{DRAG_TEMP_PREFIX}sweep-test-b"));
        let unrelated = make_temp("skiff-unrelated-sweep-test");

        let removed = sweep_temp_dirs();
        assert!(removed >= 2);
        assert!(!edit_dir.exists());
        assert!(!drag_dir.exists());
        assert!(unrelated.exists());

        std::fs::remove_dir_all(unrelated).unwrap();
    }
}
