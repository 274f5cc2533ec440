//! Local directory watcher that mirrors changes upstream.
//!
//! One recursive filesystem observer per watch root. Events are coalesced:
//! a file must be quiet for a full second before it is considered settled,
//! so a burst of writes produces exactly one enqueued upload. Dotfiles are
//! ignored. Each root is independent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{recommended_watcher, EventKind, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::events::{EngineEvent, EngineEvents};
use crate::paths::join_remote_path;
use crate::queue::{TaskSpec, TransferQueue};
use crate::types::TransferDirection;

/// Quiescence window before a changed file is declared settled.
const SETTLE_WINDOW: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

struct WatchHandle {
    // Held for its Drop; dropping uninstalls the OS observer.
    _watcher: notify::RecommendedWatcher,
    stop: Arc<AtomicBool>,
}

pub struct DirectoryWatcher {
    queue: Arc<TransferQueue>,
    events: EngineEvents,
    watches: Mutex<HashMap<PathBuf, WatchHandle>>,
}

impl DirectoryWatcher {
    pub fn new(queue: Arc<TransferQueue>, events: EngineEvents) -> Self {
        Self {
            queue,
            events,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Install a recursive observer on `local_root`, mirroring creates and
    /// changes to `remote_root`. Watching an already-watched root restarts
    /// it. Must be called from within the runtime.
    pub fn start(&self, local_root: &Path, remote_root: &str) -> RemoteResult<()> {
        if !local_root.is_dir() {
            return Err(RemoteError::NotFound(
                local_root.to_string_lossy().into_owned(),
            ));
        }
        self.stop(local_root);

        let pending: Arc<Mutex<HashMap<PathBuf, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let root_for_events = local_root.to_path_buf();
        let pending_for_events = pending.clone();
        let stop_for_events = stop.clone();
        let mut watcher = recommended_watcher(
            move |event_result: Result<notify::Event, notify::Error>| match event_result {
                Ok(event) => {
                    if stop_for_events.load(Ordering::SeqCst) {
                        return;
                    }
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    let mut pending = match pending_for_events.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    for path in event.paths {
                        if is_hidden_within(&root_for_events, &path) {
                            continue;
                        }
                        pending.insert(path, Instant::now());
                    }
                }
                Err(err) => warn!("filesystem watcher error: {err}"),
            },
        )
        .map_err(|err| RemoteError::Internal(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(local_root, RecursiveMode::Recursive)
            .map_err(|err| {
                RemoteError::Internal(format!(
                    "failed to watch {}: {err}",
                    local_root.display()
                ))
            })?;

        self.spawn_driver(
            local_root.to_path_buf(),
            remote_root.to_string(),
            pending,
            stop.clone(),
        );

        self.watches
            .lock()
            .map_err(|_| RemoteError::Internal("watch map lock poisoned".to_string()))?
            .insert(
                local_root.to_path_buf(),
                WatchHandle {
                    _watcher: watcher,
                    stop,
                },
            );
        debug!(root = %local_root.display(), remote = %remote_root, "watch installed");
        Ok(())
    }

    /// Tear the observer for `local_root` down. Idempotent.
    pub fn stop(&self, local_root: &Path) {
        if let Ok(mut watches) = self.watches.lock() {
            if let Some(handle) = watches.remove(local_root) {
                handle.stop.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn active(&self, local_root: &Path) -> bool {
        self.watches
            .lock()
            .map(|watches| watches.contains_key(local_root))
            .unwrap_or(false)
    }

    pub fn stop_all(&self) {
        if let Ok(mut watches) = self.watches.lock() {
            for (_, handle) in watches.drain() {
                handle.stop.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Periodically drain settled files into upload tasks.
    fn spawn_driver(
        &self,
        local_root: PathBuf,
        remote_root: String,
        pending: Arc<Mutex<HashMap<PathBuf, Instant>>>,
        stop: Arc<AtomicBool>,
    ) {
        let queue = self.queue.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                let settled = {
                    let mut pending = match pending.lock() {
                        Ok(guard) => guard,
                        Err(_) => break,
                    };
                    take_settled(&mut pending, Instant::now(), SETTLE_WINDOW)
                };

                for path in settled {
                    let Ok(metadata) = std::fs::metadata(&path) else {
                        continue;
                    };
                    if !metadata.is_file() {
                        continue;
                    }
                    let Ok(relative) = path.strip_prefix(&local_root) else {
                        continue;
                    };
                    let remote_path = join_remote_path(&remote_root, &posix_relative(relative));

                    debug!(local = %path.display(), remote = %remote_path, "settled, enqueueing upload");
                    match queue.enqueue(TaskSpec {
                        direction: TransferDirection::Upload,
                        local_path: path.clone(),
                        remote_path: remote_path.clone(),
                        name: None,
                        total: metadata.len(),
                    }) {
                        Ok(_) => events.emit(EngineEvent::WatcherUpload {
                            root: local_root.to_string_lossy().into_owned(),
                            remote_path,
                        }),
                        Err(err) => {
                            warn!("could not enqueue upload for {}: {err}", path.display());
                        }
                    }
                }
            }
        });
    }
}

/// Remove and return every pending path whose last event is at least
/// `window` old.
fn take_settled(
    pending: &mut HashMap<PathBuf, Instant>,
    now: Instant,
    window: Duration,
) -> Vec<PathBuf> {
    let settled: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, last)| now.duration_since(**last) >= window)
        .map(|(path, _)| path.clone())
        .collect();
    for path in &settled {
        pending.remove(path);
    }
    settled
}

/// True when any component under `root` starts with a dot.
fn is_hidden_within(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| {
        component
            .as_os_str()
            .to_string_lossy()
            .starts_with('.')
    })
}

fn posix_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_events_settles_to_one_entry() {
        let mut pending = HashMap::new();
        let base = Instant::now();
        let file = PathBuf::from("/watch/report.csv");

        // N events inside the window keep refreshing the same entry.
        for offset_ms in [0u64, 100, 250, 400] {
            pending.insert(file.clone(), base + Duration::from_millis(offset_ms));
        }
        assert_eq!(pending.len(), 1);

        // Not yet quiet for a full second after the last write.
        let early = take_settled(
            &mut pending,
            base + Duration::from_millis(900),
            SETTLE_WINDOW,
        );
        assert!(early.is_empty());

        let settled = take_settled(
            &mut pending,
            base + Duration::from_millis(1450),
            SETTLE_WINDOW,
        );
        assert_eq!(settled, vec![file]);
        assert!(pending.is_empty());
    }

    #[test]
    fn settle_is_per_file() {
        let mut pending = HashMap::new();
        let base = Instant::now();
        pending.insert(PathBuf::from("/w/a.txt"), base);
        pending.insert(PathBuf::from("/w/b.txt"), base + Duration::from_millis(800));

        let settled = take_settled(&mut pending, base + Duration::from_millis(1100), SETTLE_WINDOW);
        assert_eq!(settled, vec![PathBuf::from("/w/a.txt")]);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn dotfiles_are_ignored() {
        let root = Path::new("/watch");
        assert!(is_hidden_within(root, Path::new("/watch/.DS_Store")));
        assert!(is_hidden_within(root, Path::new("/watch/.git/config")));
        assert!(is_hidden_within(root, Path::new("/watch/sub/.hidden")));
        assert!(!is_hidden_within(root, Path::new("/watch/sub/file.txt")));
    }

    #[test]
    fn relative_paths_join_with_posix_separators() {
        let rel = Path::new("sub").join("dir").join("f.txt");
        assert_eq!(
            join_remote_path("/backup", &posix_relative(&rel)),
            "/backup/sub/dir/f.txt"
        );
    }
}
