//! Directory comparison engine.
//!
//! Compares the first-level children of a local and a remote directory and
//! classifies each name. Directories are skipped on both sides; recursion
//! is a future extension.

use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::paths::join_remote_path;
use crate::remote::RemoteDispatcher;
use crate::types::{SyncDiff, SyncStatus};

/// Timestamps within this many seconds count as equal.
const MTIME_TOLERANCE_SECS: i64 = 1;

#[derive(Clone, Copy, Debug)]
pub struct SyncSide {
    pub size: u64,
    pub mtime: i64,
}

/// Classify one name given what each side knows about it. Ties on time
/// with differing sizes lean local, so a same-second local edit still
/// syncs upward.
pub fn classify(local: Option<SyncSide>, remote: Option<SyncSide>) -> SyncStatus {
    match (local, remote) {
        (Some(_), None) => SyncStatus::OnlyLocal,
        (None, Some(_)) => SyncStatus::OnlyRemote,
        (None, None) => SyncStatus::Same,
        (Some(local), Some(remote)) => {
            let delta = local.mtime - remote.mtime;
            if delta.abs() <= MTIME_TOLERANCE_SECS {
                if local.size != remote.size {
                    SyncStatus::NewerLocal
                } else {
                    SyncStatus::Same
                }
            } else if delta > 0 {
                SyncStatus::NewerLocal
            } else {
                SyncStatus::NewerRemote
            }
        }
    }
}

/// Produce the per-entry diff between `local_dir` and `remote_dir`.
/// Local entries are walked first, then remaining remote-only names.
pub async fn compare_directories(
    dispatcher: &RemoteDispatcher,
    local_dir: &Path,
    remote_dir: &str,
) -> RemoteResult<Vec<SyncDiff>> {
    let remote_entries = dispatcher.list(remote_dir).await?;

    let mut local_files: Vec<(String, SyncSide)> = Vec::new();
    let mut read_dir = tokio::fs::read_dir(local_dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        local_files.push((
            name,
            SyncSide {
                size: metadata.len(),
                mtime,
            },
        ));
    }

    let diffs = merge_diff(local_dir, remote_dir, &local_files, &remote_entries);
    debug!(
        local = %local_dir.display(),
        remote = %remote_dir,
        entries = diffs.len(),
        "directory comparison finished"
    );
    Ok(diffs)
}

/// Pair local files with their remote twins by name and classify each.
/// Remote directories never appear in the output.
fn merge_diff(
    local_dir: &Path,
    remote_dir: &str,
    local_files: &[(String, SyncSide)],
    remote_entries: &[crate::types::DirectoryEntry],
) -> Vec<SyncDiff> {
    let mut diffs = Vec::new();
    let mut matched_remote: Vec<&str> = Vec::new();

    for (name, local_side) in local_files {
        let remote_twin = remote_entries
            .iter()
            .find(|entry| !entry.is_directory && entry.name == *name)
            .map(|entry| SyncSide {
                size: entry.size,
                mtime: entry.modified,
            });
        if remote_twin.is_some() {
            matched_remote.push(name);
        }

        diffs.push(SyncDiff {
            name: name.clone(),
            local_path: local_dir.join(name).to_string_lossy().into_owned(),
            remote_path: join_remote_path(remote_dir, name),
            status: classify(Some(*local_side), remote_twin),
            local_size: Some(local_side.size),
            remote_size: remote_twin.map(|side| side.size),
            local_mtime: Some(local_side.mtime),
            remote_mtime: remote_twin.map(|side| side.mtime),
        });
    }

    for entry in remote_entries {
        if entry.is_directory || matched_remote.contains(&entry.name.as_str()) {
            continue;
        }
        diffs.push(SyncDiff {
            name: entry.name.clone(),
            local_path: local_dir.join(&entry.name).to_string_lossy().into_owned(),
            remote_path: join_remote_path(remote_dir, &entry.name),
            status: SyncStatus::OnlyRemote,
            local_size: None,
            remote_size: Some(entry.size),
            local_mtime: None,
            remote_mtime: Some(entry.modified),
        });
    }

    diffs
}

/// Convenience error for callers that require both sides to exist.
pub async fn ensure_comparable(
    dispatcher: &RemoteDispatcher,
    local_dir: &Path,
    remote_dir: &str,
) -> RemoteResult<()> {
    if !local_dir.is_dir() {
        return Err(RemoteError::NotFound(
            local_dir.to_string_lossy().into_owned(),
        ));
    }
    let stat = dispatcher.stat(remote_dir).await?;
    if !stat.is_directory() {
        return Err(RemoteError::Internal(format!(
            "{remote_dir} is not a directory"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(size: u64, mtime: i64) -> Option<SyncSide> {
        Some(SyncSide { size, mtime })
    }

    #[test]
    fn equal_within_tolerance_is_same() {
        assert_eq!(classify(side(100, 1000), side(100, 1000)), SyncStatus::Same);
        assert_eq!(classify(side(100, 1000), side(100, 1001)), SyncStatus::Same);
        assert_eq!(classify(side(100, 1001), side(100, 1000)), SyncStatus::Same);
    }

    #[test]
    fn tied_time_with_different_sizes_leans_local() {
        assert_eq!(
            classify(side(100, 1000), side(200, 1000)),
            SyncStatus::NewerLocal
        );
        assert_eq!(
            classify(side(200, 1001), side(100, 1000)),
            SyncStatus::NewerLocal
        );
    }

    #[test]
    fn clock_skew_beyond_tolerance_decides() {
        assert_eq!(
            classify(side(100, 1010), side(100, 1000)),
            SyncStatus::NewerLocal
        );
        assert_eq!(
            classify(side(100, 1000), side(100, 1002)),
            SyncStatus::NewerRemote
        );
    }

    #[test]
    fn one_sided_entries() {
        assert_eq!(classify(side(1, 1), None), SyncStatus::OnlyLocal);
        assert_eq!(classify(None, side(1, 1)), SyncStatus::OnlyRemote);
    }

    #[test]
    fn merge_classifies_and_skips_directories() {
        use crate::types::DirectoryEntry;

        let t = 1_700_000_000i64;
        let local_files = vec![
            (
                "a.txt".to_string(),
                SyncSide {
                    size: 100,
                    mtime: t,
                },
            ),
            (
                "c.txt".to_string(),
                SyncSide {
                    size: 10,
                    mtime: t,
                },
            ),
        ];
        let remote_entries = vec![
            DirectoryEntry {
                name: "a.txt".to_string(),
                is_directory: false,
                size: 100,
                modified: t + 2,
            },
            DirectoryEntry {
                name: "b.txt".to_string(),
                is_directory: false,
                size: 5,
                modified: t,
            },
            DirectoryEntry {
                name: "sub".to_string(),
                is_directory: true,
                size: 0,
                modified: t,
            },
        ];

        let diffs = merge_diff(Path::new("/local"), "/remote", &local_files, &remote_entries);

        let by_name = |name: &str| diffs.iter().find(|d| d.name == name).unwrap();
        assert_eq!(by_name("a.txt").status, SyncStatus::NewerRemote);
        assert_eq!(by_name("c.txt").status, SyncStatus::OnlyLocal);
        assert_eq!(by_name("b.txt").status, SyncStatus::OnlyRemote);
        assert!(diffs.iter().all(|d| d.name != "sub"));
        assert_eq!(diffs.len(), 3);
        assert_eq!(by_name("b.txt").remote_path, "/remote/b.txt");
    }
}
