//! Remote dispatcher: one uniform operation surface routed to the active
//! backend. The dispatcher owns at most one connection; callers that need
//! parallel bulk I/O get fresh channels/clients from the backend itself.

pub mod ftp;
pub mod s3;
pub mod sftp;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RemoteError, RemoteResult};
use crate::paths::{join_remote_path, normalize_remote_path, remote_basename, remote_parent};
use crate::types::{DirectoryEntry, Profile, Protocol, RemoteStat};

pub use sftp::ShellChannel;

/// Cooperative cancellation signal observed at I/O boundaries.
pub type CancelFlag = Arc<AtomicBool>;

/// Progress callback: `(total_transferred, chunk, total_size)`. A backend
/// that cannot honour a resume offset restarts the first argument from
/// zero; the queue tolerates that one-time reset.
pub type ProgressFn = Box<dyn FnMut(u64, u64, u64) + Send>;

pub(crate) fn noop_progress() -> ProgressFn {
    Box::new(|_, _, _| {})
}

/// Temp directory prefix for drag-out downloads; swept at startup.
pub const DRAG_TEMP_PREFIX: &str = "skiff-drag-";

/// The closed set of protocol backends.
pub enum Backend {
    Sftp(sftp::SftpBackend),
    Ftp(ftp::FtpBackend),
    S3(s3::S3Backend),
}

impl Backend {
    async fn list(&self, path: &str) -> RemoteResult<Vec<DirectoryEntry>> {
        match self {
            Backend::Sftp(b) => b.list(path).await,
            Backend::Ftp(b) => b.list(path).await,
            Backend::S3(b) => b.list(path).await,
        }
    }

    async fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        match self {
            Backend::Sftp(b) => b.stat(path).await,
            Backend::Ftp(b) => b.stat(path).await,
            Backend::S3(b) => b.stat(path).await,
        }
    }

    async fn get_file(
        &self,
        remote: &str,
        local: &Path,
        offset: u64,
        cancel: &CancelFlag,
        on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        match self {
            Backend::Sftp(b) => b.get_file(remote, local, offset, cancel, on_progress).await,
            Backend::Ftp(b) => b.get_file(remote, local, offset, cancel, on_progress).await,
            Backend::S3(b) => b.get_file(remote, local, offset, cancel, on_progress).await,
        }
    }

    async fn put_file(
        &self,
        local: &Path,
        remote: &str,
        offset: u64,
        cancel: &CancelFlag,
        on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        match self {
            Backend::Sftp(b) => b.put_file(local, remote, offset, cancel, on_progress).await,
            Backend::Ftp(b) => b.put_file(local, remote, offset, cancel, on_progress).await,
            Backend::S3(b) => b.put_file(local, remote, offset, cancel, on_progress).await,
        }
    }

    async fn read_file(&self, remote: &str) -> RemoteResult<Vec<u8>> {
        match self {
            Backend::Sftp(b) => b.read_file(remote).await,
            Backend::Ftp(b) => b.read_file(remote).await,
            Backend::S3(b) => b.read_file(remote).await,
        }
    }

    async fn write_file(&self, remote: &str, contents: &[u8]) -> RemoteResult<()> {
        match self {
            Backend::Sftp(b) => b.write_file(remote, contents).await,
            Backend::Ftp(b) => b.write_file(remote, contents).await,
            Backend::S3(b) => b.write_file(remote, contents).await,
        }
    }

    async fn mkdir(&self, remote: &str) -> RemoteResult<()> {
        match self {
            Backend::Sftp(b) => b.mkdir(remote).await,
            Backend::Ftp(b) => b.mkdir(remote).await,
            Backend::S3(b) => b.mkdir(remote).await,
        }
    }

    async fn remove_file(&self, remote: &str) -> RemoteResult<()> {
        match self {
            Backend::Sftp(b) => b.remove_file(remote).await,
            Backend::Ftp(b) => b.remove_file(remote).await,
            Backend::S3(b) => b.remove_file(remote).await,
        }
    }

    async fn remove_dir(&self, remote: &str) -> RemoteResult<()> {
        match self {
            Backend::Sftp(b) => b.remove_dir(remote).await,
            Backend::Ftp(b) => b.remove_dir(remote).await,
            Backend::S3(b) => b.remove_dir(remote).await,
        }
    }

    async fn rename(&self, old: &str, new: &str) -> RemoteResult<()> {
        match self {
            Backend::Sftp(b) => b.rename(old, new).await,
            Backend::Ftp(b) => b.rename(old, new).await,
            Backend::S3(_) => Err(RemoteError::Unsupported),
        }
    }

    async fn close(&self) {
        match self {
            Backend::Sftp(b) => b.close().await,
            Backend::Ftp(b) => b.close().await,
            Backend::S3(_) => {}
        }
    }
}

/// Routes uniform operations to the single active backend.
pub struct RemoteDispatcher {
    active: RwLock<Option<Arc<Backend>>>,
}

impl RemoteDispatcher {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
        }
    }

    /// Establish the active connection; any prior connection is closed
    /// first.
    pub async fn connect(&self, profile: &Profile) -> RemoteResult<()> {
        profile.validate().map_err(RemoteError::Internal)?;
        self.disconnect().await;

        info!(name = %profile.name, protocol = ?profile.protocol, "connecting");
        let backend = match profile.protocol {
            Protocol::Sftp => Backend::Sftp(sftp::SftpBackend::connect(profile).await?),
            Protocol::Ftp | Protocol::Ftps => Backend::Ftp(ftp::FtpBackend::connect(profile).await?),
            Protocol::S3 => Backend::S3(s3::S3Backend::connect(profile).await?),
        };

        *self.active.write().await = Some(Arc::new(backend));
        Ok(())
    }

    /// Idempotent teardown.
    pub async fn disconnect(&self) {
        if let Some(backend) = self.active.write().await.take() {
            backend.close().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.active.read().await.is_some()
    }

    async fn backend(&self) -> RemoteResult<Arc<Backend>> {
        self.active
            .read()
            .await
            .clone()
            .ok_or(RemoteError::NotConnected)
    }

    pub async fn list(&self, remote_path: &str) -> RemoteResult<Vec<DirectoryEntry>> {
        let backend = self.backend().await?;
        backend.list(&normalize_remote_path(remote_path)).await
    }

    pub async fn stat(&self, remote_path: &str) -> RemoteResult<RemoteStat> {
        let backend = self.backend().await?;
        backend.stat(&normalize_remote_path(remote_path)).await
    }

    /// Whole-object download; recurses into directories.
    pub async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        cancel: &CancelFlag,
    ) -> RemoteResult<u64> {
        let backend = self.backend().await?;
        let remote = normalize_remote_path(remote_path);
        get_recursive(&backend, &remote, local_path, cancel).await
    }

    /// Whole-object upload; recurses into directories.
    pub async fn put(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancel: &CancelFlag,
    ) -> RemoteResult<u64> {
        let backend = self.backend().await?;
        let remote = normalize_remote_path(remote_path);

        let metadata = tokio::fs::metadata(local_path).await?;
        if !metadata.is_dir() {
            return backend
                .put_file(local_path, &remote, 0, cancel, noop_progress())
                .await;
        }

        // Enumerate the local tree up front, then replay it remotely in
        // walk order: directories first so file uploads never race their
        // parents.
        let root = local_path.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || {
            let mut dirs: Vec<PathBuf> = Vec::new();
            let mut files: Vec<PathBuf> = Vec::new();
            for entry in walkdir::WalkDir::new(&root).into_iter().flatten() {
                let rel = match entry.path().strip_prefix(&root) {
                    Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                    _ => continue,
                };
                if entry.file_type().is_dir() {
                    dirs.push(rel);
                } else if entry.file_type().is_file() {
                    files.push(rel);
                }
            }
            (dirs, files)
        })
        .await
        .map_err(|err| RemoteError::Internal(err.to_string()))?;
        let (dirs, files) = entries;

        let _ = backend.mkdir(&remote).await;
        for dir in &dirs {
            if cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(RemoteError::Cancelled);
            }
            let _ = backend.mkdir(&join_remote_path(&remote, &posix_relative(dir))).await;
        }

        let mut transferred = 0u64;
        for file in &files {
            if cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(RemoteError::Cancelled);
            }
            let target = join_remote_path(&remote, &posix_relative(file));
            transferred += backend
                .put_file(&local_path.join(file), &target, 0, cancel, noop_progress())
                .await?;
        }
        Ok(transferred)
    }

    /// File download with a progress callback and a resume offset. A
    /// nonzero offset appends to the local file and starts the remote read
    /// at that byte.
    pub async fn get_with_progress(
        &self,
        remote_path: &str,
        local_path: &Path,
        offset: u64,
        cancel: &CancelFlag,
        on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        let backend = self.backend().await?;
        let remote = normalize_remote_path(remote_path);
        backend
            .get_file(&remote, local_path, offset, cancel, on_progress)
            .await
    }

    /// File upload with a progress callback and a resume offset. Backends
    /// that cannot append (S3) ignore the offset and restart from zero,
    /// reporting progress from zero.
    pub async fn put_with_progress(
        &self,
        local_path: &Path,
        remote_path: &str,
        offset: u64,
        cancel: &CancelFlag,
        on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        let backend = self.backend().await?;
        let remote = normalize_remote_path(remote_path);
        self.ensure_parent_dirs(&backend, &remote).await;
        backend
            .put_file(local_path, &remote, offset, cancel, on_progress)
            .await
    }

    /// Small whole-file text read for editors.
    pub async fn read_file(&self, remote_path: &str) -> RemoteResult<String> {
        let backend = self.backend().await?;
        let bytes = backend.read_file(&normalize_remote_path(remote_path)).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn write_file(&self, remote_path: &str, contents: &str) -> RemoteResult<()> {
        let backend = self.backend().await?;
        backend
            .write_file(&normalize_remote_path(remote_path), contents.as_bytes())
            .await
    }

    /// Binary whole-file read, base64-encoded for IPC. Refused above
    /// `max_bytes`.
    pub async fn read_buffer(&self, remote_path: &str, max_bytes: u64) -> RemoteResult<String> {
        let backend = self.backend().await?;
        let remote = normalize_remote_path(remote_path);
        let stat = backend.stat(&remote).await?;
        if stat.size > max_bytes {
            return Err(RemoteError::Internal(format!(
                "file is {} bytes, larger than the {} byte cap",
                stat.size, max_bytes
            )));
        }
        let bytes = backend.read_file(&remote).await?;
        Ok(BASE64.encode(bytes))
    }

    /// Synchronous remote command execution; shell family only.
    pub async fn exec_command(&self, command: &str) -> RemoteResult<String> {
        let backend = self.backend().await?;
        match backend.as_ref() {
            Backend::Sftp(b) => b.exec_command(command).await,
            _ => Err(RemoteError::Unsupported),
        }
    }

    /// Interactive shell channel; shell family only.
    pub async fn spawn_shell(&self, rows: u32, cols: u32) -> RemoteResult<ShellChannel> {
        let backend = self.backend().await?;
        match backend.as_ref() {
            Backend::Sftp(b) => b.spawn_shell(rows, cols).await,
            _ => Err(RemoteError::Unsupported),
        }
    }

    /// Download into a fresh per-invocation temp directory and return the
    /// local path, for drag-out.
    pub async fn start_drag(&self, remote_path: &str, cancel: &CancelFlag) -> RemoteResult<PathBuf> {
        let remote = normalize_remote_path(remote_path);
        let dir = std::env::temp_dir().join(format!("{DRAG_TEMP_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let name = remote_basename(&remote);
        let local = dir.join(if name.is_empty() { "download" } else { name });
        self.get(&remote, &local, cancel).await?;
        Ok(local)
    }

    pub async fn mkdir(&self, remote_path: &str) -> RemoteResult<()> {
        let backend = self.backend().await?;
        backend.mkdir(&normalize_remote_path(remote_path)).await
    }

    /// Delete a file, or a whole tree when `recursive`.
    pub async fn remove(&self, remote_path: &str, recursive: bool) -> RemoteResult<()> {
        let backend = self.backend().await?;
        let remote = normalize_remote_path(remote_path);
        let stat = backend.stat(&remote).await?;
        if !stat.is_directory() {
            return backend.remove_file(&remote).await;
        }
        if !recursive {
            return backend.remove_dir(&remote).await;
        }
        remove_recursive(&backend, &remote).await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> RemoteResult<()> {
        let backend = self.backend().await?;
        backend
            .rename(
                &normalize_remote_path(old_path),
                &normalize_remote_path(new_path),
            )
            .await
    }

    /// Best-effort creation of every ancestor directory of `remote`, for
    /// uploads into not-yet-mirrored subtrees. "Already exists" is fine.
    async fn ensure_parent_dirs(&self, backend: &Backend, remote: &str) {
        if matches!(backend, Backend::S3(_)) {
            return;
        }
        let parent = remote_parent(remote);
        if parent == "/" {
            return;
        }
        let mut path = String::new();
        for segment in parent.trim_start_matches('/').split('/') {
            path = format!("{path}/{segment}");
            let _ = backend.mkdir(&path).await;
        }
    }
}

impl Default for RemoteDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn get_recursive<'a>(
    backend: &'a Backend,
    remote: &'a str,
    local: &'a Path,
    cancel: &'a CancelFlag,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = RemoteResult<u64>> + Send + 'a>> {
    Box::pin(async move {
        if cancel.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RemoteError::Cancelled);
        }
        let stat = backend.stat(remote).await?;
        if !stat.is_directory() {
            return backend
                .get_file(remote, local, 0, cancel, noop_progress())
                .await;
        }

        tokio::fs::create_dir_all(local).await?;
        let mut transferred = 0u64;
        for entry in backend.list(remote).await? {
            let child_remote = join_remote_path(remote, &entry.name);
            let child_local = local.join(&entry.name);
            transferred += get_recursive(backend, &child_remote, &child_local, cancel).await?;
        }
        Ok(transferred)
    })
}

fn remove_recursive<'a>(
    backend: &'a Backend,
    remote: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = RemoteResult<()>> + Send + 'a>> {
    Box::pin(async move {
        for entry in backend.list(remote).await? {
            let child = join_remote_path(remote, &entry.name);
            if entry.is_directory {
                remove_recursive(backend, &child).await?;
            } else {
                backend.remove_file(&child).await?;
            }
        }
        debug!(path = %remote, "removing directory");
        backend.remove_dir(remote).await
    })
}

/// Relative local path rendered with POSIX separators for the remote side.
fn posix_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
