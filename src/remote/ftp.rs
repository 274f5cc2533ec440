//! FTP and FTPS backend.
//!
//! The protocol multiplexes poorly, so one shared control client serves
//! metadata while every bulk transfer opens a fresh client (fresh control
//! and data connections) and closes it when done. The library is blocking;
//! all calls run on the blocking pool.
//!
//! FTPS certificate verification is disabled to tolerate the self-signed
//! certificates common on small servers; this is the single seam a future
//! strict-TLS option would flip.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::debug;

use super::{CancelFlag, ProgressFn};
use crate::error::{RemoteError, RemoteResult};
use crate::paths::{remote_basename, remote_parent};
use crate::types::{DirectoryEntry, Profile, Protocol, RemoteStat, MODE_DIRECTORY};

const TRANSFER_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct FtpParams {
    host: String,
    port: u16,
    secure: bool,
    username: String,
    password: String,
}

pub struct FtpBackend {
    params: FtpParams,
    control: Arc<Mutex<Option<NativeTlsFtpStream>>>,
}

impl FtpBackend {
    pub async fn connect(profile: &Profile) -> RemoteResult<Self> {
        let params = FtpParams {
            host: profile.host.clone().unwrap_or_default(),
            port: profile.port_or_default(),
            secure: profile.protocol == Protocol::Ftps,
            username: profile.username.clone().unwrap_or_default(),
            password: profile.password.clone().unwrap_or_default(),
        };

        let connect_params = params.clone();
        let client = tokio::task::spawn_blocking(move || open_client(&connect_params))
            .await
            .map_err(|err| RemoteError::Internal(err.to_string()))??;

        Ok(Self {
            params,
            control: Arc::new(Mutex::new(Some(client))),
        })
    }

    pub async fn close(&self) {
        let control = self.control.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = control.lock() {
                if let Some(mut client) = guard.take() {
                    let _ = client.quit();
                }
            }
        })
        .await;
    }

    pub async fn list(&self, path: &str) -> RemoteResult<Vec<DirectoryEntry>> {
        self.with_control(path.to_string(), |ftp, path| {
            list_directory(ftp, path)
        })
        .await
    }

    /// The protocol has no stat; synthesise one by scanning the parent
    /// listing for the basename. Modification time therefore has listing
    /// granularity.
    pub async fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        self.with_control(path.to_string(), |ftp, path| {
            if path == "/" || path.is_empty() {
                return Ok(RemoteStat {
                    size: 0,
                    mtime: 0,
                    mode: MODE_DIRECTORY,
                });
            }
            let parent = remote_parent(path);
            let name = remote_basename(path);
            let entries = list_directory(ftp, &parent)?;
            let entry = entries
                .into_iter()
                .find(|entry| entry.name == name)
                .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
            Ok(RemoteStat {
                size: entry.size,
                mtime: entry.modified,
                mode: if entry.is_directory {
                    MODE_DIRECTORY
                } else {
                    0o100644
                },
            })
        })
        .await
    }

    /// Download on a fresh client. `offset > 0` issues `REST` before the
    /// retrieve and appends locally.
    pub async fn get_file(
        &self,
        remote: &str,
        local: &Path,
        offset: u64,
        cancel: &CancelFlag,
        mut on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        let params = self.params.clone();
        let remote = remote.to_string();
        let local = local.to_path_buf();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || -> RemoteResult<u64> {
            let mut ftp = open_client(&params)?;
            let total = ftp.size(&remote).map(|size| size as u64).unwrap_or(0);

            if offset > 0 {
                ftp.resume_transfer(offset as usize)
                    .map_err(|err| map_ftp_error(err, &remote))?;
            }
            let mut stream = ftp
                .retr_as_stream(&remote)
                .map_err(|err| map_ftp_error(err, &remote))?;

            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = if offset > 0 {
                std::fs::OpenOptions::new().append(true).open(&local)?
            } else {
                std::fs::File::create(&local)?
            };

            let mut buffer = vec![0u8; TRANSFER_CHUNK];
            let mut transferred = offset;
            loop {
                if cancel.load(Ordering::SeqCst) {
                    drop(stream);
                    let _ = ftp.quit();
                    return Err(RemoteError::Cancelled);
                }
                let read = stream
                    .read(&mut buffer)
                    .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
                if read == 0 {
                    break;
                }
                file.write_all(&buffer[..read])?;
                transferred += read as u64;
                on_progress(transferred, read as u64, total.max(transferred));
            }
            ftp.finalize_retr_stream(stream)
                .map_err(|err| map_ftp_error(err, &remote))?;
            let _ = ftp.quit();
            Ok(transferred)
        })
        .await
        .map_err(|err| RemoteError::Internal(err.to_string()))?
    }

    /// Upload on a fresh client. `offset > 0` switches to append semantics;
    /// otherwise a plain store.
    pub async fn put_file(
        &self,
        local: &Path,
        remote: &str,
        offset: u64,
        cancel: &CancelFlag,
        mut on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        let params = self.params.clone();
        let remote = remote.to_string();
        let local = local.to_path_buf();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || -> RemoteResult<u64> {
            let mut ftp = open_client(&params)?;

            let mut file = std::fs::File::open(&local)?;
            let total = file.metadata()?.len();
            if offset > 0 {
                file.seek(SeekFrom::Start(offset))?;
            }

            let mut stream = if offset > 0 {
                ftp.append_with_stream(&remote)
            } else {
                ftp.put_with_stream(&remote)
            }
            .map_err(|err| map_ftp_error(err, &remote))?;

            let mut buffer = vec![0u8; TRANSFER_CHUNK];
            let mut transferred = offset;
            loop {
                if cancel.load(Ordering::SeqCst) {
                    drop(stream);
                    let _ = ftp.quit();
                    return Err(RemoteError::Cancelled);
                }
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                stream
                    .write_all(&buffer[..read])
                    .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
                transferred += read as u64;
                on_progress(transferred, read as u64, total);
            }
            ftp.finalize_put_stream(stream)
                .map_err(|err| map_ftp_error(err, &remote))?;
            let _ = ftp.quit();
            Ok(transferred)
        })
        .await
        .map_err(|err| RemoteError::Internal(err.to_string()))?
    }

    pub async fn read_file(&self, remote: &str) -> RemoteResult<Vec<u8>> {
        self.with_control(remote.to_string(), |ftp, remote| {
            ftp.retr_as_buffer(remote)
                .map(Cursor::into_inner)
                .map_err(|err| map_ftp_error(err, remote))
        })
        .await
    }

    pub async fn write_file(&self, remote: &str, contents: &[u8]) -> RemoteResult<()> {
        let contents = contents.to_vec();
        self.with_control(remote.to_string(), move |ftp, remote| {
            ftp.put_file(remote, &mut Cursor::new(contents))
                .map(|_| ())
                .map_err(|err| map_ftp_error(err, remote))
        })
        .await
    }

    pub async fn mkdir(&self, remote: &str) -> RemoteResult<()> {
        self.with_control(remote.to_string(), |ftp, remote| {
            ftp.mkdir(remote).map_err(|err| map_ftp_error(err, remote))
        })
        .await
    }

    pub async fn remove_file(&self, remote: &str) -> RemoteResult<()> {
        self.with_control(remote.to_string(), |ftp, remote| {
            ftp.rm(remote).map_err(|err| map_ftp_error(err, remote))
        })
        .await
    }

    pub async fn remove_dir(&self, remote: &str) -> RemoteResult<()> {
        self.with_control(remote.to_string(), |ftp, remote| {
            ftp.rmdir(remote).map_err(|err| map_ftp_error(err, remote))
        })
        .await
    }

    pub async fn rename(&self, old: &str, new: &str) -> RemoteResult<()> {
        let new = new.to_string();
        self.with_control(old.to_string(), move |ftp, old| {
            ftp.rename(old, &new).map_err(|err| map_ftp_error(err, old))
        })
        .await
    }

    /// Run `op` against the shared control client on the blocking pool.
    async fn with_control<T, F>(&self, path: String, op: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream, &str) -> RemoteResult<T> + Send + 'static,
    {
        let control = self.control.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = control
                .lock()
                .map_err(|_| RemoteError::Internal("FTP control lock poisoned".to_string()))?;
            let ftp = guard.as_mut().ok_or(RemoteError::NotConnected)?;
            op(ftp, &path)
        })
        .await
        .map_err(|err| RemoteError::Internal(err.to_string()))?
    }
}

fn open_client(params: &FtpParams) -> RemoteResult<NativeTlsFtpStream> {
    let mut ftp = NativeTlsFtpStream::connect((params.host.as_str(), params.port))
        .map_err(map_connect_error)?;

    if params.secure {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| RemoteError::TlsFailure(err.to_string()))?;
        ftp = ftp
            .into_secure(NativeTlsConnector::from(connector), &params.host)
            .map_err(|err| RemoteError::TlsFailure(err.to_string()))?;
    }

    ftp.login(&params.username, &params.password)
        .map_err(|err| match err {
            FtpError::UnexpectedResponse(response) => {
                RemoteError::AuthFailed(String::from_utf8_lossy(&response.body).into_owned())
            }
            other => map_connect_error(other),
        })?;
    ftp.transfer_type(FileType::Binary)
        .map_err(|err| map_ftp_error(err, ""))?;

    debug!(host = %params.host, port = params.port, secure = params.secure, "FTP client ready");
    Ok(ftp)
}

fn list_directory(
    ftp: &mut NativeTlsFtpStream,
    path: &str,
) -> RemoteResult<Vec<DirectoryEntry>> {
    let lines = ftp
        .list(Some(path))
        .map_err(|err| map_ftp_error(err, path))?;

    let mut entries = Vec::new();
    for line in lines {
        let Ok(file) = suppaftp::list::File::try_from(line.as_str()) else {
            continue;
        };
        let name = file.name().to_string();
        if name == "." || name == ".." {
            continue;
        }
        entries.push(DirectoryEntry {
            is_directory: file.is_directory(),
            size: if file.is_directory() {
                0
            } else {
                file.size() as u64
            },
            modified: system_time_epoch(file.modified()),
            name,
        });
    }
    Ok(entries)
}

fn system_time_epoch(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn map_connect_error(err: FtpError) -> RemoteError {
    match err {
        FtpError::ConnectionError(io) => RemoteError::NetworkUnreachable(io.to_string()),
        FtpError::SecureError(detail) => RemoteError::TlsFailure(detail),
        other => RemoteError::Protocol(other.to_string()),
    }
}

fn map_ftp_error(err: FtpError, path: &str) -> RemoteError {
    match err {
        FtpError::ConnectionError(io) => RemoteError::from(io),
        FtpError::SecureError(detail) => RemoteError::TlsFailure(detail),
        FtpError::UnexpectedResponse(response) => match response.status {
            Status::FileUnavailable => RemoteError::NotFound(path.to_string()),
            Status::NotLoggedIn => {
                RemoteError::AuthFailed(String::from_utf8_lossy(&response.body).into_owned())
            }
            status => RemoteError::Protocol(format!(
                "{status:?}: {}",
                String::from_utf8_lossy(&response.body)
            )),
        },
        other => RemoteError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_listing_lines_parse() {
        let line = "-rw-r--r--   1 user group     4096 Jan 12 10:30 notes.txt";
        let file = suppaftp::list::File::try_from(line).unwrap();
        assert_eq!(file.name(), "notes.txt");
        assert!(!file.is_directory());
        assert_eq!(file.size(), 4096);
    }

    #[test]
    fn directory_lines_parse() {
        let line = "drwxr-xr-x   2 user group     4096 Jan 12 10:30 photos";
        let file = suppaftp::list::File::try_from(line).unwrap();
        assert!(file.is_directory());
    }
}
