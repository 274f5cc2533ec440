//! SFTP backend over a single multiplexed SSH transport.
//!
//! Metadata operations (list, stat, small read/write) share one SFTP
//! channel; every bulk transfer opens its own channel and releases it on
//! completion so a long download never blocks a directory listing. The
//! same transport also carries `exec` and interactive shell channels.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use russh::client::{Handle, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::load_secret_key;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{CancelFlag, ProgressFn};
use crate::error::{RemoteError, RemoteResult};
use crate::types::{AuthType, DirectoryEntry, Profile, RemoteStat, MODE_DIRECTORY};

const TRANSFER_CHUNK: usize = 64 * 1024;

struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SftpBackend {
    handle: Handle<ClientHandler>,
    meta: SftpSession,
}

impl SftpBackend {
    pub async fn connect(profile: &Profile) -> RemoteResult<Self> {
        let host = profile.host.clone().unwrap_or_default();
        let port = profile.port_or_default();
        let username = profile.username.clone().unwrap_or_default();

        let config = Arc::new(russh::client::Config::default());
        let mut handle = russh::client::connect(config, (host.as_str(), port), ClientHandler)
            .await
            .map_err(|err| RemoteError::NetworkUnreachable(err.to_string()))?;

        authenticate(&mut handle, profile, &username).await?;
        info!(host = %host, port, "SSH session established");

        let meta = open_sftp_session(&handle).await?;
        Ok(Self { handle, meta })
    }

    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }

    pub async fn list(&self, path: &str) -> RemoteResult<Vec<DirectoryEntry>> {
        let read_dir = self
            .meta
            .read_dir(path)
            .await
            .map_err(|err| map_sftp_error(err, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            entries.push(DirectoryEntry {
                is_directory: metadata.is_dir(),
                size: if metadata.is_dir() {
                    0
                } else {
                    metadata.size.unwrap_or(0)
                },
                modified: metadata.mtime.map(i64::from).unwrap_or(0),
                name,
            });
        }
        debug!(path = %path, count = entries.len(), "listed directory");
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        let metadata = self
            .meta
            .metadata(path)
            .await
            .map_err(|err| map_sftp_error(err, path))?;
        let mut mode = metadata.permissions.unwrap_or(0);
        if metadata.is_dir() {
            mode |= MODE_DIRECTORY;
        }
        Ok(RemoteStat {
            size: metadata.size.unwrap_or(0),
            mtime: metadata.mtime.map(i64::from).unwrap_or(0),
            mode,
        })
    }

    /// Download one file on a dedicated channel. `offset > 0` starts the
    /// remote read there and appends to the local file.
    pub async fn get_file(
        &self,
        remote: &str,
        local: &Path,
        offset: u64,
        cancel: &CancelFlag,
        mut on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        let sftp = open_sftp_session(&self.handle).await?;
        let total = sftp
            .metadata(remote)
            .await
            .map_err(|err| map_sftp_error(err, remote))?
            .size
            .unwrap_or(0);

        let mut remote_file = sftp
            .open_with_flags(remote, OpenFlags::READ)
            .await
            .map_err(|err| map_sftp_error(err, remote))?;
        if offset > 0 {
            remote_file
                .seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(RemoteError::from)?;
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut local_file = if offset > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(local)
                .await?
        } else {
            tokio::fs::File::create(local).await?
        };

        let mut buffer = vec![0u8; TRANSFER_CHUNK];
        let mut transferred = offset;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(RemoteError::Cancelled);
            }
            let read = remote_file
                .read(&mut buffer)
                .await
                .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
            if read == 0 {
                break;
            }
            local_file.write_all(&buffer[..read]).await?;
            transferred += read as u64;
            on_progress(transferred, read as u64, total);
        }
        local_file.flush().await?;
        Ok(transferred)
    }

    /// Upload one file on a dedicated channel. `offset > 0` reads the local
    /// file from there and opens the remote side in append mode.
    pub async fn put_file(
        &self,
        local: &Path,
        remote: &str,
        offset: u64,
        cancel: &CancelFlag,
        mut on_progress: ProgressFn,
    ) -> RemoteResult<u64> {
        let sftp = open_sftp_session(&self.handle).await?;

        let mut local_file = tokio::fs::File::open(local).await?;
        let total = local_file.metadata().await?.len();
        if offset > 0 {
            local_file.seek(std::io::SeekFrom::Start(offset)).await?;
        }

        let mut remote_file = if offset > 0 {
            sftp.open_with_flags(remote, OpenFlags::WRITE | OpenFlags::APPEND)
                .await
                .map_err(|err| map_sftp_error(err, remote))?
        } else {
            sftp.create(remote)
                .await
                .map_err(|err| map_sftp_error(err, remote))?
        };

        let mut buffer = vec![0u8; TRANSFER_CHUNK];
        let mut transferred = offset;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(RemoteError::Cancelled);
            }
            let read = local_file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            remote_file
                .write_all(&buffer[..read])
                .await
                .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
            transferred += read as u64;
            on_progress(transferred, read as u64, total);
        }
        remote_file
            .flush()
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
        Ok(transferred)
    }

    pub async fn read_file(&self, remote: &str) -> RemoteResult<Vec<u8>> {
        self.meta
            .read(remote)
            .await
            .map_err(|err| map_sftp_error(err, remote))
    }

    pub async fn write_file(&self, remote: &str, contents: &[u8]) -> RemoteResult<()> {
        self.meta
            .write(remote, contents)
            .await
            .map_err(|err| map_sftp_error(err, remote))
    }

    pub async fn mkdir(&self, remote: &str) -> RemoteResult<()> {
        self.meta
            .create_dir(remote)
            .await
            .map_err(|err| map_sftp_error(err, remote))
    }

    pub async fn remove_file(&self, remote: &str) -> RemoteResult<()> {
        self.meta
            .remove_file(remote)
            .await
            .map_err(|err| map_sftp_error(err, remote))
    }

    pub async fn remove_dir(&self, remote: &str) -> RemoteResult<()> {
        self.meta
            .remove_dir(remote)
            .await
            .map_err(|err| map_sftp_error(err, remote))
    }

    pub async fn rename(&self, old: &str, new: &str) -> RemoteResult<()> {
        self.meta
            .rename(old, new)
            .await
            .map_err(|err| map_sftp_error(err, old))
    }

    /// Run a command on the transport and collect its output.
    pub async fn exec_command(&self, command: &str) -> RemoteResult<String> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;

        let mut channel = channel;
        let mut output = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => output.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(command, exit_status, "remote command finished");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Open an interactive shell with a PTY of the given size.
    pub async fn spawn_shell(&self, rows: u32, cols: u32) -> RemoteResult<ShellChannel> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await
            .map_err(|err| RemoteError::Protocol(err.to_string()))?;
        channel
            .request_shell(true)
            .await
            .map_err(|err| RemoteError::Protocol(err.to_string()))?;
        Ok(ShellChannel { channel })
    }
}

/// Streaming shell channel handed to terminal embedders.
pub struct ShellChannel {
    channel: russh::Channel<Msg>,
}

impl ShellChannel {
    /// Next chunk of terminal output; `None` once the channel closed.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(data.to_vec()),
                ChannelMsg::ExtendedData { data, .. } => return Some(data.to_vec()),
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    pub async fn write(&self, bytes: &[u8]) -> RemoteResult<()> {
        self.channel
            .data(bytes)
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))
    }

    pub async fn resize(&self, rows: u32, cols: u32) -> RemoteResult<()> {
        self.channel
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|err| RemoteError::NetworkDropped(err.to_string()))
    }
}

async fn open_sftp_session(handle: &Handle<ClientHandler>) -> RemoteResult<SftpSession> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|err| RemoteError::NetworkDropped(err.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|err| RemoteError::Protocol(format!("SFTP subsystem unavailable: {err}")))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|err| RemoteError::Protocol(err.to_string()))
}

/// Authenticate with the profile's configured mode: agent, private key
/// (optionally passphrase-protected), or password.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    profile: &Profile,
    username: &str,
) -> RemoteResult<()> {
    match profile.auth_type {
        Some(AuthType::Agent) => authenticate_agent(handle, username).await,
        Some(AuthType::Key) => {
            let key_path = expand_user_path(profile.private_key_path.as_deref().unwrap_or(""));
            let key = load_secret_key(&key_path, profile.passphrase.as_deref()).map_err(|err| {
                RemoteError::AuthFailed(format!(
                    "could not load key {}: {err}",
                    key_path.display()
                ))
            })?;
            let result = handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), None))
                .await
                .map_err(|err| RemoteError::AuthFailed(err.to_string()))?;
            if result.success() {
                Ok(())
            } else {
                Err(RemoteError::AuthFailed(
                    "server rejected the private key".to_string(),
                ))
            }
        }
        Some(AuthType::Password) => {
            let password = profile.password.clone().unwrap_or_default();
            let result = handle
                .authenticate_password(username, password)
                .await
                .map_err(|err| RemoteError::AuthFailed(err.to_string()))?;
            if result.success() {
                Ok(())
            } else {
                Err(RemoteError::AuthFailed(
                    "server rejected the password".to_string(),
                ))
            }
        }
        None => Err(RemoteError::AuthFailed(
            "no authentication mode configured".to_string(),
        )),
    }
}

async fn authenticate_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> RemoteResult<()> {
    let sock = std::env::var("SSH_AUTH_SOCK")
        .map_err(|_| RemoteError::AuthFailed("SSH agent unavailable".to_string()))?;
    let mut agent = AgentClient::connect_uds(&sock)
        .await
        .map_err(|err| RemoteError::AuthFailed(format!("SSH agent unavailable: {err}")))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|err| RemoteError::AuthFailed(format!("SSH agent failed: {err}")))?;

    for identity in identities {
        match handle
            .authenticate_publickey_with(username, identity, None, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(()),
            Ok(_) => {}
            Err(err) => warn!("agent identity rejected: {err}"),
        }
    }
    Err(RemoteError::AuthFailed(
        "no agent identity was accepted".to_string(),
    ))
}

fn expand_user_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

/// SFTP status → taxonomy. Status 3 is the server's permission-denied.
fn map_sftp_error(err: russh_sftp::client::error::Error, path: &str) -> RemoteError {
    let message = err.to_string();
    if message.contains("No such file") || message.contains("not found") {
        RemoteError::NotFound(path.to_string())
    } else if message.contains("Permission denied") {
        RemoteError::Permission(path.to_string())
    } else {
        RemoteError::Protocol(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_user_path_resolves_tilde() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_user_path("~/.ssh/id_ed25519"),
            PathBuf::from("/home/tester/.ssh/id_ed25519")
        );
        assert_eq!(expand_user_path("/abs/key"), PathBuf::from("/abs/key"));
    }
}
