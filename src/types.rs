//! Shared record types. Everything that crosses the engine boundary is
//! camelCase JSON, matching the persisted state files.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Sftp,
    Ftp,
    Ftps,
    S3,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp => 22,
            Protocol::Ftp | Protocol::Ftps => 21,
            Protocol::S3 => 443,
        }
    }

    pub fn is_shell_family(self) -> bool {
        matches!(self, Protocol::Sftp | Protocol::Ftp | Protocol::Ftps)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Password,
    Key,
    Agent,
}

/// A saved connection. Secret fields (`password`, `passphrase`,
/// `secretAccessKey`) are stored encrypted when the crypto store is
/// unlocked at save time; readers accept plaintext legacy values too.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_path: Option<String>,
}

impl Profile {
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Structural invariants from the data model: a usable port, a complete
    /// authentication mode for shell-family protocols, a bucket for cloud.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(port) = self.port {
            if port == 0 {
                return Err("Port must be between 1 and 65535".to_string());
            }
        }

        match self.protocol {
            Protocol::Sftp | Protocol::Ftp | Protocol::Ftps => {
                if self.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                    return Err("Host is required".to_string());
                }
                if self
                    .username
                    .as_deref()
                    .map_or(true, |u| u.trim().is_empty())
                {
                    return Err("Username is required".to_string());
                }
                match self.auth_type {
                    None => return Err("Authentication mode is required".to_string()),
                    Some(AuthType::Password) => {
                        if self.password.as_deref().map_or(true, str::is_empty) {
                            return Err("Password is required".to_string());
                        }
                    }
                    Some(AuthType::Key) => {
                        if self
                            .private_key_path
                            .as_deref()
                            .map_or(true, |p| p.trim().is_empty())
                        {
                            return Err("Private key path is required".to_string());
                        }
                    }
                    Some(AuthType::Agent) => {}
                }
            }
            Protocol::S3 => {
                if self.bucket.as_deref().map_or(true, |b| b.trim().is_empty()) {
                    return Err("Bucket is required".to_string());
                }
                if self
                    .access_key_id
                    .as_deref()
                    .map_or(true, |k| k.trim().is_empty())
                    || self
                        .secret_access_key
                        .as_deref()
                        .map_or(true, str::is_empty)
                {
                    return Err("Access key id and secret access key are required".to_string());
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Dark,
    Light,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub show_hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_local_path: Option<String>,
    #[serde(default = "default_true")]
    pub confirm_on_delete: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            show_hidden: false,
            default_local_path: None,
            confirm_on_delete: true,
        }
    }
}

/// One row of a remote directory listing. Order is whatever the backend
/// returned; callers sort.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    /// Bytes; 0 for directories.
    pub size: u64,
    /// Seconds since epoch, UTC; 0 when the backend cannot report one.
    pub modified: i64,
}

/// Directory bit in `mode`, same as the SFTP wire value.
pub const MODE_DIRECTORY: u32 = 0o040000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStat {
    pub size: u64,
    /// Seconds since epoch.
    pub mtime: i64,
    pub mode: u32,
}

impl RemoteStat {
    pub fn is_directory(&self) -> bool {
        self.mode & MODE_DIRECTORY != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A queued transfer. Persisted to `transfers.json` after every meaningful
/// state change and on each progress tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub name: String,
    /// Bytes; 0 when unknown at enqueue time.
    pub total: u64,
    pub transferred: u64,
    /// Bytes per second, averaged over at least 500 ms windows.
    pub speed: u64,
    /// Derived percentage, 0-100.
    pub progress: u8,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    OnlyLocal,
    OnlyRemote,
    NewerLocal,
    NewerRemote,
    Same,
}

/// One entry of a directory comparison.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiff {
    pub name: String,
    pub local_path: String,
    pub remote_path: String,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_mtime: Option<i64>,
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sftp_profile() -> Profile {
        Profile {
            id: "p1".to_string(),
            name: "dev box".to_string(),
            protocol: Protocol::Sftp,
            host: Some("example.com".to_string()),
            port: Some(22),
            username: Some("deploy".to_string()),
            auth_type: Some(AuthType::Password),
            password: Some("secret".to_string()),
            private_key_path: None,
            passphrase: None,
            access_key_id: None,
            secret_access_key: None,
            region: None,
            bucket: None,
            endpoint: None,
            folder: None,
            favorite: false,
            initial_path: None,
        }
    }

    #[test]
    fn shell_profile_requires_auth_mode() {
        let mut profile = sftp_profile();
        profile.auth_type = None;
        assert!(profile.validate().is_err());
        assert!(sftp_profile().validate().is_ok());
    }

    #[test]
    fn port_zero_is_rejected() {
        let mut profile = sftp_profile();
        profile.port = Some(0);
        assert!(profile.validate().is_err());
    }

    #[test]
    fn s3_profile_requires_bucket() {
        let profile = Profile {
            protocol: Protocol::S3,
            bucket: None,
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("shh".to_string()),
            auth_type: None,
            host: None,
            username: None,
            password: None,
            ..sftp_profile()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn default_ports_follow_protocol() {
        let mut profile = sftp_profile();
        profile.port = None;
        assert_eq!(profile.port_or_default(), 22);
        profile.protocol = Protocol::Ftps;
        assert_eq!(profile.port_or_default(), 21);
    }

    #[test]
    fn directory_mode_bit() {
        let stat = RemoteStat {
            size: 0,
            mtime: 0,
            mode: MODE_DIRECTORY | 0o755,
        };
        assert!(stat.is_directory());
        let file = RemoteStat {
            size: 10,
            mtime: 0,
            mode: 0o100644,
        };
        assert!(!file.is_directory());
    }

    #[test]
    fn task_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }
}
