//! Profile and settings persistence.
//!
//! `profiles.json` is an array of profile records. Secret fields travel
//! through the crypto store on the way in and out: saved encrypted whenever
//! the store is unlocked, decrypted transparently on load, and left
//! untouched (plaintext legacy or still-encrypted blob) otherwise.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config_paths;
use crate::crypto::{is_encrypted_blob, CryptoError, CryptoStore};
use crate::types::{Profile, Settings};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid state file: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("{0}")]
    Config(String),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
}

/// Serialize to a sibling temp file, then rename over the target so a
/// crash mid-write never tears the state file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serialized)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub struct ProfileStore {
    crypto: Arc<CryptoStore>,
}

impl ProfileStore {
    pub fn new(crypto: Arc<CryptoStore>) -> Self {
        Self { crypto }
    }

    pub fn load(&self) -> Result<Vec<Profile>, StoreError> {
        self.load_from(&config_paths::profiles_path()?)
    }

    pub fn load_from(&self, path: &Path) -> Result<Vec<Profile>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path)?;
        let mut profiles: Vec<Profile> = serde_json::from_str(&raw)?;
        for profile in &mut profiles {
            self.reveal_secrets(profile);
        }
        Ok(profiles)
    }

    pub fn save(&self, profiles: &[Profile]) -> Result<(), StoreError> {
        self.save_to(&config_paths::profiles_path()?, profiles)
    }

    pub fn save_to(&self, path: &Path, profiles: &[Profile]) -> Result<(), StoreError> {
        let mut records = profiles.to_vec();
        for profile in &mut records {
            self.protect_secrets(profile)?;
        }
        write_json_atomic(path, &records)
    }

    /// Insert or replace by id; assigns an id to new profiles.
    /// Last-writer-wins, like every store mutation.
    pub fn upsert(&self, path: &Path, mut profile: Profile) -> Result<Profile, StoreError> {
        if profile.id.is_empty() {
            profile.id = Uuid::new_v4().to_string();
        }
        let mut profiles = self.load_from(path)?;
        match profiles.iter_mut().find(|existing| existing.id == profile.id) {
            Some(existing) => *existing = profile.clone(),
            None => profiles.push(profile.clone()),
        }
        self.save_to(path, &profiles)?;
        Ok(profile)
    }

    pub fn delete(&self, path: &Path, id: &str) -> Result<(), StoreError> {
        let mut profiles = self.load_from(path)?;
        let before = profiles.len();
        profiles.retain(|profile| profile.id != id);
        if profiles.len() == before {
            return Err(StoreError::ProfileNotFound(id.to_string()));
        }
        self.save_to(path, &profiles)
    }

    /// Decrypt secret fields in place. A blob that fails its tag check (or
    /// a locked store) leaves the field as stored; the caller never sees
    /// garbage plaintext.
    fn reveal_secrets(&self, profile: &mut Profile) {
        for field in [
            &mut profile.password,
            &mut profile.passphrase,
            &mut profile.secret_access_key,
        ] {
            if let Some(value) = field.as_mut() {
                match self.crypto.decrypt(value) {
                    Ok(plain) => *value = plain,
                    Err(err) => {
                        warn!("leaving secret field encrypted: {err}");
                    }
                }
            }
        }
    }

    /// Encrypt secret fields in place when unlocked. Already-encrypted
    /// blobs (loaded while locked) are kept as-is rather than wrapped twice.
    fn protect_secrets(&self, profile: &mut Profile) -> Result<(), StoreError> {
        if !self.crypto.is_unlocked() {
            return Ok(());
        }
        for field in [
            &mut profile.password,
            &mut profile.passphrase,
            &mut profile.secret_access_key,
        ] {
            if let Some(value) = field.as_mut() {
                if !value.is_empty() && !is_encrypted_blob(value) {
                    *value = self.crypto.encrypt(value)?;
                }
            }
        }
        Ok(())
    }
}

pub fn load_settings() -> Result<Settings, StoreError> {
    load_settings_from(&config_paths::settings_path()?)
}

pub fn load_settings_from(path: &Path) -> Result<Settings, StoreError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_settings(settings: &Settings) -> Result<(), StoreError> {
    save_settings_to(&config_paths::settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<(), StoreError> {
    write_json_atomic(path, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthType, Protocol, Theme};
    use tempfile::tempdir;

    fn profile_with_password(password: &str) -> Profile {
        Profile {
            id: "p1".to_string(),
            name: "box".to_string(),
            protocol: Protocol::Sftp,
            host: Some("example.com".to_string()),
            port: Some(22),
            username: Some("deploy".to_string()),
            auth_type: Some(AuthType::Password),
            password: Some(password.to_string()),
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
    fn round_trip_encrypts_at_rest_when_unlocked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        let crypto = Arc::new(CryptoStore::new());
        crypto.set_blocking("master").unwrap();
        let store = ProfileStore::new(crypto);

        store
            .save_to(&path, &[profile_with_password("hunter2")])
            .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hunter2"));

        let loaded = store.load_from(&path).unwrap();
        assert_eq!(loaded[0].password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn locked_store_passes_plaintext_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        let store = ProfileStore::new(Arc::new(CryptoStore::new()));

        store
            .save_to(&path, &[profile_with_password("legacy-plain")])
            .unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("legacy-plain"));

        let loaded = store.load_from(&path).unwrap();
        assert_eq!(loaded[0].password.as_deref(), Some("legacy-plain"));
    }

    #[test]
    fn wrong_passphrase_keeps_field_encrypted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let crypto = Arc::new(CryptoStore::new());
        crypto.set_blocking("right").unwrap();
        ProfileStore::new(crypto)
            .save_to(&path, &[profile_with_password("hunter2")])
            .unwrap();

        let wrong = Arc::new(CryptoStore::new());
        wrong.set_blocking("wrong").unwrap();
        let loaded = ProfileStore::new(wrong).load_from(&path).unwrap();

        let field = loaded[0].password.as_deref().unwrap();
        assert_ne!(field, "hunter2");
        assert_eq!(field.split(':').count(), 3);
    }

    #[test]
    fn saving_while_locked_keeps_existing_blobs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let crypto = Arc::new(CryptoStore::new());
        crypto.set_blocking("master").unwrap();
        let unlocked = ProfileStore::new(crypto.clone());
        unlocked
            .save_to(&path, &[profile_with_password("hunter2")])
            .unwrap();

        // Load and re-save through a locked store; the blob must survive.
        let locked = ProfileStore::new(Arc::new(CryptoStore::new()));
        let profiles = locked.load_from(&path).unwrap();
        locked.save_to(&path, &profiles).unwrap();

        let loaded = unlocked.load_from(&path).unwrap();
        assert_eq!(loaded[0].password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn upsert_and_delete_by_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        let store = ProfileStore::new(Arc::new(CryptoStore::new()));

        let mut created = store
            .upsert(&path, {
                let mut p = profile_with_password("x");
                p.id = String::new();
                p
            })
            .unwrap();
        assert!(!created.id.is_empty());

        created.name = "renamed".to_string();
        store.upsert(&path, created.clone()).unwrap();
        let loaded = store.load_from(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "renamed");

        store.delete(&path, &created.id).unwrap();
        assert!(store.load_from(&path).unwrap().is_empty());
        assert!(matches!(
            store.delete(&path, &created.id),
            Err(StoreError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn settings_round_trip_and_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let defaults = load_settings_from(&path).unwrap();
        assert_eq!(defaults.theme, Theme::System);
        assert!(defaults.confirm_on_delete);

        let settings = Settings {
            theme: Theme::Dark,
            show_hidden: true,
            default_local_path: Some("/home/u/files".to_string()),
            confirm_on_delete: false,
        };
        save_settings_to(&path, &settings).unwrap();
        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.theme, Theme::Dark);
        assert!(loaded.show_hidden);
        assert!(!loaded.confirm_on_delete);
    }
}
