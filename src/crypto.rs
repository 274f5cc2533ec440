//! Process-wide crypto store protecting secret profile fields.
//!
//! The key is derived from the master passphrase with PBKDF2-HMAC-SHA256
//! and encrypts with AES-256-GCM. Ciphertext blobs are
//! `hex(iv):hex(tag):hex(ciphertext)`; anything that does not match that
//! shape passes through `decrypt` unchanged so legacy plaintext profiles
//! keep loading.

use std::sync::{Mutex, MutexGuard};

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_BYTES: usize = 32;
const IV_BYTES: usize = 16;
const TAG_BYTES: usize = 16;

/// Fixed KDF salt. Compatibility contract for existing profile files; see
/// DESIGN.md for the per-install-salt discussion.
const STATIC_SALT: &[u8] = b"macscp-static-salt";

type VaultCipher = AesGcm<Aes256, U16>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("crypto store is locked")]
    Locked,
    #[error("ciphertext authentication failed")]
    AuthTagMismatch,
    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// Locked-or-unlocked keyholder. `set` unlocks, `clear` locks; keyed
/// operations fail with [`CryptoError::Locked`] while locked.
#[derive(Default)]
pub struct CryptoStore {
    key: Mutex<Option<[u8; KEY_BYTES]>>,
}

impl CryptoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the key from `passphrase` and unlock the store. Key
    /// derivation is CPU-heavy and runs on the blocking pool.
    pub async fn set(&self, passphrase: String) -> Result<(), CryptoError> {
        let key = tokio::task::spawn_blocking(move || derive_key(&passphrase))
            .await
            .map_err(|err| CryptoError::Cipher(err.to_string()))?;
        *self.lock_key()? = Some(key);
        Ok(())
    }

    /// Synchronous unlock for contexts without a runtime.
    pub fn set_blocking(&self, passphrase: &str) -> Result<(), CryptoError> {
        let key = derive_key(passphrase);
        *self.lock_key()? = Some(key);
        Ok(())
    }

    pub fn clear(&self) {
        if let Ok(mut key) = self.lock_key() {
            *key = None;
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_key().map(|key| key.is_some()).unwrap_or(false)
    }

    /// Encrypt `plaintext` into the three-part hex blob with a fresh
    /// random IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let key = self.current_key()?;
        let cipher = VaultCipher::new_from_slice(&key)
            .map_err(|err| CryptoError::Cipher(err.to_string()))?;

        let mut iv = [0u8; IV_BYTES];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::<U16>::from_slice(&iv);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| CryptoError::Cipher(err.to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_BYTES);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt a three-part blob and verify its tag. Input that is not a
    /// blob is returned unchanged.
    pub fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        let Some((iv, tag, ciphertext)) = parse_blob(blob) else {
            return Ok(blob.to_string());
        };

        let key = self.current_key()?;
        let cipher = VaultCipher::new_from_slice(&key)
            .map_err(|err| CryptoError::Cipher(err.to_string()))?;
        let nonce = Nonce::<U16>::from_slice(&iv);

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| CryptoError::AuthTagMismatch)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::AuthTagMismatch)
    }

    fn current_key(&self) -> Result<[u8; KEY_BYTES], CryptoError> {
        (*self.lock_key()?).ok_or(CryptoError::Locked)
    }

    fn lock_key(&self) -> Result<MutexGuard<'_, Option<[u8; KEY_BYTES]>>, CryptoError> {
        self.key
            .lock()
            .map_err(|_| CryptoError::Cipher("crypto store lock poisoned".to_string()))
    }
}

fn derive_key(passphrase: &str) -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), STATIC_SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

/// True when `value` is a well-formed `iv:tag:ciphertext` blob.
pub fn is_encrypted_blob(value: &str) -> bool {
    parse_blob(value).is_some()
}

/// Split `iv:tag:ciphertext` hex parts; `None` when the input is not a
/// well-formed blob.
fn parse_blob(blob: &str) -> Option<([u8; IV_BYTES], Vec<u8>, Vec<u8>)> {
    let mut parts = blob.split(':');
    let iv_hex = parts.next()?;
    let tag_hex = parts.next()?;
    let ct_hex = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let iv_bytes = hex::decode(iv_hex).ok()?;
    let iv: [u8; IV_BYTES] = iv_bytes.try_into().ok()?;
    let tag = hex::decode(tag_hex).ok()?;
    if tag.len() != TAG_BYTES {
        return None;
    }
    let ciphertext = hex::decode(ct_hex).ok()?;
    Some((iv, tag, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked() -> CryptoStore {
        let store = CryptoStore::new();
        store.set_blocking("correct horse battery staple").unwrap();
        store
    }

    #[test]
    fn round_trip() {
        let store = unlocked();
        let blob = store.encrypt("hunter2").unwrap();
        assert_eq!(blob.split(':').count(), 3);
        assert_eq!(store.decrypt(&blob).unwrap(), "hunter2");
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let store = unlocked();
        let a = store.encrypt("same input").unwrap();
        let b = store.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn non_blob_passes_through() {
        let store = unlocked();
        assert_eq!(store.decrypt("plain password").unwrap(), "plain password");
        assert_eq!(store.decrypt("a:b").unwrap(), "a:b");
        assert_eq!(store.decrypt("not:hex:stuff").unwrap(), "not:hex:stuff");
        assert_eq!(store.decrypt("").unwrap(), "");
    }

    #[test]
    fn locked_store_refuses_keyed_operations() {
        let store = CryptoStore::new();
        assert!(matches!(
            store.encrypt("x"),
            Err(CryptoError::Locked)
        ));
        // Passthrough never needs the key.
        assert_eq!(store.decrypt("plain").unwrap(), "plain");
    }

    #[test]
    fn wrong_passphrase_fails_tag_check() {
        let store = unlocked();
        let blob = store.encrypt("topsecret").unwrap();

        let other = CryptoStore::new();
        other.set_blocking("wrong passphrase").unwrap();
        assert!(matches!(
            other.decrypt(&blob),
            Err(CryptoError::AuthTagMismatch)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_tag_check() {
        let store = unlocked();
        let blob = store.encrypt("topsecret").unwrap();
        let mut parts: Vec<String> = blob.split(':').map(str::to_string).collect();
        let flipped = if parts[2].starts_with('0') { "1" } else { "0" };
        parts[2].replace_range(0..1, flipped);
        let tampered = parts.join(":");
        assert!(matches!(
            store.decrypt(&tampered),
            Err(CryptoError::AuthTagMismatch)
        ));
    }

    #[test]
    fn same_passphrase_same_key() {
        let a = unlocked();
        let b = unlocked();
        let blob = a.encrypt("shared").unwrap();
        assert_eq!(b.decrypt(&blob).unwrap(), "shared");
    }
}
