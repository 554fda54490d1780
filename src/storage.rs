//! Signer state persistence
//!
//! This module provides:
//! - A storage port (`KeyValueStore`) injected into signers so the core
//!   never knows whether it runs against a browser-style store, the
//!   filesystem or test memory
//! - PBKDF2 key derivation and AES-GCM encryption for persisted records
//!
//! Records are small JSON blobs (mnemonic or account xpubs plus counters)
//! encrypted under the wallet password.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use log::debug;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, WalletError};

/// Storage port: the host environment supplies the concrete adapter.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory adapter for tests and ephemeral wallets.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| WalletError::Storage("store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| WalletError::Storage("store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Filesystem adapter: one file per key under a data directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store under the platform data directory.
    pub fn new() -> Result<Self> {
        let dir = dirs::data_dir()
            .ok_or_else(|| WalletError::Storage("no platform data directory".to_string()))?
            .join("attesta");
        Self::with_dir(dir)
    }

    /// Store under an explicit directory, created if missing.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| WalletError::Storage(err.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // keys are short identifiers like "bcrt_seedsigner"
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WalletError::Storage(err.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::write(self.path_for(key), value).map_err(|err| WalletError::Storage(err.to_string()))
    }
}

/// Encrypted record as persisted through the storage port.
#[derive(Serialize, Deserialize, Debug)]
pub struct EncryptedRecord {
    /// Salt for PBKDF2 key derivation
    pub salt: Vec<u8>,
    /// Nonce for AES-GCM encryption
    pub nonce: Vec<u8>,
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
    /// Number of PBKDF2 iterations
    pub iterations: u32,
}

/// Password-based record encryption (PBKDF2-SHA256 + AES-256-GCM).
pub struct RecordCipher {
    iterations: u32,
}

impl Default for RecordCipher {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

impl RecordCipher {
    pub fn new() -> Self {
        Self::default()
    }

    fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
        key
    }

    /// Encrypt a plaintext record under the wallet password.
    pub fn encrypt(&self, plaintext: &[u8], password: &str) -> Result<EncryptedRecord> {
        let mut salt = vec![0u8; 32];
        let mut nonce_bytes = vec![0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key_bytes = Self::derive_key(password, &salt, self.iterations);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|err| WalletError::Storage(format!("encryption failed: {}", err)))?;

        Ok(EncryptedRecord {
            salt,
            nonce: nonce_bytes,
            ciphertext,
            iterations: self.iterations,
        })
    }

    /// Decrypt a record. Returns `None` on a wrong password or corrupt
    /// ciphertext so callers can fall back to provisioning a fresh account.
    pub fn decrypt(&self, record: &EncryptedRecord, password: &str) -> Option<Vec<u8>> {
        let key_bytes = Self::derive_key(password, &record.salt, record.iterations);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&record.nonce);
        match cipher.decrypt(nonce, record.ciphertext.as_ref()) {
            Ok(plaintext) => Some(plaintext),
            Err(_) => {
                debug!("record decryption failed");
                None
            }
        }
    }
}

/// Encrypt and store a serializable record under `key`.
pub fn store_encrypted<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    record: &T,
    password: &str,
) -> Result<()> {
    let plaintext =
        serde_json::to_vec(record).map_err(|err| WalletError::Storage(err.to_string()))?;
    let encrypted = RecordCipher::new().encrypt(&plaintext, password)?;
    let envelope =
        serde_json::to_string(&encrypted).map_err(|err| WalletError::Storage(err.to_string()))?;
    store.set(key, &envelope)
}

/// Load and decrypt a record. `Ok(None)` covers both "no record" and
/// "wrong password" so restore flows can treat them alike.
pub fn load_encrypted<T: for<'de> Deserialize<'de>>(
    store: &dyn KeyValueStore,
    key: &str,
    password: &str,
) -> Result<Option<T>> {
    let Some(envelope) = store.get(key)? else {
        return Ok(None);
    };
    let Ok(encrypted) = serde_json::from_str::<EncryptedRecord>(&envelope) else {
        debug!("stored record under {} is not an encrypted envelope", key);
        return Ok(None);
    };
    let Some(plaintext) = RecordCipher::new().decrypt(&encrypted, password) else {
        return Ok(None);
    };
    match serde_json::from_slice(&plaintext) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            debug!("decrypted record under {} failed to parse: {}", key, err);
            Ok(None)
        }
    }
}
