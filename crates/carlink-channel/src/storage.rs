//! Key storage used by secure channels.
//!
//! [`KeyStorage`] is what a channel needs from persistence: write the session
//! key and challenge secret of a newly associated device, read a key back for
//! reconnects, and know the head unit's own unique id.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use carlink_crypto::{DeviceKeyStore, Key, StoreError};
use tracing::debug;
use uuid::Uuid;

/// Persistence contract for per-device keys.
pub trait KeyStorage: Send {
    /// Store (or overwrite) the session key for a device.
    fn save_encryption_key(&mut self, device_id: &str, key: &Key) -> Result<(), StoreError>;

    /// The stored session key for a device.
    fn encryption_key(&self, device_id: &str) -> Option<Key>;

    /// Store (or overwrite) the challenge secret for a device.
    fn save_challenge_secret(&mut self, device_id: &str, secret: &[u8])
    -> Result<(), StoreError>;

    /// Fail if `save_challenge_secret` would reject `secret`. Writes nothing.
    fn check_challenge_secret(&self, _secret: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    /// Forget a device and everything stored for it. Returns whether it was known.
    fn remove(&mut self, device_id: &str) -> Result<bool, StoreError>;

    /// The unique id this head unit sends during association.
    fn unique_id(&mut self) -> Result<Uuid, StoreError>;
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// [`KeyStorage`] backed by a JSON file, written through on every change.
#[derive(Debug)]
pub struct FileKeyStorage {
    path: PathBuf,
    store: DeviceKeyStore,
    challenge_secret_bytes: usize,
}

impl FileKeyStorage {
    /// Open (or lazily create) the store at `path`.
    ///
    /// Challenge secrets must be exactly `challenge_secret_bytes` long.
    pub fn open(path: &Path, challenge_secret_bytes: usize) -> Result<Self, StoreError> {
        let store = DeviceKeyStore::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            store,
            challenge_secret_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn store(&self) -> &DeviceKeyStore {
        &self.store
    }

    /// Rotate the unique id and persist it.
    pub fn rotate_unique_id(&mut self) -> Result<Uuid, StoreError> {
        let id = self.store.rotate_unique_id();
        self.store.save(&self.path)?;
        Ok(id)
    }
}

impl KeyStorage for FileKeyStorage {
    fn save_encryption_key(&mut self, device_id: &str, key: &Key) -> Result<(), StoreError> {
        self.store
            .save_encryption_key(device_id, key.as_bytes(), unix_now())?;
        self.store.save(&self.path)?;
        debug!(device_id, path = %self.path.display(), "saved encryption key");
        Ok(())
    }

    fn encryption_key(&self, device_id: &str) -> Option<Key> {
        self.store.encryption_key(device_id)
    }

    fn save_challenge_secret(
        &mut self,
        device_id: &str,
        secret: &[u8],
    ) -> Result<(), StoreError> {
        self.check_challenge_secret(secret)?;
        self.store
            .save_challenge_secret(device_id, secret, unix_now())?;
        self.store.save(&self.path)?;
        debug!(device_id, "saved challenge secret");
        Ok(())
    }

    fn check_challenge_secret(&self, secret: &[u8]) -> Result<(), StoreError> {
        if secret.len() != self.challenge_secret_bytes {
            return Err(StoreError::InvalidInput(format!(
                "challenge secret must be {} bytes, got {}",
                self.challenge_secret_bytes,
                secret.len()
            )));
        }
        Ok(())
    }

    fn remove(&mut self, device_id: &str) -> Result<bool, StoreError> {
        let removed = self.store.remove(device_id);
        if removed {
            self.store.save(&self.path)?;
            debug!(device_id, "removed device");
        }
        Ok(removed)
    }

    fn unique_id(&mut self) -> Result<Uuid, StoreError> {
        let had_id = self.store.unique_id_if_set().is_some();
        let id = self.store.unique_id();
        if !had_id {
            self.store.save(&self.path)?;
        }
        Ok(id)
    }
}

/// In-memory [`KeyStorage`]; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKeyStorage {
    store: DeviceKeyStore,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn store(&self) -> &DeviceKeyStore {
        &self.store
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn save_encryption_key(&mut self, device_id: &str, key: &Key) -> Result<(), StoreError> {
        self.store
            .save_encryption_key(device_id, key.as_bytes(), unix_now())
    }

    fn encryption_key(&self, device_id: &str) -> Option<Key> {
        self.store.encryption_key(device_id)
    }

    fn save_challenge_secret(
        &mut self,
        device_id: &str,
        secret: &[u8],
    ) -> Result<(), StoreError> {
        self.store.save_challenge_secret(device_id, secret, unix_now())
    }

    fn remove(&mut self, device_id: &str) -> Result<bool, StoreError> {
        Ok(self.store.remove(device_id))
    }

    fn unique_id(&mut self) -> Result<Uuid, StoreError> {
        Ok(self.store.unique_id())
    }
}
