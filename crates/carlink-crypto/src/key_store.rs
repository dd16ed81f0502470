//! Persistent store of paired devices.
//!
//! Keeps, per device id, the session key agreed during association and the
//! challenge secret the phone sent along with its id, plus the head unit's
//! own rotating unique id. Serialized as JSON; key material is hex-encoded,
//! zeroized on drop and redacted from `Debug` output.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::StoreError;
use crate::runner::Key;

/// A stored entry for a paired device.
#[derive(Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub device_id: String,
    /// Hex-encoded session key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption_key: Option<String>,
    /// Hex-encoded challenge secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    challenge_secret: Option<String>,
    /// When the device was first paired (Unix timestamp).
    pub first_paired: i64,
    /// When a key was last written for this device (Unix timestamp).
    pub last_connected: i64,
}

impl Drop for PairedDevice {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.challenge_secret.zeroize();
    }
}

impl std::fmt::Debug for PairedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedDevice")
            .field("device_id", &self.device_id)
            .field("has_encryption_key", &self.encryption_key.is_some())
            .field("has_challenge_secret", &self.challenge_secret.is_some())
            .field("first_paired", &self.first_paired)
            .field("last_connected", &self.last_connected)
            .finish()
    }
}

impl PairedDevice {
    fn new(device_id: &str, now: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            encryption_key: None,
            challenge_secret: None,
            first_paired: now,
            last_connected: now,
        }
    }

    pub const fn has_encryption_key(&self) -> bool {
        self.encryption_key.is_some()
    }
}

/// Persistent store of paired devices and the local unique id.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceKeyStore {
    /// Unique id this head unit presents to phones during association.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unique_id: Option<uuid::Uuid>,
    /// Map from device id to paired device entry.
    #[serde(default)]
    devices: HashMap<String, PairedDevice>,
}

impl DeviceKeyStore {
    /// Load the store from a JSON file. Returns default if file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| StoreError::Serialization(format!("Failed to parse key store: {e}")))
    }

    /// Save the store to a JSON file with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut json = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(format!("Failed to serialize key store: {e}")))?;
        std::fs::write(path, &json)?;
        json.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// The local unique id, generated on first use.
    pub fn unique_id(&mut self) -> uuid::Uuid {
        *self.unique_id.get_or_insert_with(uuid::Uuid::new_v4)
    }

    /// The local unique id without generating one.
    pub const fn unique_id_if_set(&self) -> Option<uuid::Uuid> {
        self.unique_id
    }

    /// Replace the local unique id with a fresh one.
    pub fn rotate_unique_id(&mut self) -> uuid::Uuid {
        let id = uuid::Uuid::new_v4();
        self.unique_id = Some(id);
        id
    }

    /// Store the session key for a device, creating its entry if needed.
    pub fn save_encryption_key(
        &mut self,
        device_id: &str,
        key: &[u8],
        now: i64,
    ) -> Result<(), StoreError> {
        if device_id.is_empty() {
            return Err(StoreError::InvalidInput("empty device id".into()));
        }
        Key::from_bytes(key).map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        let entry = self.entry(device_id, now);
        if let Some(old) = entry.encryption_key.as_mut() {
            old.zeroize();
        }
        entry.encryption_key = Some(hex::encode(key));
        entry.last_connected = now;
        Ok(())
    }

    /// The stored session key for a device.
    pub fn encryption_key(&self, device_id: &str) -> Option<Key> {
        let hex_key = self.devices.get(device_id)?.encryption_key.as_ref()?;
        let mut bytes = hex::decode(hex_key).ok()?;
        let key = Key::from_bytes(&bytes).ok();
        bytes.zeroize();
        key
    }

    /// Store the challenge secret for a device.
    pub fn save_challenge_secret(
        &mut self,
        device_id: &str,
        secret: &[u8],
        now: i64,
    ) -> Result<(), StoreError> {
        if device_id.is_empty() {
            return Err(StoreError::InvalidInput("empty device id".into()));
        }
        if secret.is_empty() {
            return Err(StoreError::InvalidInput("empty challenge secret".into()));
        }
        let entry = self.entry(device_id, now);
        if let Some(old) = entry.challenge_secret.as_mut() {
            old.zeroize();
        }
        entry.challenge_secret = Some(hex::encode(secret));
        Ok(())
    }

    /// The stored challenge secret for a device.
    pub fn challenge_secret(&self, device_id: &str) -> Option<Vec<u8>> {
        let secret = self.devices.get(device_id)?.challenge_secret.as_ref()?;
        hex::decode(secret).ok()
    }

    /// Paired devices, oldest pairing first.
    pub fn paired_devices(&self) -> Vec<&PairedDevice> {
        let mut devices: Vec<_> = self.devices.values().collect();
        devices.sort_by(|a, b| {
            a.first_paired
                .cmp(&b.first_paired)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        devices
    }

    pub fn device(&self, device_id: &str) -> Option<&PairedDevice> {
        self.devices.get(device_id)
    }

    /// Forget a device.
    pub fn remove(&mut self, device_id: &str) -> bool {
        self.devices.remove(device_id).is_some()
    }

    fn entry(&mut self, device_id: &str, now: i64) -> &mut PairedDevice {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| PairedDevice::new(device_id, now))
    }
}
