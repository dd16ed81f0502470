//! Paired-device subcommands: list, forget, unique-id.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::Path;

use anyhow::Context;
use carlink_channel::{FileKeyStorage, KeyStorage};
use carlink_crypto::StoreError;
use tracing::info;
use uuid::Uuid;

fn open(key_store: &Path, challenge_secret_bytes: usize) -> anyhow::Result<FileKeyStorage> {
    FileKeyStorage::open(key_store, challenge_secret_bytes)
        .with_context(|| format!("Failed to open key store {}", key_store.display()))
}

/// Print the paired devices as a table.
pub fn list(key_store: &Path, challenge_secret_bytes: usize) -> anyhow::Result<()> {
    let storage = open(key_store, challenge_secret_bytes)?;
    write_devices(&mut io::stdout(), &storage)
}

fn write_devices(out: &mut impl Write, storage: &FileKeyStorage) -> anyhow::Result<()> {
    let devices = storage.store().paired_devices();
    if devices.is_empty() {
        writeln!(out, "No paired devices.")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<38} {:<5} {:>12} {:>12}",
        "DEVICE", "KEY", "PAIRED", "LAST SEEN"
    )?;
    for device in devices {
        writeln!(
            out,
            "{:<38} {:<5} {:>12} {:>12}",
            device.device_id,
            if device.has_encryption_key() { "yes" } else { "no" },
            device.first_paired,
            device.last_connected
        )?;
    }
    Ok(())
}

/// Remove a paired device from the store.
pub fn forget(
    key_store: &Path,
    challenge_secret_bytes: usize,
    device_id: Uuid,
) -> anyhow::Result<()> {
    let mut storage = open(key_store, challenge_secret_bytes)?;
    let id = device_id.to_string();
    if !storage.remove(&id)? {
        return Err(StoreError::UnknownDevice(id).into());
    }
    info!(device_id = %id, "device forgotten");
    writeln!(io::stdout(), "Forgot {id}")?;
    Ok(())
}

/// Print (and optionally rotate) the head unit's unique id.
pub fn unique_id(
    key_store: &Path,
    challenge_secret_bytes: usize,
    rotate: bool,
) -> anyhow::Result<Uuid> {
    let mut storage = open(key_store, challenge_secret_bytes)?;
    let id = if rotate {
        let id = storage.rotate_unique_id()?;
        info!(unique_id = %id, "rotated head unit id");
        id
    } else {
        storage.unique_id()?
    };
    writeln!(io::stdout(), "{id}")?;
    Ok(id)
}
