//! Configuration resolution for carlink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/carlink/settings.json)
//! 3. Project config (.carlink/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete carlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the user confirms a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// A short numeric code shown on both screens.
    #[default]
    Numeric,
    /// Raw verification bytes exchanged over another channel (e.g. NFC, QR).
    OutOfBand,
}

impl std::str::FromStr for VerificationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "numeric" => Ok(Self::Numeric),
            "out_of_band" | "oob" => Ok(Self::OutOfBand),
            other => Err(Error::Config(format!("Unknown verification mode: {other}"))),
        }
    }
}

/// Handshake / secure channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub verification_mode: VerificationMode,
    /// Number of digits in a numeric verification code.
    pub verification_code_digits: u8,
    /// Connection-level timeout applied by callers around a whole handshake.
    pub handshake_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            verification_mode: VerificationMode::Numeric,
            verification_code_digits: 6,
            handshake_timeout_secs: 30,
        }
    }
}

/// Key storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub key_store_path: Option<PathBuf>,
    /// Exact length a challenge secret must have to be accepted.
    pub challenge_secret_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_store_path: None,
            challenge_secret_bytes: 32,
        }
    }
}

impl StorageConfig {
    /// Configured key store path, falling back to the platform default.
    pub fn resolved_key_store_path(&self) -> Option<PathBuf> {
        self.key_store_path.clone().or_else(default_key_store_path)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// Layers merge key by key, so a project file that sets one field leaves the
/// rest of the global file in effect.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global_path) = global_config_path() {
        layers.push(global_path);
    }
    if let Some(dir) = project_dir {
        layers.push(dir.join(".carlink").join("settings.json"));
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration from an explicit file, then apply environment overrides.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let mut config = load_config_file(path)?;
    debug!(path = %path.display(), "loaded config file");
    apply_env_overrides(&mut config);
    Ok(config)
}

/// The per-user carlink directory (`~/.config/carlink` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("carlink"))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default path of the paired-device key store.
pub fn default_key_store_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("devices.json"))
}

fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = Value::Object(Map::new());
    for path in paths.iter().filter(|p| p.exists()) {
        merge_values(&mut merged, read_config_value(path)?);
        debug!(path = %path.display(), "loaded config layer");
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

fn load_config_file(path: &Path) -> Result<Config> {
    serde_json::from_value(read_config_value(path)?).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Objects merge key by key; any other overlay value replaces the base.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_values(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CARLINK_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var("CARLINK_LOG_JSON") {
        config.logging.json = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("CARLINK_KEY_STORE") {
        config.storage.key_store_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("CARLINK_VERIFICATION_MODE") {
        if let Ok(mode) = val.parse() {
            config.channel.verification_mode = mode;
        }
    }
    if let Ok(val) = std::env::var("CARLINK_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(n) = val.parse() {
            config.channel.handshake_timeout_secs = n;
        }
    }
}
