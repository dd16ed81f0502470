//! `carlink` Handshake and Encryption Library
//!
//! Provides the cryptographic side of pairing a phone with a vehicle head
//! unit over an untrusted transport such as BLE.
//!
//! ## Crypto primitives
//!
//! - **Handshake**: UKEY2-style commit/reveal X25519 exchange, HKDF-SHA256 over
//!   the transcript for the auth string and next-protocol secret
//! - **Verification**: short numeric code (or raw out-of-band bytes) derived
//!   from the auth string, confirmed by the user on both devices
//! - **Reconnect**: resumption MACs keyed by the previously stored session key
//! - **Encryption**: ChaCha20-Poly1305 AEAD, 12-byte nonce (4-byte counter + 8-byte random prefix)
//! - **Storage**: JSON-backed store of per-device session keys and challenge secrets

pub mod error;
pub mod key_store;
pub mod runner;
pub mod session;
pub mod ukey2;
pub mod verification;

pub use error::{CryptoError, HandshakeError, StoreError};
pub use key_store::{DeviceKeyStore, PairedDevice};
pub use runner::{EncryptionRunner, HandshakeMessage, HandshakeState, KEY_SIZE, Key};
pub use session::{CryptoSession, EncryptedData, NONCE_SIZE};
#[cfg(any(test, feature = "test-utils"))]
pub use ukey2::{paired_runners, run_to_verification};
pub use ukey2::{Role, Ukey2Runner};
pub use verification::{constant_time_eq, format_code_display, numeric_code, oob_code_display};
