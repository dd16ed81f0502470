//! Crypto session for post-handshake application traffic.
//!
//! Both peers hold the same session [`Key`] once the handshake finishes. The
//! message key is derived from it with HKDF-SHA256 and used with
//! ChaCha20-Poly1305 AEAD. On the wire an encrypted payload is
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use std::sync::atomic::{AtomicU32, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::runner::{KEY_SIZE, Key};

/// HKDF info string for message key derivation.
const HKDF_INFO: &[u8] = b"carlink-ble-message-v1";

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"carlink-ble-hkdf-salt-v1";

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Encrypted payload with metadata needed for decryption.
#[derive(Debug, Clone)]
pub struct EncryptedData {
    /// ChaCha20-Poly1305 ciphertext (includes 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 12-byte nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
}

impl EncryptedData {
    /// Serialize as `nonce || ciphertext`.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split a wire payload back into nonce and ciphertext.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "payload too short: {} bytes",
                bytes.len()
            )));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let mut arr = [0u8; NONCE_SIZE];
        arr.copy_from_slice(nonce);
        Ok(Self {
            ciphertext: ciphertext.to_vec(),
            nonce: arr,
        })
    }
}

/// A crypto session bound to one handshake's session key.
pub struct CryptoSession {
    cipher: ChaCha20Poly1305,
    /// Random prefix for nonces (set once per session).
    nonce_prefix: [u8; 8],
    /// Monotonic counter for nonce uniqueness.
    nonce_counter: AtomicU32,
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("nonce_counter", &self.nonce_counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Derive the 32-byte message key from the session key via HKDF-SHA256.
///
/// The caller is responsible for zeroizing the returned bytes.
fn hkdf_derive(session_key: &[u8; KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), session_key);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

impl Drop for CryptoSession {
    fn drop(&mut self) {
        self.nonce_prefix.zeroize();
    }
}

impl CryptoSession {
    /// Create a session from a handshake session key.
    pub fn from_key(key: &Key) -> Result<Self, CryptoError> {
        let mut key_bytes = hkdf_derive(key.as_bytes())?;

        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key_bytes));
        key_bytes.zeroize();

        let mut nonce_prefix = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_prefix);

        Ok(Self {
            cipher,
            nonce_prefix,
            nonce_counter: AtomicU32::new(0),
        })
    }

    /// Encrypt plaintext data.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedData, CryptoError> {
        let nonce_bytes = self.next_nonce()?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(EncryptedData {
            ciphertext,
            nonce: nonce_bytes,
        })
    }

    /// Decrypt ciphertext using the provided nonce.
    pub fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce_bytes.len(),
            });
        }
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Encrypt into the `nonce || ciphertext` wire layout.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(plaintext).map(|data| data.to_wire())
    }

    /// Decrypt a payload in the `nonce || ciphertext` wire layout.
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let data = EncryptedData::from_wire(payload)?;
        self.decrypt(&data.ciphertext, &data.nonce)
    }

    /// Generate the next unique nonce.
    ///
    /// Layout: [4-byte counter (big-endian)] [8-byte random prefix]
    ///
    /// Returns `NonceExhausted` if the counter has reached `u32::MAX`,
    /// meaning the peers must pair or reconnect again.
    fn next_nonce(&self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        loop {
            let current = self.nonce_counter.load(Ordering::Relaxed);
            if current == u32::MAX {
                return Err(CryptoError::NonceExhausted);
            }
            if let Ok(prev) = self.nonce_counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                let mut nonce = [0u8; NONCE_SIZE];
                nonce[..4].copy_from_slice(&prev.to_be_bytes());
                nonce[4..].copy_from_slice(&self.nonce_prefix);
                return Ok(nonce);
            }
        }
    }

    /// Get the current nonce counter value (for testing).
    #[cfg(any(test, feature = "test-utils"))]
    pub fn nonce_counter(&self) -> u32 {
        self.nonce_counter.load(Ordering::Relaxed)
    }
}
