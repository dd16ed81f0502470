//! Encryption runner contract.
//!
//! A runner owns the key-agreement state for one connection. The secure
//! channel feeds it the peer's handshake bytes and acts on the
//! [`HandshakeMessage`] it returns: bytes to send next, a verification code
//! to show, or the final session [`Key`].

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, HandshakeError};

/// Size of a session key in bytes.
pub const KEY_SIZE: usize = 32;

/// Progress of a handshake as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Unknown,
    InProgress,
    /// A numeric code must be confirmed by the user before finishing.
    VerificationNeeded,
    /// Raw verification bytes must be confirmed through another channel.
    OobVerificationNeeded,
    /// Reconnect: the peers must prove knowledge of the previous session key.
    ResumingSession,
    Finished,
}

impl HandshakeState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::InProgress => "in_progress",
            Self::VerificationNeeded => "verification_needed",
            Self::OobVerificationNeeded => "oob_verification_needed",
            Self::ResumingSession => "resuming_session",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symmetric session key produced by a finished handshake.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_SIZE]);

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key([REDACTED])")
    }
}

impl Key {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Result of a single runner step.
#[derive(Debug, Clone, Default)]
pub struct HandshakeMessage {
    pub state: HandshakeState,
    /// Bytes to transmit to the peer, if any.
    pub next_message: Option<Vec<u8>>,
    pub verification_code: Option<String>,
    pub oob_verification_code: Option<Vec<u8>>,
    pub key: Option<Key>,
}

impl HandshakeMessage {
    pub fn new(state: HandshakeState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_next_message(mut self, bytes: Vec<u8>) -> Self {
        self.next_message = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_verification_code(mut self, code: String) -> Self {
        self.verification_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_oob_verification_code(mut self, code: Vec<u8>) -> Self {
        self.oob_verification_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }
}

/// Key-agreement engine driven by a secure channel.
///
/// Implementations are single-use: one runner per connection attempt.
pub trait EncryptionRunner: Send {
    /// Initiator only: produce the first handshake message.
    fn init_handshake(&mut self) -> Result<HandshakeMessage, HandshakeError>;

    /// Responder only: answer the initiator's first message.
    fn respond_to_init_request(&mut self, message: &[u8])
    -> Result<HandshakeMessage, HandshakeError>;

    /// Feed the next peer message of an in-progress handshake.
    fn continue_handshake(&mut self, message: &[u8]) -> Result<HandshakeMessage, HandshakeError>;

    /// Called once the user confirmed the verification code.
    fn verify_pin(&mut self) -> Result<HandshakeMessage, HandshakeError>;

    /// Reconnect, initiator side: produce the proof of the previous key.
    fn init_reconnect_authentication(
        &mut self,
        previous_key: &Key,
    ) -> Result<HandshakeMessage, HandshakeError>;

    /// Reconnect: verify the peer's proof of the previous key and finish.
    fn authenticate_and_resume_session(
        &mut self,
        message: &[u8],
        previous_key: &Key,
    ) -> Result<HandshakeMessage, HandshakeError>;

    /// Select the reconnect path instead of user verification.
    fn set_is_reconnect(&mut self, is_reconnect: bool);
}
