//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Nonce counter exhausted: session must be rekeyed")]
    NonceExhausted,
}

/// Errors raised by an encryption runner while driving a handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Malformed handshake message: {0}")]
    MalformedMessage(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("{operation} is not valid in runner phase {phase}")]
    UnexpectedCall {
        operation: &'static str,
        phase: &'static str,
    },

    #[error("Client finish does not match the committed value")]
    CommitmentMismatch,

    #[error("Session resumption authentication failed")]
    ResumeAuthenticationFailed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the persistent device key store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
