//! Secure channel error types.

use carlink_crypto::{HandshakeError, StoreError};

/// Stable error codes reported to channel callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ChannelErrorCode {
    InvalidHandshake = 0,
    InvalidMessage = 1,
    InvalidDeviceId = 2,
    InvalidVerification = 3,
    InvalidState = 4,
    InvalidEncryptionKey = 5,
    StorageError = 6,
}

impl ChannelErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidHandshake => "CHANNEL_ERROR_INVALID_HANDSHAKE",
            Self::InvalidMessage => "CHANNEL_ERROR_INVALID_MSG",
            Self::InvalidDeviceId => "CHANNEL_ERROR_INVALID_DEVICE_ID",
            Self::InvalidVerification => "CHANNEL_ERROR_INVALID_VERIFICATION",
            Self::InvalidState => "CHANNEL_ERROR_INVALID_STATE",
            Self::InvalidEncryptionKey => "CHANNEL_ERROR_INVALID_ENCRYPTION_KEY",
            Self::StorageError => "CHANNEL_ERROR_STORAGE_ERROR",
        }
    }
}

impl std::fmt::Display for ChannelErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a secure channel.
///
/// Everything except [`ChannelError::InvalidMessage`] is fatal: it is
/// reported once through the failure callback and the channel is dead.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid handshake message: {0}")]
    InvalidHandshake(#[from] HandshakeError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("Invalid verification: {0}")]
    InvalidVerification(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid encryption key: {0}")]
    InvalidEncryptionKey(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl ChannelError {
    pub const fn code(&self) -> ChannelErrorCode {
        match self {
            Self::InvalidHandshake(_) => ChannelErrorCode::InvalidHandshake,
            Self::InvalidMessage(_) => ChannelErrorCode::InvalidMessage,
            Self::InvalidDeviceId(_) => ChannelErrorCode::InvalidDeviceId,
            Self::InvalidVerification(_) => ChannelErrorCode::InvalidVerification,
            Self::InvalidState(_) => ChannelErrorCode::InvalidState,
            Self::InvalidEncryptionKey(_) => ChannelErrorCode::InvalidEncryptionKey,
            Self::Storage(_) => ChannelErrorCode::StorageError,
        }
    }

    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidMessage(_))
    }
}
