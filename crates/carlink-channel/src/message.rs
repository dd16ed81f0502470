//! Device messages and the stream that carries them.

use uuid::Uuid;

/// Purpose of a frame on the message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Handshake traffic, consumed by the secure channel itself.
    EncryptionHandshake,
    /// Application traffic, delivered to the channel's callback.
    ClientMessage,
}

/// A logical message exchanged with the peer device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    /// Recipient feature id; `None` for channel-internal messages.
    pub recipient: Option<Uuid>,
    pub is_encrypted: bool,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for DeviceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMessage")
            .field("recipient", &self.recipient)
            .field("is_encrypted", &self.is_encrypted)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl DeviceMessage {
    pub const fn new(recipient: Option<Uuid>, is_encrypted: bool, payload: Vec<u8>) -> Self {
        Self {
            recipient,
            is_encrypted,
            payload,
        }
    }

    /// A channel-internal message with no recipient.
    pub const fn handshake(payload: Vec<u8>, is_encrypted: bool) -> Self {
        Self::new(None, is_encrypted, payload)
    }
}

/// Transport that segments and delivers messages to the peer.
///
/// Inbound traffic flows the other way: the transport hands each reassembled
/// message to the channel's `on_message_received`.
pub trait MessageStream: Send {
    fn write_message(&mut self, message: DeviceMessage, operation: OperationType);
}
