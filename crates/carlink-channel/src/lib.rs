//! `carlink` Secure Channel
//!
//! Drives the pairing handshake between a vehicle head unit and a phone over
//! a message stream (typically BLE), then protects application traffic with
//! the agreed session key.
//!
//! - [`SecureChannel`] is the head-unit side driver, parameterized by a
//!   [`HandshakeFlavor`]: [`Association`] for first-time pairing with user
//!   verification, [`Reconnect`] for previously paired devices.
//! - [`Companion`] is the phone-side initiator.
//! - [`KeyStorage`] is the persistence contract, with file and in-memory
//!   implementations.

pub mod association;
pub mod channel;
pub mod companion;
pub mod device_id;
pub mod error;
pub mod message;
pub mod reconnect;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use association::{Association, ShowVerificationCodeListener};
pub use channel::{Callback, ChannelCore, HandshakeFlavor, SecureChannel};
pub use companion::{Companion, Verification};
pub use device_id::{
    DEVICE_ID_BYTES, DeviceIdError, bytes_to_uuid, device_message, split_device_message,
    uuid_to_bytes,
};
pub use error::{ChannelError, ChannelErrorCode};
pub use message::{DeviceMessage, MessageStream, OperationType};
pub use reconnect::Reconnect;
pub use storage::{FileKeyStorage, KeyStorage, MemoryKeyStorage};
