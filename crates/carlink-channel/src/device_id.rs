//! Device identity codec.
//!
//! Device ids travel as the 16 raw bytes of a UUID in RFC 4122 (big-endian)
//! field order. After association the phone sends its id immediately followed
//! by its challenge secret; there is no length field, the split is fixed at
//! [`DEVICE_ID_BYTES`].

use uuid::Uuid;

/// Length of an encoded device id.
pub const DEVICE_ID_BYTES: usize = 16;

/// Encode a UUID as its 16 big-endian bytes.
pub const fn uuid_to_bytes(id: Uuid) -> [u8; DEVICE_ID_BYTES] {
    *id.as_bytes()
}

/// Decode exactly 16 bytes into a UUID.
pub fn bytes_to_uuid(bytes: &[u8]) -> Option<Uuid> {
    Uuid::from_slice(bytes).ok()
}

/// Why a device id could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdError {
    #[error("message too short for a device id: {0} bytes")]
    TooShort(usize),
    #[error("device id is the nil UUID")]
    Nil,
}

/// Split an identity message into the device id and the trailing challenge secret.
pub fn split_device_message(message: &[u8]) -> Result<(Uuid, &[u8]), DeviceIdError> {
    if message.len() < DEVICE_ID_BYTES {
        return Err(DeviceIdError::TooShort(message.len()));
    }
    let (id_bytes, secret) = message.split_at(DEVICE_ID_BYTES);
    let id = bytes_to_uuid(id_bytes).ok_or(DeviceIdError::TooShort(id_bytes.len()))?;
    if id.is_nil() {
        return Err(DeviceIdError::Nil);
    }
    Ok((id, secret))
}

/// Build an identity message: device id bytes followed by the challenge secret.
pub fn device_message(id: Uuid, challenge_secret: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DEVICE_ID_BYTES + challenge_secret.len());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(challenge_secret);
    out
}
