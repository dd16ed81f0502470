//! Reconnect flavor: re-establishing a session with an already paired device.
//!
//! Instead of asking the user to compare codes, both sides prove they still
//! hold the key stored at association time. The resumed session key replaces
//! the stored one.

use carlink_crypto::{EncryptionRunner, HandshakeState, Key};
use tracing::{debug, info};

use crate::channel::{ChannelCore, HandshakeFlavor, SecureChannel};
use crate::error::ChannelError;
use crate::message::MessageStream;
use crate::storage::KeyStorage;

/// Handshake flavor for a previously associated device.
pub struct Reconnect {
    device_id: String,
    previous_key: Option<Key>,
}

impl Reconnect {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            previous_key: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn process_init(&mut self, core: &mut ChannelCore, message: &[u8]) -> Result<(), ChannelError> {
        let previous_key = core
            .storage()
            .encryption_key(&self.device_id)
            .ok_or_else(|| {
                ChannelError::InvalidEncryptionKey(format!(
                    "no stored key for device {}",
                    self.device_id
                ))
            })?;
        self.previous_key = Some(previous_key);

        debug!("responding to reconnect init request");
        let response = core.runner().respond_to_init_request(message)?;
        let next = response.next_message.ok_or_else(|| {
            ChannelError::InvalidState("runner produced no reply to the init request".into())
        })?;
        core.set_state(response.state);
        core.send_handshake_message(next, false)
    }

    fn process_in_progress(core: &mut ChannelCore, message: &[u8]) -> Result<(), ChannelError> {
        let response = core.runner().continue_handshake(message)?;
        if response.state != HandshakeState::ResumingSession {
            return Err(ChannelError::InvalidState(format!(
                "expected session resumption, runner reported {}",
                response.state
            )));
        }
        core.set_state(response.state);
        Ok(())
    }

    fn process_resume(
        &mut self,
        core: &mut ChannelCore,
        message: &[u8],
    ) -> Result<(), ChannelError> {
        let previous_key = self.previous_key.take().ok_or_else(|| {
            ChannelError::InvalidEncryptionKey("previous key no longer available".into())
        })?;
        let response = core
            .runner()
            .authenticate_and_resume_session(message, &previous_key)?;
        if response.state != HandshakeState::Finished {
            return Err(ChannelError::InvalidState(format!(
                "handshake not finished after resumption: {}",
                response.state
            )));
        }
        let key = response.key.ok_or_else(|| {
            ChannelError::InvalidEncryptionKey("resumption finished without a key".into())
        })?;
        let proof = response.next_message.ok_or_else(|| {
            ChannelError::InvalidState("runner produced no resumption proof".into())
        })?;

        core.send_handshake_message(proof, false)?;
        core.set_state(HandshakeState::Finished);
        core.set_encryption_key(&key)?;
        core.storage().save_encryption_key(&self.device_id, &key)?;
        info!(device_id = %self.device_id, "session resumed");
        core.notify_established();
        Ok(())
    }
}

impl HandshakeFlavor for Reconnect {
    fn name(&self) -> &'static str {
        "reconnect"
    }

    fn prepare_runner(&self, runner: &mut dyn EncryptionRunner) {
        runner.set_is_reconnect(true);
    }

    fn process_handshake(
        &mut self,
        core: &mut ChannelCore,
        message: &[u8],
    ) -> Result<(), ChannelError> {
        match core.state() {
            HandshakeState::Unknown => self.process_init(core, message),
            HandshakeState::InProgress => Self::process_in_progress(core, message),
            HandshakeState::ResumingSession => self.process_resume(core, message),
            other => Err(ChannelError::InvalidState(format!(
                "unexpected handshake message in state {other}"
            ))),
        }
    }

    fn abort(&mut self) {
        self.previous_key = None;
    }
}

impl SecureChannel<Reconnect> {
    /// Channel for reconnecting the previously associated `device_id`.
    pub fn reconnect(
        stream: impl MessageStream + 'static,
        runner: impl EncryptionRunner + 'static,
        storage: impl KeyStorage + 'static,
        device_id: impl Into<String>,
    ) -> Self {
        Self::new(stream, runner, storage, Reconnect::new(device_id))
    }
}
