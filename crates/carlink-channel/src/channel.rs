//! Secure channel driver.
//!
//! A [`SecureChannel`] sits between a [`MessageStream`] and the application.
//! It owns the handshake state for one connection, hands handshake frames to
//! its [`HandshakeFlavor`] (association or reconnect), and once a session key
//! is installed transparently encrypts and decrypts application traffic.
//!
//! Channels are single-use: create one per connection attempt and drop it
//! when the connection ends. Feeding a channel after it failed or finished is
//! harmless but does nothing. The channel is not internally synchronized;
//! drive it from one task.

use carlink_crypto::{CryptoSession, EncryptionRunner, HandshakeState, Key};
use tracing::{Span, debug, error, info, info_span, warn};

use crate::error::ChannelError;
use crate::message::{DeviceMessage, MessageStream, OperationType};
use crate::storage::KeyStorage;

/// Lifecycle notifications from a secure channel.
///
/// `on_secure_channel_established`, `on_secure_channel_failure` and
/// `on_device_id_received` fire at most once per channel.
pub trait Callback: Send {
    fn on_secure_channel_established(&mut self);

    fn on_secure_channel_failure(&mut self, error: &ChannelError);

    /// The peer identified itself; always precedes `on_secure_channel_established`.
    fn on_device_id_received(&mut self, device_id: &str);

    /// An application message arrived on an established channel.
    fn on_message_received(&mut self, _message: DeviceMessage) {}

    /// An inbound message could not be decrypted. The channel stays usable.
    fn on_message_received_error(&mut self, _error: &ChannelError) {}
}

/// Strategy deciding how a channel reacts to handshake frames.
pub trait HandshakeFlavor: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Configure a fresh runner before the first frame arrives.
    fn prepare_runner(&self, runner: &mut dyn EncryptionRunner);

    /// Handle one decrypted handshake frame. Any error is fatal.
    fn process_handshake(
        &mut self,
        core: &mut ChannelCore,
        message: &[u8],
    ) -> Result<(), ChannelError>;

    /// Drop any transient secrets after a failure.
    fn abort(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Established,
    Failed,
}

/// Channel state shared with the flavor: collaborators, handshake state and
/// the session key.
pub struct ChannelCore {
    stream: Box<dyn MessageStream>,
    runner: Box<dyn EncryptionRunner>,
    storage: Box<dyn KeyStorage>,
    callback: Option<Box<dyn Callback>>,
    state: HandshakeState,
    session: Option<CryptoSession>,
    lifecycle: Lifecycle,
    device_id_reported: bool,
}

impl ChannelCore {
    pub fn runner(&mut self) -> &mut dyn EncryptionRunner {
        self.runner.as_mut()
    }

    pub fn storage(&mut self) -> &mut dyn KeyStorage {
        self.storage.as_mut()
    }

    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn set_state(&mut self, state: HandshakeState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "handshake state changed");
        }
        self.state = state;
    }

    /// Send a channel-internal message to the peer, sealed when `is_encrypted`.
    pub fn send_handshake_message(
        &mut self,
        payload: Vec<u8>,
        is_encrypted: bool,
    ) -> Result<(), ChannelError> {
        let payload = if is_encrypted {
            self.seal(&payload)?
        } else {
            payload
        };
        debug!(len = payload.len(), is_encrypted, "sending handshake message");
        self.stream.write_message(
            DeviceMessage::handshake(payload, is_encrypted),
            OperationType::EncryptionHandshake,
        );
        Ok(())
    }

    /// Install the session key used for all further encrypted traffic.
    pub fn set_encryption_key(&mut self, key: &Key) -> Result<(), ChannelError> {
        let session = CryptoSession::from_key(key)
            .map_err(|e| ChannelError::InvalidEncryptionKey(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    pub const fn has_encryption_key(&self) -> bool {
        self.session.is_some()
    }

    pub fn notify_device_id_received(&mut self, device_id: &str) {
        if self.lifecycle != Lifecycle::Active || self.device_id_reported {
            return;
        }
        self.device_id_reported = true;
        info!(device_id, "device id received");
        if let Some(callback) = self.callback.as_mut() {
            callback.on_device_id_received(device_id);
        }
    }

    pub fn notify_established(&mut self) {
        if self.lifecycle != Lifecycle::Active {
            return;
        }
        self.lifecycle = Lifecycle::Established;
        info!("secure channel established");
        if let Some(callback) = self.callback.as_mut() {
            callback.on_secure_channel_established();
        }
    }

    fn notify_failure(&mut self, err: &ChannelError) {
        if self.lifecycle != Lifecycle::Active {
            warn!(error = %err, "error after channel settled, not reported");
            return;
        }
        self.lifecycle = Lifecycle::Failed;
        self.session = None;
        error!(code = %err.code(), error = %err, "secure channel failed");
        if let Some(callback) = self.callback.as_mut() {
            callback.on_secure_channel_failure(err);
        }
    }

    fn notify_message_error(&mut self, err: &ChannelError) {
        warn!(code = %err.code(), error = %err, "dropping inbound message");
        if let Some(callback) = self.callback.as_mut() {
            callback.on_message_received_error(err);
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ChannelError::InvalidState("no encryption key installed".into()))?;
        session
            .seal(plaintext)
            .map_err(|e| ChannelError::InvalidEncryptionKey(e.to_string()))
    }

    fn open(&self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let session = self.session.as_ref().ok_or_else(|| {
            ChannelError::InvalidMessage("encrypted message before key agreement".into())
        })?;
        session
            .open(payload)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))
    }
}

/// Handshake driver for one connection, parameterized by its flavor.
pub struct SecureChannel<F: HandshakeFlavor> {
    pub(crate) core: ChannelCore,
    pub(crate) flavor: F,
    pub(crate) span: Span,
}

impl<F: HandshakeFlavor> SecureChannel<F> {
    pub fn new(
        stream: impl MessageStream + 'static,
        mut runner: impl EncryptionRunner + 'static,
        storage: impl KeyStorage + 'static,
        flavor: F,
    ) -> Self {
        flavor.prepare_runner(&mut runner);
        let span = info_span!("secure_channel", flavor = flavor.name());
        Self {
            core: ChannelCore {
                stream: Box::new(stream),
                runner: Box::new(runner),
                storage: Box::new(storage),
                callback: None,
                state: HandshakeState::Unknown,
                session: None,
                lifecycle: Lifecycle::Active,
                device_id_reported: false,
            },
            flavor,
            span,
        }
    }

    /// Replace the default span, e.g. with one carrying connection fields.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn set_callback(&mut self, callback: impl Callback + 'static) {
        self.core.callback = Some(Box::new(callback));
    }

    pub const fn state(&self) -> HandshakeState {
        self.core.state
    }

    pub fn is_established(&self) -> bool {
        self.core.lifecycle == Lifecycle::Established
    }

    pub fn is_failed(&self) -> bool {
        self.core.lifecycle == Lifecycle::Failed
    }

    pub const fn flavor(&self) -> &F {
        &self.flavor
    }

    /// Feed one decrypted handshake frame from the peer.
    pub fn process_handshake(&mut self, message: &[u8]) {
        let span = self.span.clone();
        let _enter = span.enter();
        match self.core.lifecycle {
            Lifecycle::Active => {}
            Lifecycle::Established => {
                warn!(len = message.len(), "ignoring handshake message on established channel");
                return;
            }
            Lifecycle::Failed => {
                debug!(len = message.len(), "ignoring handshake message on failed channel");
                return;
            }
        }
        debug!(state = %self.core.state, len = message.len(), "processing handshake message");
        if let Err(err) = self.flavor.process_handshake(&mut self.core, message) {
            self.fail(&err);
        }
    }

    /// Entry point for every message the stream reassembles.
    pub fn on_message_received(&mut self, message: DeviceMessage, operation: OperationType) {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.core.lifecycle == Lifecycle::Failed {
            debug!("ignoring message on failed channel");
            return;
        }

        let payload = if message.is_encrypted {
            match self.core.open(&message.payload) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    self.core.notify_message_error(&err);
                    return;
                }
            }
        } else {
            message.payload
        };

        match operation {
            OperationType::EncryptionHandshake => self.process_handshake(&payload),
            OperationType::ClientMessage => {
                if self.core.lifecycle != Lifecycle::Established {
                    let err = ChannelError::InvalidMessage(
                        "client message before the channel was established".into(),
                    );
                    self.core.notify_message_error(&err);
                    return;
                }
                if let Some(callback) = self.core.callback.as_mut() {
                    callback.on_message_received(DeviceMessage::new(
                        message.recipient,
                        message.is_encrypted,
                        payload,
                    ));
                }
            }
        }
    }

    /// Send an application message over an established channel.
    pub fn send_client_message(&mut self, message: DeviceMessage) -> Result<(), ChannelError> {
        let _enter = self.span.enter();
        if self.core.lifecycle != Lifecycle::Established {
            return Err(ChannelError::InvalidState(
                "channel is not established".into(),
            ));
        }
        let payload = if message.is_encrypted {
            self.core.seal(&message.payload)?
        } else {
            message.payload
        };
        self.core.stream.write_message(
            DeviceMessage::new(message.recipient, message.is_encrypted, payload),
            OperationType::ClientMessage,
        );
        Ok(())
    }

    pub(crate) fn fail(&mut self, err: &ChannelError) {
        self.flavor.abort();
        self.core.notify_failure(err);
    }
}

impl<F: HandshakeFlavor> std::fmt::Debug for SecureChannel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("flavor", &self.flavor.name())
            .field("state", &self.core.state)
            .field("lifecycle", &self.core.lifecycle)
            .field("has_encryption_key", &self.core.session.is_some())
            .finish_non_exhaustive()
    }
}
