//! Phone-side initiator.
//!
//! [`Companion`] plays the role of the phone against a head unit running a
//! [`SecureChannel`](crate::SecureChannel). It is driven by hand: call
//! [`Companion::start`] for the first frame, then feed every inbound
//! handshake message to [`Companion::handle`] and transmit whatever it
//! returns. Used by the loopback demo and by end-to-end tests.

use carlink_crypto::{CryptoSession, EncryptionRunner, HandshakeState, Key, oob_code_display};
use tracing::{Span, debug, info, info_span};
use uuid::Uuid;

use crate::device_id::{DEVICE_ID_BYTES, bytes_to_uuid, device_message};
use crate::error::ChannelError;
use crate::message::DeviceMessage;

/// Code the phone shows to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Numeric(String),
    OutOfBand(Vec<u8>),
}

impl Verification {
    /// Text to display; out-of-band bytes are hex-encoded.
    pub fn display(&self) -> String {
        match self {
            Self::Numeric(code) => code.clone(),
            Self::OutOfBand(bytes) => oob_code_display(bytes),
        }
    }
}

enum Mode {
    Associate {
        device_id: Uuid,
        challenge_secret: Vec<u8>,
    },
    Reconnect {
        previous_key: Key,
    },
}

/// Initiator side of an association or reconnect handshake.
pub struct Companion {
    runner: Box<dyn EncryptionRunner>,
    mode: Mode,
    state: HandshakeState,
    verification: Option<Verification>,
    key: Option<Key>,
    session: Option<CryptoSession>,
    car_unique_id: Option<Uuid>,
    established: bool,
    span: Span,
}

impl Companion {
    /// Associate as `device_id`, handing `challenge_secret` to the head unit.
    pub fn associate(
        mut runner: impl EncryptionRunner + 'static,
        device_id: Uuid,
        challenge_secret: Vec<u8>,
    ) -> Self {
        runner.set_is_reconnect(false);
        Self::new(
            Box::new(runner),
            Mode::Associate {
                device_id,
                challenge_secret,
            },
            info_span!("companion", mode = "associate", %device_id),
        )
    }

    /// Reconnect using the key agreed at association.
    pub fn reconnect(mut runner: impl EncryptionRunner + 'static, previous_key: Key) -> Self {
        runner.set_is_reconnect(true);
        Self::new(
            Box::new(runner),
            Mode::Reconnect { previous_key },
            info_span!("companion", mode = "reconnect"),
        )
    }

    fn new(runner: Box<dyn EncryptionRunner>, mode: Mode, span: Span) -> Self {
        Self {
            runner,
            mode,
            state: HandshakeState::Unknown,
            verification: None,
            key: None,
            session: None,
            car_unique_id: None,
            established: false,
            span,
        }
    }

    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    pub const fn verification(&self) -> Option<&Verification> {
        self.verification.as_ref()
    }

    pub const fn is_established(&self) -> bool {
        self.established
    }

    /// Unique id the head unit sent after verification.
    pub const fn car_unique_id(&self) -> Option<Uuid> {
        self.car_unique_id
    }

    /// Session key, available once the handshake finished.
    pub const fn session_key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// First handshake frame.
    pub fn start(&mut self) -> Result<DeviceMessage, ChannelError> {
        let _enter = self.span.enter();
        if self.state != HandshakeState::Unknown {
            return Err(ChannelError::InvalidState("handshake already started".into()));
        }
        let response = self.runner.init_handshake()?;
        let client_init = response.next_message.ok_or_else(|| {
            ChannelError::InvalidState("runner produced no init request".into())
        })?;
        self.state = response.state;
        debug!("sending init request");
        Ok(DeviceMessage::handshake(client_init, false))
    }

    /// Process one inbound handshake frame, returning the frames to send back.
    pub fn handle(&mut self, message: &DeviceMessage) -> Result<Vec<DeviceMessage>, ChannelError> {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.established {
            return Err(ChannelError::InvalidState("handshake already complete".into()));
        }
        let payload = if message.is_encrypted {
            self.decrypt(&message.payload)?
        } else {
            message.payload.clone()
        };

        let reconnecting = matches!(self.mode, Mode::Reconnect { .. });
        match (self.state, reconnecting) {
            (HandshakeState::InProgress, _) => self.on_server_init(&payload),
            (HandshakeState::ResumingSession, true) => self.on_resume_proof(&payload),
            (HandshakeState::Finished, false) if message.is_encrypted => {
                self.on_unique_id(&payload)
            }
            (state, _) => Err(ChannelError::InvalidState(format!(
                "unexpected handshake message in state {state}"
            ))),
        }
    }

    /// The user confirmed that both devices show the same code.
    pub fn accept_verification(&mut self) -> Result<(), ChannelError> {
        let span = self.span.clone();
        let _enter = span.enter();
        if !matches!(
            self.state,
            HandshakeState::VerificationNeeded | HandshakeState::OobVerificationNeeded
        ) {
            return Err(ChannelError::InvalidState(format!(
                "nothing to verify in state {}",
                self.state
            )));
        }
        let response = self
            .runner
            .verify_pin()
            .map_err(|e| ChannelError::InvalidVerification(e.to_string()))?;
        if response.state != HandshakeState::Finished {
            return Err(ChannelError::InvalidState(format!(
                "handshake not finished after pin verification: {}",
                response.state
            )));
        }
        let key = response.key.ok_or_else(|| {
            ChannelError::InvalidEncryptionKey("handshake finished without a key".into())
        })?;
        self.install_key(key)?;
        self.state = HandshakeState::Finished;
        debug!("verification accepted");
        Ok(())
    }

    /// Encrypt an application message for the head unit.
    pub fn seal(
        &self,
        recipient: Option<Uuid>,
        payload: &[u8],
    ) -> Result<DeviceMessage, ChannelError> {
        let session = self.established_session()?;
        let sealed = session
            .seal(payload)
            .map_err(|e| ChannelError::InvalidEncryptionKey(e.to_string()))?;
        Ok(DeviceMessage::new(recipient, true, sealed))
    }

    /// Decrypt an application message from the head unit.
    pub fn open(&self, message: &DeviceMessage) -> Result<Vec<u8>, ChannelError> {
        self.established_session()?;
        if message.is_encrypted {
            self.decrypt(&message.payload)
        } else {
            Ok(message.payload.clone())
        }
    }

    fn on_server_init(&mut self, payload: &[u8]) -> Result<Vec<DeviceMessage>, ChannelError> {
        let response = self.runner.continue_handshake(payload)?;
        let client_finish = response.next_message.ok_or_else(|| {
            ChannelError::InvalidState("runner produced no client finish".into())
        })?;
        let mut out = vec![DeviceMessage::handshake(client_finish, false)];

        match (response.state, &self.mode) {
            (HandshakeState::VerificationNeeded, Mode::Associate { .. }) => {
                let code = response.verification_code.ok_or_else(|| {
                    ChannelError::InvalidVerification("runner produced no verification code".into())
                })?;
                self.verification = Some(Verification::Numeric(code));
            }
            (HandshakeState::OobVerificationNeeded, Mode::Associate { .. }) => {
                let code = response.oob_verification_code.ok_or_else(|| {
                    ChannelError::InvalidVerification(
                        "runner produced no out-of-band verification code".into(),
                    )
                })?;
                self.verification = Some(Verification::OutOfBand(code));
            }
            (HandshakeState::ResumingSession, Mode::Reconnect { previous_key }) => {
                let proof = self
                    .runner
                    .init_reconnect_authentication(previous_key)?
                    .next_message
                    .ok_or_else(|| {
                        ChannelError::InvalidState("runner produced no resumption proof".into())
                    })?;
                out.push(DeviceMessage::handshake(proof, false));
            }
            (other, _) => {
                return Err(ChannelError::InvalidState(format!(
                    "unexpected runner state {other} after server init"
                )));
            }
        }
        self.state = response.state;
        Ok(out)
    }

    fn on_resume_proof(&mut self, payload: &[u8]) -> Result<Vec<DeviceMessage>, ChannelError> {
        let Mode::Reconnect { previous_key } = &self.mode else {
            return Err(ChannelError::InvalidState("not reconnecting".into()));
        };
        let response = self
            .runner
            .authenticate_and_resume_session(payload, previous_key)?;
        if response.state != HandshakeState::Finished {
            return Err(ChannelError::InvalidState(format!(
                "handshake not finished after resumption: {}",
                response.state
            )));
        }
        let key = response.key.ok_or_else(|| {
            ChannelError::InvalidEncryptionKey("resumption finished without a key".into())
        })?;
        self.install_key(key)?;
        self.state = HandshakeState::Finished;
        self.established = true;
        info!("session resumed");
        Ok(Vec::new())
    }

    fn on_unique_id(&mut self, payload: &[u8]) -> Result<Vec<DeviceMessage>, ChannelError> {
        let Mode::Associate {
            device_id,
            challenge_secret,
        } = &self.mode
        else {
            return Err(ChannelError::InvalidState("not associating".into()));
        };
        if payload.len() != DEVICE_ID_BYTES {
            return Err(ChannelError::InvalidDeviceId(format!(
                "unique id must be {DEVICE_ID_BYTES} bytes, got {}",
                payload.len()
            )));
        }
        let unique_id = bytes_to_uuid(payload)
            .ok_or_else(|| ChannelError::InvalidDeviceId("undecodable unique id".into()))?;

        let identity = device_message(*device_id, challenge_secret);
        let sealed = self
            .established_or_pending_session()?
            .seal(&identity)
            .map_err(|e| ChannelError::InvalidEncryptionKey(e.to_string()))?;

        self.car_unique_id = Some(unique_id);
        self.established = true;
        info!(%unique_id, "associated with head unit");
        Ok(vec![DeviceMessage::handshake(sealed, true)])
    }

    fn install_key(&mut self, key: Key) -> Result<(), ChannelError> {
        let session = CryptoSession::from_key(&key)
            .map_err(|e| ChannelError::InvalidEncryptionKey(e.to_string()))?;
        self.session = Some(session);
        self.key = Some(key);
        Ok(())
    }

    fn established_or_pending_session(&self) -> Result<&CryptoSession, ChannelError> {
        self.session
            .as_ref()
            .ok_or_else(|| ChannelError::InvalidState("no encryption key installed".into()))
    }

    fn established_session(&self) -> Result<&CryptoSession, ChannelError> {
        if !self.established {
            return Err(ChannelError::InvalidState("handshake not complete".into()));
        }
        self.established_or_pending_session()
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.established_or_pending_session()?
            .open(payload)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))
    }
}

impl std::fmt::Debug for Companion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Companion")
            .field("state", &self.state)
            .field("established", &self.established)
            .field("car_unique_id", &self.car_unique_id)
            .finish_non_exhaustive()
    }
}
