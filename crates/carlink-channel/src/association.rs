//! Association flavor: pairing a phone that has never been seen before.
//!
//! ```text
//! UNKNOWN      --init request-->       respond, send reply     -> runner state
//! IN_PROGRESS  --client finish-->      show verification code  -> (OOB_)VERIFICATION_NEEDED
//! (user)       notify_out_of_band_accepted: verify pin, install key,
//!                                      send unique id (encrypted) -> FINISHED
//! FINISHED     --device id + secret--> persist key and secret  -> established
//! ```
//!
//! The session key is held as a [`PendingPairing`] between verification and
//! the phone's identity message, so it is only persisted once a device id is
//! known. The pending pairing is dropped on success and on any failure.

use carlink_crypto::{EncryptionRunner, HandshakeState, Key, oob_code_display};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelCore, HandshakeFlavor, SecureChannel};
use crate::device_id::{split_device_message, uuid_to_bytes};
use crate::error::ChannelError;
use crate::message::MessageStream;
use crate::storage::KeyStorage;

/// Receives the code the user must compare on both devices.
pub trait ShowVerificationCodeListener: Send {
    fn show_verification_code(&mut self, code: &str);
}

impl<F: FnMut(&str) + Send> ShowVerificationCodeListener for F {
    fn show_verification_code(&mut self, code: &str) {
        self(code);
    }
}

/// A verified session key waiting for the phone to identify itself.
struct PendingPairing {
    key: Key,
}

/// Handshake flavor for first-time association.
#[derive(Default)]
pub struct Association {
    listener: Option<Box<dyn ShowVerificationCodeListener>>,
    pending: Option<PendingPairing>,
    device_id: Option<Uuid>,
}

impl Association {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the associated device, once received.
    pub const fn device_id(&self) -> Option<Uuid> {
        self.device_id
    }

    pub const fn has_pending_key(&self) -> bool {
        self.pending.is_some()
    }

    fn show_code(&mut self, code: &str) -> Result<(), ChannelError> {
        let listener = self.listener.as_mut().ok_or_else(|| {
            ChannelError::InvalidState("no verification code listener registered".into())
        })?;
        debug!(code, "showing verification code");
        listener.show_verification_code(code);
        Ok(())
    }

    fn process_init(core: &mut ChannelCore, message: &[u8]) -> Result<(), ChannelError> {
        debug!("responding to handshake init request");
        let response = core.runner().respond_to_init_request(message)?;
        let next = response.next_message.ok_or_else(|| {
            ChannelError::InvalidState("runner produced no reply to the init request".into())
        })?;
        core.set_state(response.state);
        core.send_handshake_message(next, false)
    }

    fn process_in_progress(
        &mut self,
        core: &mut ChannelCore,
        message: &[u8],
    ) -> Result<(), ChannelError> {
        debug!("continuing handshake");
        let response = core.runner().continue_handshake(message)?;
        match response.state {
            HandshakeState::VerificationNeeded => {
                let code = response.verification_code.ok_or_else(|| {
                    ChannelError::InvalidVerification("runner produced no verification code".into())
                })?;
                core.set_state(response.state);
                self.show_code(&code)
            }
            HandshakeState::OobVerificationNeeded => {
                let code = response
                    .oob_verification_code
                    .filter(|code| !code.is_empty())
                    .ok_or_else(|| {
                        ChannelError::InvalidVerification(
                            "runner produced no out-of-band verification code".into(),
                        )
                    })?;
                core.set_state(response.state);
                self.show_code(&oob_code_display(&code))
            }
            other => Err(ChannelError::InvalidState(format!(
                "unexpected runner state {other} while continuing the handshake"
            ))),
        }
    }

    fn process_device_id(
        &mut self,
        core: &mut ChannelCore,
        message: &[u8],
    ) -> Result<(), ChannelError> {
        let pending = self.pending.take().ok_or_else(|| {
            ChannelError::InvalidState("device id received without a verified key".into())
        })?;
        let (id, secret) = split_device_message(message)
            .map_err(|e| ChannelError::InvalidDeviceId(e.to_string()))?;
        let device_id = id.to_string();
        core.notify_device_id_received(&device_id);

        core.storage().check_challenge_secret(secret)?;
        let previous_key = core.storage().encryption_key(&device_id);
        core.storage().save_encryption_key(&device_id, &pending.key)?;
        if let Err(err) = core.storage().save_challenge_secret(&device_id, secret) {
            Self::roll_back_key(core, &device_id, previous_key);
            return Err(err.into());
        }
        self.device_id = Some(id);
        info!(device_id, "device associated");
        core.notify_established();
        Ok(())
    }

    /// Undo a key write whose challenge secret was refused.
    fn roll_back_key(core: &mut ChannelCore, device_id: &str, previous_key: Option<Key>) {
        let restored = match previous_key {
            Some(key) => core.storage().save_encryption_key(device_id, &key),
            None => core.storage().remove(device_id).map(|_| ()),
        };
        if let Err(err) = restored {
            warn!(device_id, error = %err, "failed to roll back encryption key");
        }
    }

    fn accept_verification(&mut self, core: &mut ChannelCore) -> Result<(), ChannelError> {
        if self.listener.is_none() {
            return Err(ChannelError::InvalidState(
                "verification accepted with no listener registered".into(),
            ));
        }
        let response = core
            .runner()
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

        core.set_state(HandshakeState::Finished);
        core.set_encryption_key(&key)?;
        self.pending = Some(PendingPairing { key });
        debug!("verification code accepted");

        let unique_id = core.storage().unique_id()?;
        debug!(%unique_id, "sending unique id to device");
        core.send_handshake_message(uuid_to_bytes(unique_id).to_vec(), true)
    }
}

impl HandshakeFlavor for Association {
    fn name(&self) -> &'static str {
        "association"
    }

    fn prepare_runner(&self, runner: &mut dyn EncryptionRunner) {
        runner.set_is_reconnect(false);
    }

    fn process_handshake(
        &mut self,
        core: &mut ChannelCore,
        message: &[u8],
    ) -> Result<(), ChannelError> {
        match core.state() {
            HandshakeState::Unknown => Self::process_init(core, message),
            HandshakeState::InProgress => self.process_in_progress(core, message),
            HandshakeState::Finished => self.process_device_id(core, message),
            other => Err(ChannelError::InvalidState(format!(
                "unexpected handshake message in state {other}"
            ))),
        }
    }

    fn abort(&mut self) {
        self.pending = None;
    }
}

impl SecureChannel<Association> {
    /// Channel for associating a new device.
    pub fn association(
        stream: impl MessageStream + 'static,
        runner: impl EncryptionRunner + 'static,
        storage: impl KeyStorage + 'static,
    ) -> Self {
        Self::new(stream, runner, storage, Association::new())
    }

    /// Set the listener that displays verification codes; `None` clears it.
    pub fn set_show_verification_code_listener(
        &mut self,
        listener: Option<Box<dyn ShowVerificationCodeListener>>,
    ) {
        self.flavor.listener = listener;
    }

    /// The user confirmed the verification code (or the out-of-band exchange).
    pub fn notify_out_of_band_accepted(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.is_failed() || self.is_established() {
            debug!("ignoring verification acceptance on settled channel");
            return;
        }
        if let Err(err) = self.flavor.accept_verification(&mut self.core) {
            self.fail(&err);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::{Arc, Mutex};

    use carlink_crypto::{HandshakeError, HandshakeMessage};

    use super::*;
    use crate::device_id::device_message;
    use crate::error::ChannelErrorCode;
    use crate::message::{DeviceMessage, OperationType};
    use crate::test_support::{
        DEVICE_ID, Event, EventLog, RecordingCallback, RecordingStorage, RecordingStream,
        ScriptedRunner, in_progress, session, session_key,
    };

    const UNIQUE_ID: Uuid = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);

    fn verification_needed(code: &str) -> HandshakeMessage {
        HandshakeMessage::new(HandshakeState::VerificationNeeded)
            .with_verification_code(code.to_string())
    }

    fn finished() -> HandshakeMessage {
        HandshakeMessage::new(HandshakeState::Finished).with_key(session_key())
    }

    fn channel(log: &EventLog, runner: ScriptedRunner) -> SecureChannel<Association> {
        channel_with_storage(log, runner, RecordingStorage::new(log, UNIQUE_ID))
    }

    fn channel_with_storage(
        log: &EventLog,
        runner: ScriptedRunner,
        storage: RecordingStorage,
    ) -> SecureChannel<Association> {
        let mut channel =
            SecureChannel::association(RecordingStream(log.clone()), runner, storage);
        channel.set_callback(RecordingCallback(log.clone()));
        let codes = log.clone();
        channel.set_show_verification_code_listener(Some(Box::new(move |code: &str| {
            codes.push(Event::CodeShown(code.to_string()));
        })));
        channel
    }

    /// Channel that has shown `123456` and is waiting for the user.
    fn verified_runner(log: &EventLog) -> ScriptedRunner {
        ScriptedRunner::new(log)
            .then(in_progress(b"server init"))
            .then(verification_needed("123456"))
            .then(finished())
    }

    fn identity_message() -> Vec<u8> {
        device_message(Uuid::parse_str(DEVICE_ID).unwrap(), &[0xAA, 0xBB])
    }

    #[test]
    fn runner_is_put_in_association_mode() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log);
        let flag = Arc::clone(&runner.is_reconnect);
        let _channel = channel(&log, runner);
        assert_eq!(*flag.lock().unwrap(), Some(false));
    }

    #[test]
    fn init_request_sends_exactly_one_unencrypted_reply() {
        let log = EventLog::default();
        let mut channel = channel(&log, ScriptedRunner::new(&log).then(in_progress(b"reply")));

        channel.process_handshake(b"client init");

        assert_eq!(channel.state(), HandshakeState::InProgress);
        let sent = log.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], DeviceMessage::handshake(b"reply".to_vec(), false));
        assert!(log.failures().is_empty());
    }

    #[test]
    fn init_state_follows_the_runner() {
        let log = EventLog::default();
        let reply = HandshakeMessage::new(HandshakeState::VerificationNeeded)
            .with_next_message(vec![9]);
        let mut channel = channel(&log, ScriptedRunner::new(&log).then(reply));

        channel.process_handshake(b"client init");
        assert_eq!(channel.state(), HandshakeState::VerificationNeeded);
    }

    #[test]
    fn verification_code_is_shown_exactly_once() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        assert_eq!(channel.state(), HandshakeState::VerificationNeeded);
        assert_eq!(log.count(|e| matches!(e, Event::CodeShown(_))), 1);
        assert!(log.events().contains(&Event::CodeShown("123456".into())));
    }

    #[test]
    fn oob_code_is_shown_as_hex() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log)
            .then(in_progress(b"server init"))
            .then(
                HandshakeMessage::new(HandshakeState::OobVerificationNeeded)
                    .with_oob_verification_code(vec![0xca, 0xfe]),
            );
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        assert_eq!(channel.state(), HandshakeState::OobVerificationNeeded);
        assert!(log.events().contains(&Event::CodeShown("cafe".into())));
    }

    #[test]
    fn missing_code_fails_with_invalid_verification() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log)
            .then(in_progress(b"server init"))
            .then(HandshakeMessage::new(HandshakeState::VerificationNeeded));
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidVerification]);
        assert_eq!(channel.state(), HandshakeState::InProgress);
        assert!(channel.is_failed());
    }

    #[test]
    fn missing_oob_code_fails_with_invalid_verification() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log)
            .then(in_progress(b"server init"))
            .then(HandshakeMessage::new(HandshakeState::OobVerificationNeeded));
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidVerification]);
        assert_eq!(channel.state(), HandshakeState::InProgress);
    }

    #[test]
    fn unexpected_runner_state_fails_with_invalid_state() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log)
            .then(in_progress(b"server init"))
            .then(HandshakeMessage::new(HandshakeState::Finished));
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidState]);
    }

    #[test]
    fn runner_error_fails_with_invalid_handshake() {
        let log = EventLog::default();
        let runner =
            ScriptedRunner::new(&log).then_err(HandshakeError::MalformedMessage("short".into()));
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"garbage");

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidHandshake]);
        assert!(log.sent().is_empty());
    }

    #[test]
    fn message_while_awaiting_verification_is_invalid_state() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.process_handshake(b"unexpected");

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidState]);
    }

    #[test]
    fn missing_listener_fails_when_showing_code() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));
        channel.set_show_verification_code_listener(None);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidState]);
    }

    #[test]
    fn accepting_without_listener_is_invalid_state() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));
        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        channel.set_show_verification_code_listener(None);
        channel.notify_out_of_band_accepted();

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidState]);
        assert_eq!(
            log.count(|e| *e == Event::RunnerCall("verify_pin")),
            0,
            "runner must not be asked to verify"
        );
    }

    #[test]
    fn verify_pin_not_finished_is_invalid_state_and_nothing_persisted() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log)
            .then(in_progress(b"server init"))
            .then(verification_needed("123456"))
            .then(HandshakeMessage::new(HandshakeState::InProgress).with_key(session_key()));
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidState]);
        assert!(!log.saved_anything());
        assert!(!channel.flavor().has_pending_key());
    }

    #[test]
    fn verify_pin_error_is_invalid_verification() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log)
            .then(in_progress(b"server init"))
            .then(verification_needed("123456"))
            .then_err(HandshakeError::UnexpectedCall {
                operation: "verify_pin",
                phase: "failed",
            });
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidVerification]);
    }

    #[test]
    fn finished_without_key_is_invalid_encryption_key() {
        let log = EventLog::default();
        let runner = ScriptedRunner::new(&log)
            .then(in_progress(b"server init"))
            .then(verification_needed("123456"))
            .then(HandshakeMessage::new(HandshakeState::Finished));
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();

        assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidEncryptionKey]);
        assert_eq!(channel.state(), HandshakeState::VerificationNeeded);
    }

    #[test]
    fn acceptance_sends_encrypted_unique_id() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();

        assert_eq!(channel.state(), HandshakeState::Finished);
        assert!(channel.flavor().has_pending_key());
        let sent = log.sent();
        assert_eq!(sent.len(), 2);
        let unique_id_msg = &sent[1];
        assert!(unique_id_msg.is_encrypted);
        assert!(unique_id_msg.recipient.is_none());
        let plaintext = session().open(&unique_id_msg.payload).unwrap();
        assert_eq!(plaintext, UNIQUE_ID.as_bytes());
        assert!(!log.saved_anything(), "key must wait for the device id");
    }

    #[test]
    fn device_id_persists_and_establishes_in_order() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());

        let tail: Vec<Event> = log
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::DeviceIdReceived(_)
                        | Event::SavedKey(..)
                        | Event::SavedSecret(..)
                        | Event::Established
                        | Event::Failure(_)
                )
            })
            .collect();
        assert_eq!(
            tail,
            vec![
                Event::DeviceIdReceived(DEVICE_ID.into()),
                Event::SavedKey(DEVICE_ID.into(), session_key().as_bytes().to_vec()),
                Event::SavedSecret(DEVICE_ID.into(), vec![0xAA, 0xBB]),
                Event::Established,
            ]
        );
        assert!(channel.is_established());
        assert!(!channel.flavor().has_pending_key());
        assert_eq!(
            channel.flavor().device_id(),
            Some(Uuid::parse_str(DEVICE_ID).unwrap())
        );
    }

    #[test]
    fn encrypted_identity_message_is_decrypted_first() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        let sealed = session().seal(&identity_message()).unwrap();
        channel.on_message_received(
            DeviceMessage::handshake(sealed, true),
            OperationType::EncryptionHandshake,
        );

        assert!(channel.is_established());
        assert!(log.events().contains(&Event::SavedSecret(DEVICE_ID.into(), vec![0xAA, 0xBB])));
    }

    #[test]
    fn short_device_id_never_persists_a_key() {
        for bad in [&[][..], &[1u8; 15][..], &[0u8; 18][..]] {
            let log = EventLog::default();
            let mut channel = channel(&log, verified_runner(&log));

            channel.process_handshake(b"client init");
            channel.process_handshake(b"client finish");
            channel.notify_out_of_band_accepted();
            channel.process_handshake(bad);

            assert_eq!(log.failures(), vec![ChannelErrorCode::InvalidDeviceId]);
            assert!(!log.saved_anything());
            assert!(!channel.flavor().has_pending_key());
            assert_eq!(log.count(|e| matches!(e, Event::DeviceIdReceived(_))), 0);
        }
    }

    #[test]
    fn rejected_challenge_secret_is_storage_error() {
        let log = EventLog::default();
        let mut storage = RecordingStorage::new(&log, UNIQUE_ID);
        storage.reject_secrets = true;
        let mut channel = channel_with_storage(&log, verified_runner(&log), storage);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());

        assert_eq!(log.failures(), vec![ChannelErrorCode::StorageError]);
        assert_eq!(log.count(|e| *e == Event::Established), 0);
        let events = log.events();
        let saved = events
            .iter()
            .position(|e| matches!(e, Event::SavedKey(..)))
            .unwrap();
        let removed = events
            .iter()
            .position(|e| *e == Event::Removed(DEVICE_ID.into()))
            .unwrap();
        assert!(saved < removed);
    }

    #[test]
    fn rejected_challenge_secret_restores_previous_key() {
        let log = EventLog::default();
        let old_key = Key::new([0x11; 32]);
        let mut storage =
            RecordingStorage::new(&log, UNIQUE_ID).with_key(DEVICE_ID, old_key.clone());
        storage.reject_secrets = true;
        let mut channel = channel_with_storage(&log, verified_runner(&log), storage);

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());

        assert_eq!(log.failures(), vec![ChannelErrorCode::StorageError]);
        let saved: Vec<Vec<u8>> = log
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::SavedKey(_, key) => Some(key),
                _ => None,
            })
            .collect();
        assert_eq!(
            saved,
            vec![session_key().as_bytes().to_vec(), old_key.as_bytes().to_vec()]
        );
        assert_eq!(log.count(|e| matches!(e, Event::Removed(_))), 0);
    }

    #[test]
    fn no_callback_fires_twice() {
        let log = EventLog::default();
        let runner =
            ScriptedRunner::new(&log).then_err(HandshakeError::MalformedMessage("bad".into()));
        let mut channel = channel(&log, runner);

        channel.process_handshake(b"garbage");
        channel.process_handshake(b"more garbage");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());

        assert_eq!(log.failures().len(), 1);
        assert_eq!(log.count(|e| *e == Event::RunnerCall("respond_to_init_request")), 1);
        assert_eq!(log.count(|e| *e == Event::RunnerCall("verify_pin")), 0);
    }

    #[test]
    fn established_channel_ignores_further_handshake_frames() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());
        channel.process_handshake(&identity_message());
        channel.notify_out_of_band_accepted();

        assert_eq!(log.count(|e| *e == Event::Established), 1);
        assert_eq!(log.count(|e| matches!(e, Event::DeviceIdReceived(_))), 1);
        assert!(log.failures().is_empty());
    }

    #[test]
    fn client_messages_flow_after_establishment() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));

        let early = session().seal(b"too early").unwrap();
        channel.on_message_received(
            DeviceMessage::new(None, true, early),
            OperationType::ClientMessage,
        );
        assert_eq!(
            log.events().last(),
            Some(&Event::MessageError(ChannelErrorCode::InvalidMessage))
        );

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());

        let sealed = session().seal(b"hello car").unwrap();
        channel.on_message_received(
            DeviceMessage::new(Some(UNIQUE_ID), true, sealed),
            OperationType::ClientMessage,
        );
        assert!(log.events().contains(&Event::MessageReceived(b"hello car".to_vec())));

        channel
            .send_client_message(DeviceMessage::new(Some(UNIQUE_ID), true, b"hi".to_vec()))
            .unwrap();
        let Some(Event::Sent(out, OperationType::ClientMessage)) = log.events().pop() else {
            panic!("expected a client message to be sent");
        };
        assert_eq!(out.recipient, Some(UNIQUE_ID));
        assert_eq!(session().open(&out.payload).unwrap(), b"hi");
    }

    #[test]
    fn tampered_message_is_reported_but_not_fatal() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));
        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");
        channel.notify_out_of_band_accepted();
        channel.process_handshake(&identity_message());

        let mut sealed = session().seal(b"payload").unwrap();
        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0x01;
        }
        channel.on_message_received(
            DeviceMessage::new(None, true, sealed),
            OperationType::ClientMessage,
        );

        assert_eq!(
            log.events().last(),
            Some(&Event::MessageError(ChannelErrorCode::InvalidMessage))
        );
        assert!(channel.is_established());
        assert!(log.failures().is_empty());
    }

    #[test]
    fn send_before_establishment_is_rejected() {
        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));
        let result = channel.send_client_message(DeviceMessage::new(None, true, vec![1]));
        assert!(matches!(result, Err(ChannelError::InvalidState(_))));
        assert!(log.sent().is_empty());
    }

    #[test]
    fn listener_accepts_custom_types() {
        struct Collect(Arc<Mutex<Vec<String>>>);
        impl ShowVerificationCodeListener for Collect {
            fn show_verification_code(&mut self, code: &str) {
                self.0.lock().unwrap().push(code.to_string());
            }
        }

        let log = EventLog::default();
        let mut channel = channel(&log, verified_runner(&log));
        let codes = Arc::new(Mutex::new(Vec::new()));
        channel.set_show_verification_code_listener(Some(Box::new(Collect(Arc::clone(&codes)))));

        channel.process_handshake(b"client init");
        channel.process_handshake(b"client finish");

        assert_eq!(*codes.lock().unwrap(), vec!["123456".to_string()]);
    }
}
