//! Scripted collaborators for channel state-machine tests.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use carlink_crypto::{
    CryptoSession, EncryptionRunner, HandshakeError, HandshakeMessage, HandshakeState, KEY_SIZE,
    Key, StoreError,
};
use uuid::Uuid;

use crate::channel::Callback;
use crate::error::{ChannelError, ChannelErrorCode};
use crate::message::{DeviceMessage, MessageStream, OperationType};
use crate::storage::KeyStorage;

pub const DEVICE_ID: &str = "00000000-0000-0000-0000-000000000001";

pub fn session_key() -> Key {
    Key::new([0x5A; KEY_SIZE])
}

pub fn session() -> CryptoSession {
    CryptoSession::from_key(&session_key()).unwrap()
}

/// Everything observable that a channel does, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RunnerCall(&'static str),
    Sent(DeviceMessage, OperationType),
    SavedKey(String, Vec<u8>),
    SavedSecret(String, Vec<u8>),
    Removed(String),
    CodeShown(String),
    DeviceIdReceived(String),
    Established,
    Failure(ChannelErrorCode),
    MessageReceived(Vec<u8>),
    MessageError(ChannelErrorCode),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<DeviceMessage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sent(msg, _) => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn failures(&self) -> Vec<ChannelErrorCode> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Failure(code) => Some(code),
                _ => None,
            })
            .collect()
    }

    pub fn saved_anything(&self) -> bool {
        self.count(|e| matches!(e, Event::SavedKey(..) | Event::SavedSecret(..))) > 0
    }
}

/// Runner that replays canned responses in call order.
pub struct ScriptedRunner {
    log: EventLog,
    script: VecDeque<Result<HandshakeMessage, HandshakeError>>,
    pub is_reconnect: Arc<Mutex<Option<bool>>>,
}

impl ScriptedRunner {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            script: VecDeque::new(),
            is_reconnect: Arc::default(),
        }
    }

    #[must_use]
    pub fn then(mut self, response: HandshakeMessage) -> Self {
        self.script.push_back(Ok(response));
        self
    }

    #[must_use]
    pub fn then_err(mut self, error: HandshakeError) -> Self {
        self.script.push_back(Err(error));
        self
    }

    fn next(&mut self, operation: &'static str) -> Result<HandshakeMessage, HandshakeError> {
        self.log.push(Event::RunnerCall(operation));
        self.script
            .pop_front()
            .unwrap_or(Err(HandshakeError::UnexpectedCall {
                operation,
                phase: "script_exhausted",
            }))
    }
}

impl EncryptionRunner for ScriptedRunner {
    fn init_handshake(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        self.next("init_handshake")
    }

    fn respond_to_init_request(
        &mut self,
        _message: &[u8],
    ) -> Result<HandshakeMessage, HandshakeError> {
        self.next("respond_to_init_request")
    }

    fn continue_handshake(&mut self, _message: &[u8]) -> Result<HandshakeMessage, HandshakeError> {
        self.next("continue_handshake")
    }

    fn verify_pin(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        self.next("verify_pin")
    }

    fn init_reconnect_authentication(
        &mut self,
        _previous_key: &Key,
    ) -> Result<HandshakeMessage, HandshakeError> {
        self.next("init_reconnect_authentication")
    }

    fn authenticate_and_resume_session(
        &mut self,
        _message: &[u8],
        _previous_key: &Key,
    ) -> Result<HandshakeMessage, HandshakeError> {
        self.next("authenticate_and_resume_session")
    }

    fn set_is_reconnect(&mut self, is_reconnect: bool) {
        *self.is_reconnect.lock().unwrap() = Some(is_reconnect);
    }
}

pub struct RecordingStream(pub EventLog);

impl MessageStream for RecordingStream {
    fn write_message(&mut self, message: DeviceMessage, operation: OperationType) {
        self.0.push(Event::Sent(message, operation));
    }
}

/// Storage that logs writes and can be told to reject challenge secrets.
pub struct RecordingStorage {
    log: EventLog,
    unique_id: Uuid,
    keys: HashMap<String, Key>,
    pub reject_secrets: bool,
}

impl RecordingStorage {
    pub fn new(log: &EventLog, unique_id: Uuid) -> Self {
        Self {
            log: log.clone(),
            unique_id,
            keys: HashMap::new(),
            reject_secrets: false,
        }
    }

    #[must_use]
    pub fn with_key(mut self, device_id: &str, key: Key) -> Self {
        self.keys.insert(device_id.to_string(), key);
        self
    }
}

impl KeyStorage for RecordingStorage {
    fn save_encryption_key(&mut self, device_id: &str, key: &Key) -> Result<(), StoreError> {
        self.log
            .push(Event::SavedKey(device_id.to_string(), key.as_bytes().to_vec()));
        self.keys.insert(device_id.to_string(), key.clone());
        Ok(())
    }

    fn encryption_key(&self, device_id: &str) -> Option<Key> {
        self.keys.get(device_id).cloned()
    }

    fn save_challenge_secret(
        &mut self,
        device_id: &str,
        secret: &[u8],
    ) -> Result<(), StoreError> {
        if self.reject_secrets {
            return Err(StoreError::InvalidInput("rejected".into()));
        }
        self.log
            .push(Event::SavedSecret(device_id.to_string(), secret.to_vec()));
        Ok(())
    }

    fn remove(&mut self, device_id: &str) -> Result<bool, StoreError> {
        self.log.push(Event::Removed(device_id.to_string()));
        Ok(self.keys.remove(device_id).is_some())
    }

    fn unique_id(&mut self) -> Result<Uuid, StoreError> {
        Ok(self.unique_id)
    }
}

pub struct RecordingCallback(pub EventLog);

impl Callback for RecordingCallback {
    fn on_secure_channel_established(&mut self) {
        self.0.push(Event::Established);
    }

    fn on_secure_channel_failure(&mut self, error: &ChannelError) {
        self.0.push(Event::Failure(error.code()));
    }

    fn on_device_id_received(&mut self, device_id: &str) {
        self.0.push(Event::DeviceIdReceived(device_id.to_string()));
    }

    fn on_message_received(&mut self, message: DeviceMessage) {
        self.0.push(Event::MessageReceived(message.payload));
    }

    fn on_message_received_error(&mut self, error: &ChannelError) {
        self.0.push(Event::MessageError(error.code()));
    }
}

pub fn in_progress(next: &[u8]) -> HandshakeMessage {
    HandshakeMessage::new(HandshakeState::InProgress).with_next_message(next.to_vec())
}
