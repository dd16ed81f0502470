//! UKEY2-style key agreement.
//!
//! Three messages, each prefixed with [`PROTOCOL_VERSION`]:
//!
//! ```text
//! initiator (phone)                          responder (car)
//!   ClientInit   = ver | random(32) | SHA-256(ClientFinish)  ->
//!             <-  ServerInit = ver | random(32) | server_pub(32)
//!   ClientFinish = ver | client_pub(32)                      ->
//! ```
//!
//! The initiator commits to its ephemeral key before seeing the responder's,
//! so neither side can grind the resulting verification code. After the
//! exchange both sides run X25519 and derive, with HKDF-SHA256 over
//! `ClientInit | ServerInit`, an auth string (shown to the user) and the
//! next-protocol secret (the session key once the user confirms).

use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, HandshakeError};
use crate::runner::{EncryptionRunner, HandshakeMessage, HandshakeState, KEY_SIZE, Key};
use crate::verification::{constant_time_eq, numeric_code};

/// Wire version of every handshake message.
pub const PROTOCOL_VERSION: u8 = 1;

const RANDOM_LEN: usize = 32;
const PUBLIC_KEY_LEN: usize = 32;
const COMMITMENT_LEN: usize = 32;
const CLIENT_INIT_LEN: usize = 1 + RANDOM_LEN + COMMITMENT_LEN;
const SERVER_INIT_LEN: usize = 1 + RANDOM_LEN + PUBLIC_KEY_LEN;
const CLIENT_FINISH_LEN: usize = 1 + PUBLIC_KEY_LEN;

const AUTH_SALT: &[u8] = b"carlink-ukey2-v1-auth";
const NEXT_SALT: &[u8] = b"carlink-ukey2-v1-next";
const RESUME_KEY_INFO: &[u8] = b"carlink-ukey2-v1-resume-key";
const CLIENT_RESUME_LABEL: &[u8] = b"CLIENT";
const SERVER_RESUME_LABEL: &[u8] = b"SERVER";

/// Which side of the handshake a runner plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends `ClientInit`; the phone.
    Initiator,
    /// Answers with `ServerInit`; the head unit.
    Responder,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct Secrets {
    auth: [u8; 32],
    next: [u8; KEY_SIZE],
}

enum Phase {
    Idle,
    SentClientInit {
        secret: StaticSecret,
        client_init: Vec<u8>,
        client_finish: Vec<u8>,
    },
    SentServerInit {
        secret: StaticSecret,
        client_init: Vec<u8>,
        server_init: Vec<u8>,
        commitment: [u8; COMMITMENT_LEN],
    },
    AwaitingVerification(Secrets),
    Resuming(Secrets),
    Finished,
    Failed,
}

impl Phase {
    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SentClientInit { .. } => "sent_client_init",
            Self::SentServerInit { .. } => "sent_server_init",
            Self::AwaitingVerification(_) => "awaiting_verification",
            Self::Resuming(_) => "resuming",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// UKEY2-style [`EncryptionRunner`].
pub struct Ukey2Runner {
    role: Role,
    phase: Phase,
    is_reconnect: bool,
    out_of_band: bool,
    code_digits: u8,
}

impl std::fmt::Debug for Ukey2Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ukey2Runner")
            .field("role", &self.role)
            .field("phase", &self.phase.name())
            .field("is_reconnect", &self.is_reconnect)
            .field("out_of_band", &self.out_of_band)
            .finish()
    }
}

impl Ukey2Runner {
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            phase: Phase::Idle,
            is_reconnect: false,
            out_of_band: false,
            code_digits: 6,
        }
    }

    /// Runner for the phone side.
    pub const fn initiator() -> Self {
        Self::new(Role::Initiator)
    }

    /// Runner for the head-unit side.
    pub const fn responder() -> Self {
        Self::new(Role::Responder)
    }

    /// Report raw auth bytes for out-of-band verification instead of a numeric code.
    #[must_use]
    pub const fn with_out_of_band(mut self, out_of_band: bool) -> Self {
        self.out_of_band = out_of_band;
        self
    }

    #[must_use]
    pub const fn with_code_digits(mut self, digits: u8) -> Self {
        self.code_digits = digits;
        self
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    fn unexpected(&self, operation: &'static str) -> HandshakeError {
        HandshakeError::UnexpectedCall {
            operation,
            phase: self.phase.name(),
        }
    }

    /// Build the message reported once both sides hold the shared secrets.
    fn after_key_agreement(&mut self, secrets: Secrets, next: Option<Vec<u8>>) -> HandshakeMessage {
        let mut msg = if self.is_reconnect {
            HandshakeMessage::new(HandshakeState::ResumingSession)
        } else if self.out_of_band {
            HandshakeMessage::new(HandshakeState::OobVerificationNeeded)
                .with_oob_verification_code(secrets.auth.to_vec())
        } else {
            let msg = HandshakeMessage::new(HandshakeState::VerificationNeeded);
            match numeric_code(&secrets.auth, self.code_digits) {
                Some(code) => msg.with_verification_code(code),
                None => msg,
            }
        };
        if let Some(bytes) = next {
            msg = msg.with_next_message(bytes);
        }
        self.phase = if self.is_reconnect {
            Phase::Resuming(secrets)
        } else {
            Phase::AwaitingVerification(secrets)
        };
        debug!(role = ?self.role, state = %msg.state, "key agreement complete");
        msg
    }
}

impl EncryptionRunner for Ukey2Runner {
    fn init_handshake(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        if self.role != Role::Initiator || !matches!(self.phase, Phase::Idle) {
            return Err(self.unexpected("init_handshake"));
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut client_finish = Vec::with_capacity(CLIENT_FINISH_LEN);
        client_finish.push(PROTOCOL_VERSION);
        client_finish.extend_from_slice(public.as_bytes());

        let mut client_init = Vec::with_capacity(CLIENT_INIT_LEN);
        client_init.push(PROTOCOL_VERSION);
        client_init.extend_from_slice(&random_bytes());
        client_init.extend_from_slice(&Sha256::digest(&client_finish));

        self.phase = Phase::SentClientInit {
            secret,
            client_init: client_init.clone(),
            client_finish,
        };
        debug!("sent client init");
        Ok(HandshakeMessage::new(HandshakeState::InProgress).with_next_message(client_init))
    }

    fn respond_to_init_request(
        &mut self,
        message: &[u8],
    ) -> Result<HandshakeMessage, HandshakeError> {
        if self.role != Role::Responder || !matches!(self.phase, Phase::Idle) {
            return Err(self.unexpected("respond_to_init_request"));
        }
        self.phase = Phase::Failed;
        check_frame(message, CLIENT_INIT_LEN, "client init")?;

        let mut commitment = [0u8; COMMITMENT_LEN];
        commitment.copy_from_slice(&message[1 + RANDOM_LEN..]);

        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut server_init = Vec::with_capacity(SERVER_INIT_LEN);
        server_init.push(PROTOCOL_VERSION);
        server_init.extend_from_slice(&random_bytes());
        server_init.extend_from_slice(public.as_bytes());

        self.phase = Phase::SentServerInit {
            secret,
            client_init: message.to_vec(),
            server_init: server_init.clone(),
            commitment,
        };
        debug!("sent server init");
        Ok(HandshakeMessage::new(HandshakeState::InProgress).with_next_message(server_init))
    }

    fn continue_handshake(&mut self, message: &[u8]) -> Result<HandshakeMessage, HandshakeError> {
        match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::SentServerInit {
                secret,
                client_init,
                server_init,
                commitment,
            } if self.role == Role::Responder => {
                check_frame(message, CLIENT_FINISH_LEN, "client finish")?;
                if !constant_time_eq(&Sha256::digest(message), &commitment) {
                    return Err(HandshakeError::CommitmentMismatch);
                }
                let peer = public_key_at(message, 1);
                let shared = secret.diffie_hellman(&peer);
                let secrets = derive_secrets(shared.as_bytes(), &client_init, &server_init)?;
                Ok(self.after_key_agreement(secrets, None))
            }
            Phase::SentClientInit {
                secret,
                client_init,
                client_finish,
            } if self.role == Role::Initiator => {
                check_frame(message, SERVER_INIT_LEN, "server init")?;
                let peer = public_key_at(message, 1 + RANDOM_LEN);
                let shared = secret.diffie_hellman(&peer);
                let secrets = derive_secrets(shared.as_bytes(), &client_init, message)?;
                Ok(self.after_key_agreement(secrets, Some(client_finish)))
            }
            other => {
                self.phase = other;
                Err(self.unexpected("continue_handshake"))
            }
        }
    }

    fn verify_pin(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::AwaitingVerification(secrets) => {
                self.phase = Phase::Finished;
                debug!(role = ?self.role, "verification accepted");
                Ok(HandshakeMessage::new(HandshakeState::Finished).with_key(Key::new(secrets.next)))
            }
            other => {
                self.phase = other;
                Err(self.unexpected("verify_pin"))
            }
        }
    }

    fn init_reconnect_authentication(
        &mut self,
        previous_key: &Key,
    ) -> Result<HandshakeMessage, HandshakeError> {
        match &self.phase {
            Phase::Resuming(secrets) if self.role == Role::Initiator => {
                let mac = resume_mac(previous_key, &secrets.auth, CLIENT_RESUME_LABEL)?;
                Ok(HandshakeMessage::new(HandshakeState::ResumingSession)
                    .with_next_message(mac.to_vec()))
            }
            _ => Err(self.unexpected("init_reconnect_authentication")),
        }
    }

    fn authenticate_and_resume_session(
        &mut self,
        message: &[u8],
        previous_key: &Key,
    ) -> Result<HandshakeMessage, HandshakeError> {
        let Phase::Resuming(secrets) = std::mem::replace(&mut self.phase, Phase::Failed) else {
            return Err(HandshakeError::UnexpectedCall {
                operation: "authenticate_and_resume_session",
                phase: "not_resuming",
            });
        };

        let (peer_label, own_label) = match self.role {
            Role::Responder => (CLIENT_RESUME_LABEL, SERVER_RESUME_LABEL),
            Role::Initiator => (SERVER_RESUME_LABEL, CLIENT_RESUME_LABEL),
        };
        let expected = resume_mac(previous_key, &secrets.auth, peer_label)?;
        if !constant_time_eq(message, &expected) {
            return Err(HandshakeError::ResumeAuthenticationFailed);
        }

        let key = resumed_key(previous_key, &secrets.next)?;
        let mut msg = HandshakeMessage::new(HandshakeState::Finished).with_key(key);
        if self.role == Role::Responder {
            let mac = resume_mac(previous_key, &secrets.auth, own_label)?;
            msg = msg.with_next_message(mac.to_vec());
        }
        self.phase = Phase::Finished;
        debug!(role = ?self.role, "session resumed");
        Ok(msg)
    }

    fn set_is_reconnect(&mut self, is_reconnect: bool) {
        self.is_reconnect = is_reconnect;
    }
}

fn random_bytes() -> [u8; RANDOM_LEN] {
    let mut bytes = [0u8; RANDOM_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn check_frame(message: &[u8], expected_len: usize, what: &str) -> Result<(), HandshakeError> {
    if message.len() != expected_len {
        return Err(HandshakeError::MalformedMessage(format!(
            "{what}: expected {expected_len} bytes, got {}",
            message.len()
        )));
    }
    match message.first() {
        Some(&PROTOCOL_VERSION) => Ok(()),
        Some(&other) => Err(HandshakeError::UnsupportedVersion(other)),
        None => Err(HandshakeError::MalformedMessage(format!("{what}: empty"))),
    }
}

/// Read a public key at `offset`; callers have already checked the frame length.
fn public_key_at(message: &[u8], offset: usize) -> PublicKey {
    let mut arr = [0u8; PUBLIC_KEY_LEN];
    arr.copy_from_slice(&message[offset..offset + PUBLIC_KEY_LEN]);
    PublicKey::from(arr)
}

fn derive_secrets(
    shared: &[u8; 32],
    client_init: &[u8],
    server_init: &[u8],
) -> Result<Secrets, CryptoError> {
    let transcript = [client_init, server_init].concat();
    let mut secrets = Secrets {
        auth: [0u8; 32],
        next: [0u8; KEY_SIZE],
    };
    Hkdf::<Sha256>::new(Some(AUTH_SALT), shared)
        .expand(&transcript, &mut secrets.auth)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Hkdf::<Sha256>::new(Some(NEXT_SALT), shared)
        .expand(&transcript, &mut secrets.next)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(secrets)
}

/// PRF keyed by the previous session key, bound to this handshake's auth string.
fn resume_mac(previous_key: &Key, auth: &[u8; 32], label: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = [0u8; 32];
    Hkdf::<Sha256>::new(Some(previous_key.as_bytes().as_slice()), auth)
        .expand(label, &mut mac)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(mac)
}

fn resumed_key(previous_key: &Key, next: &[u8; KEY_SIZE]) -> Result<Key, CryptoError> {
    let mut bytes = [0u8; KEY_SIZE];
    Hkdf::<Sha256>::new(Some(previous_key.as_bytes().as_slice()), next)
        .expand(RESUME_KEY_INFO, &mut bytes)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    let key = Key::new(bytes);
    bytes.zeroize();
    Ok(key)
}

/// Create an initiator/responder pair with matching settings.
#[cfg(any(test, feature = "test-utils"))]
pub fn paired_runners(is_reconnect: bool, out_of_band: bool) -> (Ukey2Runner, Ukey2Runner) {
    let mut initiator = Ukey2Runner::initiator().with_out_of_band(out_of_band);
    let mut responder = Ukey2Runner::responder().with_out_of_band(out_of_band);
    initiator.set_is_reconnect(is_reconnect);
    responder.set_is_reconnect(is_reconnect);
    (initiator, responder)
}

/// Drive both runners through the three key-agreement messages.
///
/// Returns the initiator's and the responder's final step.
#[cfg(any(test, feature = "test-utils"))]
pub fn run_to_verification(
    initiator: &mut Ukey2Runner,
    responder: &mut Ukey2Runner,
) -> Result<(HandshakeMessage, HandshakeMessage), HandshakeError> {
    let client_init = initiator.init_handshake()?.next_message.unwrap_or_default();
    let server_init = responder
        .respond_to_init_request(&client_init)?
        .next_message
        .unwrap_or_default();
    let initiator_msg = initiator.continue_handshake(&server_init)?;
    let client_finish = initiator_msg.next_message.clone().unwrap_or_default();
    let responder_msg = responder.continue_handshake(&client_finish)?;
    Ok((initiator_msg, responder_msg))
}
